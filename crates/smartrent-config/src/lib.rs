//! Shared configuration for SmartRent tools.
//!
//! TOML profiles, credential resolution (env + keyring + plaintext), and
//! translation to `smartrent_core::ControllerConfig`. The CLI layers its
//! flag overrides on top.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use smartrent_core::{ControllerConfig, CoreError, OfflinePolicy, TlsMode};

/// Keyring service name for stored secrets.
pub const KEYRING_SERVICE: &str = "smartrent";

/// Environment prefix for config overrides (`SMARTRENT_DEFAULTS__TIMEOUT=5`).
const ENV_PREFIX: &str = "SMARTRENT_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{name}' not found")]
    ProfileNotFound { name: String, available: Vec<String> },

    #[error("no password configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error(transparent)]
    Controller(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named on the command line.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

impl Config {
    /// The profile name to use, given an optional explicit choice.
    pub fn active_profile_name(&self, requested: Option<&str>) -> String {
        requested
            .map(str::to_owned)
            .or_else(|| self.default_profile.clone())
            .unwrap_or_else(|| "default".into())
    }

    pub fn profile(&self, name: &str) -> Result<&Profile, ConfigError> {
        self.profiles.get(name).ok_or_else(|| {
            let mut available: Vec<String> = self.profiles.keys().cloned().collect();
            available.sort();
            ConfigError::ProfileNotFound {
                name: name.into(),
                available,
            }
        })
    }
}

/// Log verbosity preference. The default when no `-v` flag is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warning,
}

impl LogLevel {
    /// Directive for `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default)]
    pub log_level: LogLevel,

    /// HTTP timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            log_level: LogLevel::default(),
            timeout: default_timeout(),
        }
    }
}

fn default_output() -> String {
    "table".into()
}
fn default_timeout() -> u64 {
    30
}

/// A named SmartRent account profile.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Profile {
    /// Account email.
    pub email: String,

    /// Password (plaintext; prefer the keyring or `password_env`).
    pub password: Option<String>,

    /// Environment variable holding the password.
    pub password_env: Option<String>,

    /// Base32 TOTP secret (plaintext; prefer the keyring).
    pub tfa_secret: Option<String>,

    /// Devices to subscribe to. Empty means discover all.
    #[serde(default)]
    pub device_ids: Vec<String>,

    /// REST base URL override.
    pub api_url: Option<String>,

    /// Realtime socket URL override.
    pub socket_url: Option<String>,

    /// Custom CA certificate (PEM).
    pub ca_cert: Option<PathBuf>,

    /// Command acknowledgement timeout in seconds.
    pub command_timeout: Option<u64>,

    /// Queue up to this many commands while offline instead of rejecting.
    pub offline_queue: Option<usize>,

    /// HTTP timeout override in seconds.
    pub timeout: Option<u64>,

    /// Log level override for this profile.
    pub log_level: Option<LogLevel>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "smartrent", "smartrent").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("smartrent");
    p
}

// ── Loading / saving ────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load defaults, then `path`, then `SMARTRENT_` environment overrides.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    Ok(figment.extract()?)
}

/// Load config, returning a default if the file is missing or unreadable.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(cfg)?)?;
    Ok(())
}

// ── Secrets ─────────────────────────────────────────────────────────

/// Which stored secret a keyring entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Password,
    TfaSecret,
}

impl SecretKind {
    fn key(self, profile_name: &str) -> String {
        match self {
            Self::Password => format!("{profile_name}/password"),
            Self::TfaSecret => format!("{profile_name}/tfa-secret"),
        }
    }
}

fn keyring_entry(kind: SecretKind, profile_name: &str) -> Result<keyring::Entry, ConfigError> {
    Ok(keyring::Entry::new(KEYRING_SERVICE, &kind.key(profile_name))?)
}

fn keyring_secret(kind: SecretKind, profile_name: &str) -> Option<SecretString> {
    keyring_entry(kind, profile_name)
        .ok()?
        .get_password()
        .ok()
        .map(SecretString::from)
}

/// Store a secret for `profile_name` in the system keyring.
pub fn store_secret(kind: SecretKind, profile_name: &str, secret: &str) -> Result<(), ConfigError> {
    keyring_entry(kind, profile_name)?.set_password(secret)?;
    Ok(())
}

/// Whether the keyring holds a secret of this kind for the profile.
pub fn has_stored_secret(kind: SecretKind, profile_name: &str) -> bool {
    keyring_secret(kind, profile_name).is_some()
}

/// Resolve the account password.
///
/// Order: the profile's `password_env`, `SMARTRENT_PASSWORD`, the system
/// keyring, then plaintext in the profile.
pub fn resolve_password(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    if let Some(ref env_name) = profile.password_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    if let Ok(val) = std::env::var("SMARTRENT_PASSWORD") {
        return Ok(SecretString::from(val));
    }

    if let Some(secret) = keyring_secret(SecretKind::Password, profile_name) {
        return Ok(secret);
    }

    if let Some(ref pw) = profile.password {
        return Ok(SecretString::from(pw.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

/// Resolve the optional TOTP secret: `SMARTRENT_TFA_SECRET`, keyring,
/// plaintext.
pub fn resolve_tfa_secret(profile: &Profile, profile_name: &str) -> Option<SecretString> {
    std::env::var("SMARTRENT_TFA_SECRET")
        .ok()
        .map(SecretString::from)
        .or_else(|| keyring_secret(SecretKind::TfaSecret, profile_name))
        .or_else(|| profile.tfa_secret.clone().map(SecretString::from))
}

// ── Profile → ControllerConfig ──────────────────────────────────────

/// Build a `ControllerConfig` from a profile, resolving secrets.
pub fn profile_to_controller_config(
    profile: &Profile,
    profile_name: &str,
    defaults: &Defaults,
) -> Result<ControllerConfig, ConfigError> {
    let password = resolve_password(profile, profile_name)?;
    let tfa_secret = resolve_tfa_secret(profile, profile_name);
    build_controller_config(profile, password, tfa_secret, defaults)
}

/// Translate a profile plus already-resolved secrets.
pub fn build_controller_config(
    profile: &Profile,
    password: SecretString,
    tfa_secret: Option<SecretString>,
    defaults: &Defaults,
) -> Result<ControllerConfig, ConfigError> {
    if profile.email.trim().is_empty() {
        return Err(ConfigError::Validation {
            field: "email".into(),
            reason: "profile has no email".into(),
        });
    }

    let mut config = ControllerConfig::new(profile.email.clone(), password)?;
    config.tfa_secret = tfa_secret;
    config.device_ids.clone_from(&profile.device_ids);

    if let Some(ref raw) = profile.api_url {
        config.api_url = parse_url("api_url", raw)?;
    }
    if let Some(ref raw) = profile.socket_url {
        config.socket_url = parse_url("socket_url", raw)?;
    }
    if let Some(ref ca) = profile.ca_cert {
        config.tls = TlsMode::CustomCa(ca.clone());
    }
    if let Some(secs) = profile.command_timeout {
        config.command_timeout = Duration::from_secs(secs);
    }
    if let Some(capacity) = profile.offline_queue {
        config.offline_policy = OfflinePolicy::Queue { capacity };
    }
    config.timeout = Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout));

    config.validate()?;
    Ok(config)
}

fn parse_url(field: &str, raw: &str) -> Result<url::Url, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Validation {
        field: field.into(),
        reason: format!("invalid URL: {raw}"),
    })
}
