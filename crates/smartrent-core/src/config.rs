// ── Runtime session configuration ──
//
// These types describe *how* to reach SmartRent and how the session behaves.
// They carry credential data and tuning, but never touch disk. The host
// builds a `ControllerConfig` and hands it in.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use smartrent_api::{Credentials, ReconnectConfig, TlsMode, TransportConfig};
use url::Url;

use crate::error::CoreError;

pub const DEFAULT_API_URL: &str = "https://control.smartrent.com";
pub const DEFAULT_SOCKET_URL: &str = "wss://control.smartrent.com/socket/websocket";

/// What to do with a command issued while the session is not subscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfflinePolicy {
    /// Fail immediately with `NotConnected`.
    #[default]
    Reject,
    /// Hold up to `capacity` commands and send them once subscribed. Queued
    /// commands still expire after the command timeout.
    Queue { capacity: usize },
}

/// Configuration for one SmartRent session.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// REST base URL used for login, token refresh and discovery.
    pub api_url: Url,
    /// Realtime socket URL.
    pub socket_url: Url,
    pub email: String,
    pub password: SecretString,
    /// Base32 TOTP secret for accounts with two-factor enabled.
    pub tfa_secret: Option<SecretString>,
    /// Devices to subscribe to. Empty means discover every lock and
    /// thermostat on the account.
    pub device_ids: Vec<String>,
    pub reconnect: ReconnectConfig,
    pub command_timeout: Duration,
    /// Bound on each handshake step (open, auth ack, subscribe ack).
    pub handshake_timeout: Duration,
    /// How long `Controller::connect` waits for the first subscription.
    pub connect_timeout: Duration,
    pub sweep_interval: Duration,
    pub offline_policy: OfflinePolicy,
    /// Consecutive malformed frames tolerated before the connection is
    /// dropped and re-established.
    pub max_protocol_errors: u32,
    pub tls: TlsMode,
    /// HTTP request timeout.
    pub timeout: Duration,
}

impl ControllerConfig {
    /// A config with default endpoints and tuning.
    pub fn new(email: impl Into<String>, password: SecretString) -> Result<Self, CoreError> {
        Ok(Self {
            api_url: parse_url(DEFAULT_API_URL)?,
            socket_url: parse_url(DEFAULT_SOCKET_URL)?,
            email: email.into(),
            password,
            tfa_secret: None,
            device_ids: Vec::new(),
            reconnect: ReconnectConfig::default(),
            command_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            offline_policy: OfflinePolicy::Reject,
            max_protocol_errors: 5,
            tls: TlsMode::System,
            timeout: Duration::from_secs(30),
        })
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.email.trim().is_empty() {
            return Err(config_error("email is required"));
        }
        if self.password.expose_secret().is_empty() {
            return Err(config_error("password is required"));
        }
        if !matches!(self.api_url.scheme(), "http" | "https") {
            return Err(config_error(format!(
                "api_url must be http(s), got `{}`",
                self.api_url
            )));
        }
        if !matches!(self.socket_url.scheme(), "ws" | "wss") {
            return Err(config_error(format!(
                "socket_url must be ws(s), got `{}`",
                self.socket_url
            )));
        }
        for (name, value) in [
            ("command_timeout", self.command_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("sweep_interval", self.sweep_interval),
            ("reconnect.initial_delay", self.reconnect.initial_delay),
        ] {
            if value.is_zero() {
                return Err(config_error(format!("{name} must be greater than zero")));
            }
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return Err(config_error("reconnect.max_delay is below initial_delay"));
        }
        if matches!(self.offline_policy, OfflinePolicy::Queue { capacity: 0 }) {
            return Err(config_error("offline queue capacity must be greater than zero"));
        }
        Ok(())
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            tls: self.tls.clone(),
            timeout: self.timeout,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            email: self.email.clone(),
            password: self.password.clone(),
            tfa_secret: self.tfa_secret.clone(),
        }
    }
}

fn parse_url(raw: &str) -> Result<Url, CoreError> {
    Url::parse(raw).map_err(|e| config_error(format!("invalid URL `{raw}`: {e}")))
}

fn config_error(message: impl Into<String>) -> CoreError {
    CoreError::Config {
        message: message.into(),
    }
}
