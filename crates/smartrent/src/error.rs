//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use smartrent_config::ConfigError;
use smartrent_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const REJECTED: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach SmartRent: {message}")]
    #[diagnostic(
        code(smartrent::connection_failed),
        help("Check your network connection and try again with -vv for details.")
    )]
    ConnectionFailed { message: String },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(smartrent::auth_failed),
        help(
            "Verify the email and password for this profile.\n\
             Run: smartrent config set-password --profile {profile}\n\
             Accounts with two-factor need: smartrent config set-tfa-secret"
        )
    )]
    AuthFailed { profile: String, message: String },

    #[error("No password configured for profile '{profile}'")]
    #[diagnostic(
        code(smartrent::no_credentials),
        help(
            "Store one with: smartrent config set-password --profile {profile}\n\
             Or set the SMARTRENT_PASSWORD environment variable."
        )
    )]
    NoCredentials { profile: String },

    // ── Devices ──────────────────────────────────────────────────────
    #[error("Device '{device_id}' not found")]
    #[diagnostic(
        code(smartrent::not_found),
        help("Run: smartrent devices to see available devices")
    )]
    NotFound { device_id: String },

    #[error("SmartRent rejected the command: {reason}")]
    #[diagnostic(code(smartrent::rejected))]
    Rejected { code: Option<String>, reason: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(smartrent::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(smartrent::profile_not_found),
        help("Available profiles: {available}")
    )]
    ProfileNotFound { name: String, available: String },

    #[error("No account configured")]
    #[diagnostic(
        code(smartrent::no_config),
        help(
            "Add a profile to {path}\n\
             or pass --email and set SMARTRENT_PASSWORD."
        )
    )]
    NoConfig { path: String },

    #[error(transparent)]
    #[diagnostic(code(smartrent::config))]
    Config(Box<ConfigError>),

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Timed out after {seconds}s")]
    #[diagnostic(
        code(smartrent::timeout),
        help("Increase the wait with --timeout or check the device is online.")
    )]
    Timeout { seconds: u64 },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render JSON: {0}")]
    #[diagnostic(code(smartrent::json))]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    #[diagnostic(code(smartrent::internal))]
    Internal(String),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Rejected { .. } => exit_code::REJECTED,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. }
            | Self::ProfileNotFound { .. }
            | Self::NoConfig { .. }
            | Self::Config(_) => exit_code::USAGE,
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => exit_code::GENERAL,
        }
    }

    /// Attach the active profile name to auth failures.
    pub fn for_profile(self, profile: &str) -> Self {
        match self {
            Self::AuthFailed { message, .. } => Self::AuthFailed {
                profile: profile.into(),
                message,
            },
            other => other,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::AuthenticationFailed { message } => CliError::AuthFailed {
                profile: "default".into(),
                message,
            },
            CoreError::AuthExpired => CliError::AuthFailed {
                profile: "default".into(),
                message: "session token expired".into(),
            },
            CoreError::NotConnected => CliError::ConnectionFailed {
                message: "not connected".into(),
            },
            CoreError::ConnectionLost => CliError::ConnectionFailed {
                message: "connection lost".into(),
            },
            CoreError::Timeout { timeout_secs } => CliError::Timeout {
                seconds: timeout_secs,
            },
            CoreError::CommandTimeout { timeout_ms } => CliError::Timeout {
                seconds: timeout_ms.div_ceil(1000),
            },
            CoreError::Superseded => CliError::Rejected {
                code: None,
                reason: "superseded by a newer change".into(),
            },
            CoreError::CommandRejected { code, reason } => CliError::Rejected { code, reason },
            CoreError::DeviceNotFound { device_id } => CliError::NotFound { device_id },
            CoreError::InvalidChange { message } => CliError::Validation {
                field: "change".into(),
                reason: message,
            },
            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },
            CoreError::Api { message, .. } | CoreError::Protocol { message } => {
                CliError::ConnectionFailed { message }
            }
            CoreError::Internal(message) => CliError::Internal(message),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoCredentials { profile } => CliError::NoCredentials { profile },
            ConfigError::ProfileNotFound { name, available } => CliError::ProfileNotFound {
                name,
                available: if available.is_empty() {
                    "(none)".into()
                } else {
                    available.join(", ")
                },
            },
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::Controller(core) => core.into(),
            other => CliError::Config(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_exit_codes() {
        let cases = [
            (
                CoreError::AuthenticationFailed {
                    message: "nope".into(),
                },
                exit_code::AUTH,
            ),
            (
                CoreError::DeviceNotFound {
                    device_id: "x".into(),
                },
                exit_code::NOT_FOUND,
            ),
            (CoreError::CommandTimeout { timeout_ms: 1500 }, exit_code::TIMEOUT),
            (CoreError::ConnectionLost, exit_code::CONNECTION),
            (
                CoreError::CommandRejected {
                    code: None,
                    reason: "jammed".into(),
                },
                exit_code::REJECTED,
            ),
        ];
        for (core, code) in cases {
            assert_eq!(CliError::from(core).exit_code(), code);
        }
    }

    #[test]
    fn command_timeout_rounds_up_to_seconds() {
        let err = CliError::from(CoreError::CommandTimeout { timeout_ms: 1500 });
        assert!(matches!(err, CliError::Timeout { seconds: 2 }));
    }

    #[test]
    fn auth_failures_carry_profile() {
        let err = CliError::from(CoreError::AuthenticationFailed {
            message: "bad password".into(),
        })
        .for_profile("home");
        assert!(matches!(err, CliError::AuthFailed { ref profile, .. } if profile == "home"));
    }
}
