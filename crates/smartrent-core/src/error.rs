// ── Core error types ──
//
// User-facing errors from smartrent-core. Hosts never see HTTP status codes
// or raw socket failures directly; `From<smartrent_api::Error>` translates
// transport-layer errors into session-level variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Authentication ───────────────────────────────────────────────
    /// Credentials were rejected. Persistent until the host reconnects.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// The session token expired and could not be renewed in place.
    #[error("Session token expired")]
    AuthExpired,

    // ── Connection ───────────────────────────────────────────────────
    #[error("Not connected to SmartRent")]
    NotConnected,

    /// The connection dropped while the operation was in flight.
    #[error("Connection lost")]
    ConnectionLost,

    #[error("Timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Commands ─────────────────────────────────────────────────────
    #[error("Command was not acknowledged within {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    /// A newer command touching the same attribute replaced this one.
    #[error("Command superseded by a newer change")]
    Superseded,

    #[error("Command rejected by SmartRent: {reason}")]
    CommandRejected { code: Option<String>, reason: String },

    // ── Data ─────────────────────────────────────────────────────────
    #[error("Malformed frame: {message}")]
    Protocol { message: String },

    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("Invalid change: {message}")]
    InvalidChange { message: String },

    // ── Wrapped ──────────────────────────────────────────────────────
    #[error("API error: {message}")]
    Api {
        message: String,
        /// HTTP status code (if applicable).
        status: Option<u16>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidChange {
            message: message.into(),
        }
    }

    /// Bad credentials: retrying without user action will not help.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }

    /// The server refused the bearer token on a REST call or the socket
    /// upgrade. A fresh token may fix it; the credentials are not at fault.
    pub fn is_token_rejected(&self) -> bool {
        matches!(self, Self::Api { status: Some(401 | 403), .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<smartrent_api::Error> for CoreError {
    fn from(err: smartrent_api::Error) -> Self {
        use smartrent_api::Error as Api;

        match err {
            Api::Authentication { message } => CoreError::AuthenticationFailed { message },
            Api::TwoFactorRequired => CoreError::AuthenticationFailed {
                message: "two-factor required but no TOTP secret is configured".into(),
            },
            Api::InvalidTotpSecret(message) => CoreError::AuthenticationFailed {
                message: format!("invalid two-factor secret: {message}"),
            },
            Api::SessionExpired => CoreError::AuthExpired,
            Api::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_secs: 0 }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            Api::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            Api::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            Api::Tls(msg) => CoreError::Config {
                message: format!("TLS error: {msg}"),
            },
            Api::Api { status, message } => CoreError::Api {
                message,
                status: Some(status),
            },
            Api::WebSocketConnect(reason) => CoreError::Api {
                message: format!("socket connection failed: {reason}"),
                status: None,
            },
            Api::WebSocketClosed { .. } | Api::ConnectionClosed => CoreError::ConnectionLost,
            Api::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            Api::Protocol { message } => CoreError::Protocol { message },
        }
    }
}
