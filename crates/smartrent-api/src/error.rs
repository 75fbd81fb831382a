use thiserror::Error;

/// Top-level error type for the `smartrent-api` crate.
///
/// Covers every failure mode across the API surfaces this crate talks to:
/// authentication, HTTP transport, REST discovery, and the realtime socket.
/// `smartrent-core` maps these into the session-level taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Login failed (wrong credentials, account locked, etc.)
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// The service issued a two-factor challenge but no TOTP secret is configured.
    #[error("Two-factor authentication code required")]
    TwoFactorRequired,

    /// The refresh token was rejected -- a full login is required.
    #[error("Session expired -- re-authentication required")]
    SessionExpired,

    /// The configured TOTP secret could not be decoded.
    #[error("Invalid two-factor secret: {0}")]
    InvalidTotpSecret(String),

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── REST API ────────────────────────────────────────────────────
    /// Non-success response from a REST endpoint.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed by the remote end.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// A frame was written to a connection that is already closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// A socket frame could not be decoded.
    #[error("Malformed frame: {message}")]
    Protocol { message: String },
}

impl Error {
    /// Returns `true` if the token has expired and a refresh or fresh
    /// login might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }

    /// Returns `true` if the credentials themselves were rejected.
    pub fn is_bad_credentials(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::TwoFactorRequired | Self::InvalidTotpSecret(_)
        )
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. }
            | Self::WebSocketConnect(_)
            | Self::WebSocketClosed { .. }
            | Self::ConnectionClosed => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
