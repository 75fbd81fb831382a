// Credential store
//
// Holds the account credentials and the token pair derived from them.
// Tokens are refreshed on expiry; a rejected refresh token falls back to a
// full login. Nothing here is ever written to disk.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{debug, info, warn};

use crate::client::ApiClient;
use crate::error::Error;

const LOGIN_PATH: &str = "/api/v1/sessions";
const TFA_PATH: &str = "/api/v1/sessions/tfa";
const REFRESH_PATH: &str = "/api/v1/tokens";
const REFRESH_HEADER: &str = "authorization-x-refresh";

/// Tokens expiring within this window are refreshed before use.
const EXPIRY_SKEW_SECS: i64 = 60;

// ── Credentials ──────────────────────────────────────────────────────

/// Account credentials for the SmartRent service.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
    /// Base32 TOTP secret for accounts with two-factor enabled.
    pub tfa_secret: Option<SecretString>,
}

// ── TOTP ─────────────────────────────────────────────────────────────

/// Generates one-time passcodes at request time from a base32 secret.
pub struct TotpGenerator {
    totp: TOTP,
}

impl TotpGenerator {
    /// Decode a base32 secret. Whitespace is ignored and case is normalized.
    pub fn new(secret: &SecretString) -> Result<Self, Error> {
        let normalized: String = secret
            .expose_secret()
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        let bytes = Secret::Encoded(normalized)
            .to_bytes()
            .map_err(|e| Error::InvalidTotpSecret(format!("{e:?}")))?;
        Ok(Self {
            totp: TOTP::new_unchecked(Algorithm::SHA1, 6, 1, 30, bytes),
        })
    }

    /// The code valid right now.
    pub fn current(&self) -> Result<String, Error> {
        self.totp
            .generate_current()
            .map_err(|e| Error::InvalidTotpSecret(format!("system clock error: {e}")))
    }

    /// The code for an arbitrary unix timestamp.
    pub fn at(&self, unix_secs: u64) -> String {
        self.totp.generate(unix_secs)
    }
}

impl fmt::Debug for TotpGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TotpGenerator").finish_non_exhaustive()
    }
}

// ── Tokens ───────────────────────────────────────────────────────────

/// A bearer token and its expiry.
#[derive(Debug, Clone)]
pub struct AccessToken {
    secret: SecretString,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(secret: SecretString, expires_at: DateTime<Utc>) -> Self {
        Self { secret, expires_at }
    }

    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    pub fn expose(&self) -> &str {
        self.secret.expose_secret()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the token expires within `EXPIRY_SKEW_SECS` of `now`.
    pub fn is_expiring(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - ChronoDuration::seconds(EXPIRY_SKEW_SECS) <= now
    }
}

#[derive(Debug, Clone)]
struct TokenSet {
    access: AccessToken,
    refresh: SecretString,
    user_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    access_token: String,
    refresh_token: String,
    /// Unix timestamp (seconds).
    expires: i64,
    #[serde(default)]
    user_id: Option<u64>,
}

impl From<TokenPayload> for TokenSet {
    fn from(p: TokenPayload) -> Self {
        let expires_at = DateTime::from_timestamp(p.expires, 0).unwrap_or_else(Utc::now);
        Self {
            access: AccessToken::new(SecretString::from(p.access_token), expires_at),
            refresh: SecretString::from(p.refresh_token),
            user_id: p.user_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LoginResponse {
    Tokens(TokenPayload),
    Challenge { tfa_api_token: String },
}

// ── CredentialStore ──────────────────────────────────────────────────

/// Holds credentials and the derived session token.
///
/// Shared between the session task and the REST discovery calls; the
/// token slot is guarded by a short-lived lock that is never held across
/// an `.await`.
pub struct CredentialStore {
    client: ApiClient,
    credentials: Credentials,
    totp: Option<TotpGenerator>,
    tokens: RwLock<Option<TokenSet>>,
}

impl CredentialStore {
    pub fn new(client: ApiClient, credentials: Credentials) -> Result<Self, Error> {
        let totp = credentials
            .tfa_secret
            .as_ref()
            .map(TotpGenerator::new)
            .transpose()?;
        Ok(Self {
            client,
            credentials,
            totp,
            tokens: RwLock::new(None),
        })
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn email(&self) -> &str {
        &self.credentials.email
    }

    /// User id reported by the last successful login, if any.
    pub fn user_id(&self) -> Option<u64> {
        self.read_tokens().as_ref().and_then(|t| t.user_id)
    }

    /// The cached access token, without any freshness check.
    pub fn cached_token(&self) -> Option<AccessToken> {
        self.read_tokens().as_ref().map(|t| t.access.clone())
    }

    /// Log in with the stored email/password, answering a two-factor
    /// challenge with a freshly generated TOTP code when one is issued.
    pub async fn authenticate(&self) -> Result<AccessToken, Error> {
        debug!(email = %self.credentials.email, "logging in");

        let body = json!({
            "email": self.credentials.email,
            "password": self.credentials.password.expose_secret(),
        });

        let response: LoginResponse = self
            .client
            .post(LOGIN_PATH, &body, HeaderMap::new())
            .await
            .map_err(into_auth_error)?;

        let tokens: TokenSet = match response {
            LoginResponse::Tokens(payload) => payload.into(),
            LoginResponse::Challenge { tfa_api_token } => {
                let totp = self.totp.as_ref().ok_or(Error::TwoFactorRequired)?;
                debug!("answering two-factor challenge");
                let body = json!({
                    "tfa_api_token": tfa_api_token,
                    "token": totp.current()?,
                });
                let payload: TokenPayload = self
                    .client
                    .post(TFA_PATH, &body, HeaderMap::new())
                    .await
                    .map_err(into_auth_error)?;
                payload.into()
            }
        };

        let access = tokens.access.clone();
        self.store(tokens);
        info!(expires_at = %access.expires_at(), "authenticated");
        Ok(access)
    }

    /// Exchange the refresh token for a new token pair.
    ///
    /// Fails with [`Error::SessionExpired`] when there is no refresh token or
    /// the service rejects it.
    pub async fn refresh(&self) -> Result<AccessToken, Error> {
        let refresh = self
            .read_tokens()
            .as_ref()
            .map(|t| t.refresh.clone())
            .ok_or(Error::SessionExpired)?;

        let mut headers = HeaderMap::new();
        let mut value = HeaderValue::from_str(refresh.expose_secret())
            .map_err(|_| Error::SessionExpired)?;
        value.set_sensitive(true);
        headers.insert(REFRESH_HEADER, value);

        let payload: TokenPayload = match self.client.post(REFRESH_PATH, &json!({}), headers).await {
            Ok(p) => p,
            Err(Error::Api { status: 401 | 403, .. }) => {
                warn!("refresh token rejected");
                self.clear();
                return Err(Error::SessionExpired);
            }
            Err(e) => return Err(e),
        };

        let tokens: TokenSet = payload.into();
        let access = tokens.access.clone();
        self.store(tokens);
        debug!(expires_at = %access.expires_at(), "token refreshed");
        Ok(access)
    }

    /// Return a token that is good for at least the skew window, refreshing
    /// or re-authenticating as needed.
    pub async fn valid_token(&self) -> Result<AccessToken, Error> {
        let cached = self.cached_token();
        match cached {
            Some(token) if !token.is_expiring(Utc::now()) => Ok(token),
            Some(_) => match self.refresh().await {
                Ok(token) => Ok(token),
                Err(e) if e.is_auth_expired() => self.authenticate().await,
                Err(e) => Err(e),
            },
            None => self.authenticate().await,
        }
    }

    /// Mark the cached access token as expired so the next
    /// [`valid_token`](Self::valid_token) call refreshes it.
    pub fn invalidate(&self) {
        let mut guard = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(tokens) = guard.as_mut() {
            tokens.access.expires_at = DateTime::<Utc>::MIN_UTC;
        }
    }

    /// Drop all cached tokens.
    pub fn clear(&self) {
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn store(&self, tokens: TokenSet) {
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner) = Some(tokens);
    }

    fn read_tokens(&self) -> std::sync::RwLockReadGuard<'_, Option<TokenSet>> {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("email", &self.credentials.email)
            .field("two_factor", &self.totp.is_some())
            .finish_non_exhaustive()
    }
}

/// 401/403 from the login endpoints means bad credentials, not an outage.
fn into_auth_error(err: Error) -> Error {
    match err {
        Error::Api {
            status: 401 | 403 | 422,
            message,
        } => Error::Authentication { message },
        other => other,
    }
}
