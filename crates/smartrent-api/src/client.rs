// REST API HTTP client
//
// Wraps `reqwest::Client` with base-URL joining and `{ "data": ... }`
// envelope unwrapping. Endpoint groups (auth, devices) are implemented in
// their own modules on top of these helpers.

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

/// Every REST response wraps its payload in a `data` field.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct Envelope<T> {
    pub data: T,
}

/// Raw HTTP client for the SmartRent REST API.
///
/// Cheap to clone: the inner `reqwest::Client` is reference-counted.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a client from a `TransportConfig`.
    ///
    /// `base_url` is the service root, e.g. `https://control-room.smartrent.com`.
    pub fn new(base_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        Ok(Self {
            http: transport.build_client()?,
            base_url,
        })
    }

    /// Create a client with a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    /// The service base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub(crate) fn url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(path)?)
    }

    /// POST a JSON body and unwrap the `data` envelope of the response.
    pub(crate) async fn post<B, T>(
        &self,
        path: &str,
        body: &B,
        headers: HeaderMap,
    ) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path)?;
        debug!(%url, "POST");
        let resp = self
            .http
            .post(url)
            .headers(headers)
            .json(body)
            .send()
            .await?;
        Self::unwrap_envelope(resp).await
    }

    /// GET with bearer auth and unwrap the `data` envelope of the response.
    pub(crate) async fn get<T>(&self, path: &str, token: &SecretString) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let url = self.url(path)?;
        debug!(%url, "GET");
        let resp = self
            .http
            .get(url)
            .headers(bearer(token)?)
            .send()
            .await?;
        Self::unwrap_envelope(resp).await
    }

    async fn unwrap_envelope<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
        let status = resp.status();
        let body = resp.text().await?;
        trace!(status = status.as_u16(), body_len = body.len(), "response received");

        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        serde_json::from_str::<Envelope<T>>(&body)
            .map(|env| env.data)
            .map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body,
            })
    }
}

/// Build an `Authorization: Bearer <token>` header map.
pub(crate) fn bearer(token: &SecretString) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
        .map_err(|e| Error::Authentication {
            message: format!("token is not a valid header value: {e}"),
        })?;
    value.set_sensitive(true);
    headers.insert(AUTHORIZATION, value);
    Ok(headers)
}
