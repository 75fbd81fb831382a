//! Realtime socket connector and reconnect backoff.
//!
//! [`WsConnector`] opens a `tokio-tungstenite` client socket and bridges it
//! to a [`Connection`] through a small pump task: text frames flow both
//! ways, close frames and read errors become
//! [`Inbound::Closed`](crate::connection::Inbound::Closed), and dropping the
//! `Connection` sends a close frame to the server.
//!
//! # Example
//!
//! ```rust,ignore
//! use smartrent_api::{Connector, WsConnector};
//! use url::Url;
//!
//! let url = Url::parse("wss://control-room.smartrent.com/socket/websocket")?;
//! let headers = vec![("Authorization".into(), format!("Bearer {token}"))];
//! let mut conn = WsConnector::new().open(&url, &headers).await?;
//! conn.send(r#"{"type":"auth","ref":"1","token":"..."}"#.into())?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use rand::Rng;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use url::Url;

use crate::connection::{Connection, Connector, INBOUND_CAPACITY, Peer};
use crate::error::Error;
use crate::transport::TransportConfig;

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff with random jitter.
///
/// `delay = min(initial * 2^attempt, max) * (1 +- 0.25)`
///
/// Each call draws fresh jitter so clients dropped together spread their
/// reconnects out.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt.min(32)).unwrap_or(32);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter: f64 = rand::rng().random_range(-0.25..=0.25);
    let with_jitter = (capped * (1.0 + jitter)).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── WsConnector ──────────────────────────────────────────────────────

/// Production [`Connector`] over `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    inbound_capacity: Option<usize>,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector that trusts the same roots as the REST client built
    /// from `transport`.
    pub fn with_transport(transport: &TransportConfig) -> Result<Self, Error> {
        Ok(Self {
            inbound_capacity: None,
            tls: transport.socket_tls_config()?,
        })
    }

    /// Override the depth of the inbound frame queue.
    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = Some(capacity);
        self
    }
}

impl Connector for WsConnector {
    async fn open(&self, url: &Url, headers: &[(String, String)]) -> Result<Connection, Error> {
        tracing::info!(url = %url, "connecting to realtime socket");

        let uri: tungstenite::http::Uri = url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

        let mut request = ClientRequestBuilder::new(uri);
        for (name, value) in headers {
            request = request.with_header(name.clone(), value.clone());
        }

        let connector = self.tls.clone().map(tokio_tungstenite::Connector::Rustls);
        let (ws_stream, _response) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await
                .map_err(upgrade_error)?;

        tracing::info!("realtime socket connected");

        let (conn, peer) = Connection::pair(self.inbound_capacity.unwrap_or(INBOUND_CAPACITY));
        tokio::spawn(pump(ws_stream, peer));
        Ok(conn)
    }
}

/// A refused upgrade keeps its HTTP status so callers can tell a stale
/// token from a network failure.
fn upgrade_error(e: tungstenite::Error) -> Error {
    match e {
        tungstenite::Error::Http(response) => Error::Api {
            status: response.status().as_u16(),
            message: "socket upgrade rejected".into(),
        },
        other => Error::WebSocketConnect(other.to_string()),
    }
}

// ── Socket pump ──────────────────────────────────────────────────────

/// Shuttle frames between the socket and the connection until either
/// side goes away.
async fn pump<S>(socket: S, mut peer: Peer)
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = socket.split();

    loop {
        tokio::select! {
            outbound = peer.recv() => {
                let Some(text) = outbound else {
                    tracing::debug!("connection dropped, closing socket");
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = write.send(Message::text(text)).await {
                    tracing::warn!(error = %e, "socket write failed");
                    peer.close(None, e.to_string()).await;
                    break;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if peer.send(text.as_str()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite queues the pong; it goes out with the next write
                        tracing::trace!("socket ping");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|cf| (Some(u16::from(cf.code)), cf.reason.as_str().to_owned()))
                            .unwrap_or((None, String::new()));
                        tracing::info!(?code, %reason, "socket close frame received");
                        peer.close(code, reason).await;
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "socket read failed");
                        peer.close(None, e.to_string()).await;
                        break;
                    }
                    None => {
                        tracing::info!("socket stream ended");
                        peer.close(None, "stream ended").await;
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary, Pong, Frame -- ignore
                    }
                }
            }
        }
    }

    tracing::debug!("socket pump exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn backoff_increases_exponentially() {
        let config = ReconnectConfig::default();

        let d0 = calculate_backoff(0, &config);
        let d1 = calculate_backoff(1, &config);
        let d2 = calculate_backoff(2, &config);

        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should be greater than d1 ({d1:?})");
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        };

        for attempt in [10, 40, u32::MAX] {
            let delay = calculate_backoff(attempt, &config);
            assert!(
                delay <= Duration::from_millis(12_500),
                "delay at attempt {attempt} ({delay:?}) should be capped near max_delay"
            );
        }
    }

    #[test]
    fn backoff_jitter_stays_within_a_quarter() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
        };
        for attempt in 0..50 {
            let ms = calculate_backoff(attempt, &config).as_secs_f64() * 1000.0;
            assert!((75.0..=125.0).contains(&ms), "attempt {attempt}: {ms}ms");
        }
    }

    #[test]
    fn backoff_jitter_differs_between_draws() {
        let config = ReconnectConfig::default();
        let first = calculate_backoff(3, &config);
        let spread = (0..20).any(|_| calculate_backoff(3, &config) != first);
        assert!(spread, "twenty draws at the same attempt all returned {first:?}");
    }

    #[test]
    fn rejected_upgrade_keeps_http_status() {
        let response = tungstenite::http::Response::builder()
            .status(401)
            .body(None)
            .unwrap();
        let err = upgrade_error(tungstenite::Error::Http(response));
        assert!(matches!(err, Error::Api { status: 401, .. }), "{err:?}");

        let err = upgrade_error(tungstenite::Error::ConnectionClosed);
        assert!(matches!(err, Error::WebSocketConnect(_)), "{err:?}");
    }

    #[test]
    fn system_tls_uses_default_connector() {
        let connector = WsConnector::with_transport(&TransportConfig::default()).unwrap();
        assert!(connector.tls.is_none());
    }
}
