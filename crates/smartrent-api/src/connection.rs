// Connection abstraction
//
// The session engine talks to the realtime endpoint through `Connector` and
// `Connection`. The production connector lives in `websocket.rs`; the
// in-memory pair here lets hosts and tests drive a session without a socket.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc;
use url::Url;

use crate::error::Error;

/// Default depth of the inbound frame queue.
pub const INBOUND_CAPACITY: usize = 256;

/// What a connection yields to its reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// The remote end closed the connection. Nothing follows.
    Closed { code: Option<u16>, reason: String },
}

/// One open bidirectional text channel.
///
/// Outbound is unbounded so sends never block the caller; inbound is
/// bounded and delivered in arrival order. Dropping the connection closes it.
#[derive(Debug)]
pub struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::Receiver<Inbound>,
}

impl Connection {
    /// Create a connection together with the [`Peer`] that serves it.
    pub fn pair(capacity: usize) -> (Self, Peer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        (
            Self {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            Peer {
                outbound: outbound_rx,
                inbound: inbound_tx,
            },
        )
    }

    /// Queue a text frame for the remote end.
    pub fn send(&self, text: String) -> Result<(), Error> {
        self.outbound.send(text).map_err(|_| Error::ConnectionClosed)
    }

    /// Next inbound item. `None` means the peer went away without a close.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    pub fn close(self) {
        drop(self);
    }
}

/// The serving half of a [`Connection`].
#[derive(Debug)]
pub struct Peer {
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::Sender<Inbound>,
}

impl Peer {
    /// Next frame the client sent. `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Deliver a text frame to the client.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), Error> {
        self.inbound
            .send(Inbound::Text(text.into()))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Tell the client the connection is gone.
    pub async fn close(&self, code: Option<u16>, reason: impl Into<String>) {
        let _ = self
            .inbound
            .send(Inbound::Closed {
                code,
                reason: reason.into(),
            })
            .await;
    }

    /// Whether the client has dropped its end.
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}

/// Opens connections to the realtime endpoint.
pub trait Connector: Send + Sync + 'static {
    fn open(
        &self,
        url: &Url,
        headers: &[(String, String)],
    ) -> impl Future<Output = Result<Connection, Error>> + Send;
}

// ── In-memory connector ──────────────────────────────────────────────

/// A connection request accepted by a [`MemoryListener`].
pub struct Accepted {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub peer: Peer,
}

impl Accepted {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Connector that hands every opened connection to a [`MemoryListener`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept: mpsc::UnboundedSender<Accepted>,
    refuse: Arc<AtomicU32>,
    deny: Arc<AtomicU32>,
    capacity: usize,
}

/// Receives the server side of connections opened via [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryListener {
    accept: mpsc::UnboundedReceiver<Accepted>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                accept: tx,
                refuse: Arc::new(AtomicU32::new(0)),
                deny: Arc::new(AtomicU32::new(0)),
                capacity: INBOUND_CAPACITY,
            },
            MemoryListener { accept: rx },
        )
    }

    /// Fail the next `n` open attempts as if the endpoint were unreachable.
    pub fn refuse_next(&self, n: u32) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Reject the next open attempt with an HTTP `status`, as a server
    /// refusing the upgrade would.
    pub fn deny_next(&self, status: u16) {
        self.deny.store(u32::from(status), Ordering::SeqCst);
    }
}

impl Connector for MemoryConnector {
    async fn open(&self, url: &Url, headers: &[(String, String)]) -> Result<Connection, Error> {
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::WebSocketConnect("connection refused".into()));
        }
        let denied = self.deny.swap(0, Ordering::SeqCst);
        if denied != 0 {
            return Err(Error::Api {
                status: u16::try_from(denied).unwrap_or(u16::MAX),
                message: "socket upgrade rejected".into(),
            });
        }

        let (conn, peer) = Connection::pair(self.capacity);
        self.accept
            .send(Accepted {
                url: url.clone(),
                headers: headers.to_vec(),
                peer,
            })
            .map_err(|_| Error::WebSocketConnect("listener is gone".into()))?;
        Ok(conn)
    }
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<Accepted> {
        self.accept.recv().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_carries_frames_both_ways() {
        let (mut conn, mut peer) = Connection::pair(4);
        conn.send("hello".into()).unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("hello"));

        peer.send("world").await.unwrap();
        assert_eq!(conn.recv().await, Some(Inbound::Text("world".into())));

        peer.close(Some(1000), "bye").await;
        assert_eq!(
            conn.recv().await,
            Some(Inbound::Closed {
                code: Some(1000),
                reason: "bye".into()
            })
        );
    }

    #[tokio::test]
    async fn dropping_connection_ends_peer() {
        let (conn, mut peer) = Connection::pair(4);
        conn.close();
        assert!(peer.recv().await.is_none());
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn memory_connector_refuses_then_accepts() {
        let (connector, mut listener) = MemoryConnector::new();
        let url = Url::parse("wss://example.invalid/socket").unwrap();
        let headers = vec![("Authorization".to_owned(), "Bearer t".to_owned())];

        connector.refuse_next(1);
        assert!(connector.open(&url, &headers).await.is_err());

        let _conn = connector.open(&url, &headers).await.unwrap();
        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.header("authorization"), Some("Bearer t"));
    }

    #[tokio::test]
    async fn memory_connector_denies_once_with_status() {
        let (connector, mut listener) = MemoryConnector::new();
        let url = Url::parse("wss://example.invalid/socket").unwrap();

        connector.deny_next(403);
        let err = connector.open(&url, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Api { status: 403, .. }), "{err:?}");

        let _conn = connector.open(&url, &[]).await.unwrap();
        assert!(listener.accept().await.is_some());
    }
}
