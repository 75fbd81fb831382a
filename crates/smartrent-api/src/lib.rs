// smartrent-api: Async Rust client for the SmartRent control service (REST auth + realtime socket)

pub mod auth;
pub mod client;
pub mod connection;
pub mod devices;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod websocket;

pub use auth::{AccessToken, CredentialStore, Credentials, TotpGenerator};
pub use client::ApiClient;
pub use connection::{
    Accepted, Connection, Connector, Inbound, MemoryConnector, MemoryListener, Peer,
};
pub use devices::{Hub, RemoteDevice};
pub use error::Error;
pub use protocol::{ControlEvent, FrameToken, InboundFrame, OutboundFrame, WireAttributes};
pub use transport::{TlsMode, TransportConfig};
pub use websocket::{ReconnectConfig, WsConnector, calculate_backoff};
