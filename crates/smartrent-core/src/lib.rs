// smartrent-core: Session engine and device state sync between smartrent-api and hosts.
//
// A single session task owns the socket, every device state machine and the
// command correlator. Hosts hold a cheap `Controller` handle: reads come from
// the snapshot store, writes go through the session as request envelopes.

pub mod config;
pub mod controller;
mod convert;
pub mod correlator;
mod dispatcher;
pub mod error;
pub mod machine;
pub mod model;
mod session;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{ControllerConfig, OfflinePolicy};
pub use controller::{ConnectionState, Controller, PendingChange};
pub use correlator::{CommandResult, CorrelationId, Correlator, PendingCommand};
pub use error::CoreError;
pub use machine::{AckState, DeviceStateMachine};
pub use store::DeviceStore;
pub use stream::{DeviceFilter, DeviceStream, DeviceWatchStream};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    AttributeChanges, AttributeSpec, AttributeValue, Attributes, ChangeCause, DeviceChange,
    DeviceKind, DeviceSnapshot, DeviceSummary, FanMode, HvacMode, OperatingState, ValueType, attr,
};

// Transport pieces hosts need to pick a connector or tune reconnects.
pub use smartrent_api::{MemoryConnector, MemoryListener, ReconnectConfig, TlsMode, WsConnector};
