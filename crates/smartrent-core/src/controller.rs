// ── Controller abstraction ──
//
// Host-facing handle to one SmartRent session. Reads come straight from the
// DeviceStore; writes and lifecycle calls are sent to the session task as
// request envelopes and answered over oneshot channels.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use smartrent_api::{ApiClient, Connector, CredentialStore, WsConnector};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ControllerConfig;
use crate::correlator::{CommandResult, CorrelationId};
use crate::error::CoreError;
use crate::model::{
    AttributeChanges, AttributeValue, DeviceChange, DeviceSnapshot, DeviceSummary, FanMode,
    HvacMode, attr,
};
use crate::session::{Reply, Request, Session};
use crate::store::DeviceStore;
use crate::stream::{DeviceFilter, DeviceStream};

const REQUEST_CHANNEL_SIZE: usize = 64;
const CHANGE_CHANNEL_SIZE: usize = 256;

// ── ConnectionState ──────────────────────────────────────────────

/// Connection state observable by hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// The socket accepted the token; subscription is still pending.
    Authenticated,
    /// Live: commands are sent and events flow.
    Subscribed,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting { attempt: u32 },
    /// Credentials were rejected. Nothing happens until `reconnect()`.
    AuthFailed { reason: String },
}

impl ConnectionState {
    pub fn is_subscribed(&self) -> bool {
        matches!(self, Self::Subscribed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Authenticated => f.write_str("authenticated"),
            Self::Subscribed => f.write_str("subscribed"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::AuthFailed { reason } => write!(f, "authentication failed: {reason}"),
        }
    }
}

// ── PendingChange ────────────────────────────────────────────────

/// A submitted command whose outcome has not been awaited yet.
#[derive(Debug)]
pub struct PendingChange {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<CommandResult>,
}

impl PendingChange {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Wait for the acknowledged device state.
    pub async fn wait(self) -> Result<Arc<DeviceSnapshot>, CoreError> {
        self.receiver.await.map_err(|_| CoreError::ConnectionLost)?
    }
}

// ── Controller ───────────────────────────────────────────────────

/// The main entry point for hosts.
///
/// Cheaply cloneable via `Arc<ControllerInner>`. The session task stops
/// when [`shutdown()`](Self::shutdown) is called or the last clone is
/// dropped.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    store: Arc<DeviceStore>,
    credentials: Arc<CredentialStore>,
    state: watch::Receiver<ConnectionState>,
    requests: mpsc::Sender<Request>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Connect over the realtime WebSocket and wait until subscribed.
    ///
    /// The socket trusts the same CA as the REST client.
    pub async fn connect(config: ControllerConfig) -> Result<Self, CoreError> {
        let connector = WsConnector::with_transport(&config.transport())?;
        Self::connect_with(config, connector).await
    }

    /// Like [`connect`](Self::connect) with a caller-supplied connector.
    ///
    /// Waits up to `connect_timeout` for the first subscription. On failure
    /// the session is stopped and the error returned; use
    /// [`start`](Self::start) to keep retrying in the background instead.
    pub async fn connect_with<C: Connector>(
        config: ControllerConfig,
        connector: C,
    ) -> Result<Self, CoreError> {
        let timeout = config.connect_timeout;
        let controller = Self::start(config, connector)?;
        if let Err(e) = controller.wait_until_subscribed(timeout).await {
            controller.shutdown().await;
            return Err(e);
        }
        Ok(controller)
    }

    /// Spawn the session task and return immediately. The session connects
    /// and reconnects on its own; watch [`state_changes`](Self::state_changes)
    /// to follow it.
    pub fn start<C: Connector>(config: ControllerConfig, connector: C) -> Result<Self, CoreError> {
        config.validate()?;

        let client = ApiClient::new(config.api_url.clone(), &config.transport())?;
        let credentials = Arc::new(CredentialStore::new(client, config.credentials())?);
        let store = Arc::new(DeviceStore::new(CHANGE_CHANNEL_SIZE));
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (requests, requests_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let cancel = CancellationToken::new();

        let session = Session::new(
            config.clone(),
            Arc::new(connector),
            Arc::clone(&credentials),
            Arc::clone(&store),
            state_tx,
            requests_rx,
            cancel.clone(),
        );
        let task = tokio::spawn(session.run());
        info!(email = %config.email, socket = %config.socket_url, "session started");

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                store,
                credentials,
                state,
                requests,
                cancel,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    /// Wait for `Subscribed`. Fails early when credentials are rejected.
    pub async fn wait_until_subscribed(&self, timeout: Duration) -> Result<(), CoreError> {
        let mut state = self.inner.state.clone();
        let reached = tokio::time::timeout(
            timeout,
            state.wait_for(|s| matches!(s, ConnectionState::Subscribed | ConnectionState::AuthFailed { .. })),
        )
        .await;

        match reached {
            Err(_) => Err(CoreError::Timeout {
                timeout_secs: timeout.as_secs(),
            }),
            Ok(Err(_)) => Err(CoreError::ConnectionLost),
            Ok(Ok(current)) => match &*current {
                ConnectionState::AuthFailed { reason } => Err(CoreError::AuthenticationFailed {
                    message: reason.clone(),
                }),
                _ => Ok(()),
            },
        }
    }

    /// Stop the session task and wait for it to finish. In-flight commands
    /// fail with `ConnectionLost`.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(task) = self.inner.task.lock().await.take() {
            let _ = task.await;
        }
        debug!("controller shut down");
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<DeviceStore> {
        &self.inner.store
    }

    /// The credential store backing this session, for REST calls made on
    /// the same login.
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.inner.credentials
    }

    // ── State observation ────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Every published device change, in order.
    pub fn updates(&self) -> broadcast::Receiver<DeviceChange> {
        self.inner.store.changes()
    }

    pub fn devices(&self) -> DeviceStream {
        self.inner.store.stream()
    }

    pub fn list_devices(&self) -> Vec<DeviceSummary> {
        self.inner.store.summaries()
    }

    /// Snapshots matching `filter`, ordered by id.
    pub fn devices_matching(&self, filter: DeviceFilter) -> Vec<Arc<DeviceSnapshot>> {
        self.inner
            .store
            .snapshot()
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect()
    }

    pub fn current_state(&self, device_id: &str) -> Result<Arc<DeviceSnapshot>, CoreError> {
        self.inner
            .store
            .get(device_id)
            .ok_or_else(|| CoreError::DeviceNotFound {
                device_id: device_id.to_owned(),
            })
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Send a change and return as soon as the session accepted it. The
    /// optimistic state is already visible in the store.
    pub async fn submit_change(
        &self,
        device_id: &str,
        changes: AttributeChanges,
    ) -> Result<PendingChange, CoreError> {
        let submitted = self
            .call(|reply| Request::Change {
                device_id: device_id.to_owned(),
                changes,
                reply,
            })
            .await?;
        Ok(PendingChange {
            correlation_id: submitted.id,
            receiver: submitted.receiver,
        })
    }

    /// Send a change and wait for the acknowledged state.
    pub async fn request_change(
        &self,
        device_id: &str,
        changes: AttributeChanges,
    ) -> Result<Arc<DeviceSnapshot>, CoreError> {
        self.submit_change(device_id, changes).await?.wait().await
    }

    /// Add devices to the subscription set and resync them.
    pub async fn subscribe(&self, device_ids: Vec<String>) -> Result<(), CoreError> {
        self.call(|reply| Request::Subscribe { device_ids, reply }).await
    }

    /// Ask for a fresh snapshot of one device.
    pub async fn refresh_device(&self, device_id: &str) -> Result<Arc<DeviceSnapshot>, CoreError> {
        self.call(|reply| Request::Refresh {
            device_id: device_id.to_owned(),
            reply,
        })
        .await?;
        self.current_state(device_id)
    }

    /// Resync every subscribed device. Returns once the snapshots are in
    /// the store.
    pub async fn refresh_all(&self) -> Result<(), CoreError> {
        self.call(|reply| Request::RefreshAll { reply }).await
    }

    /// Drop the current connection and dial again straight away. Also the
    /// way out of `AuthFailed`.
    pub async fn reconnect(&self) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Reconnect { reply }).await?;
        rx.await.map_err(|_| CoreError::NotConnected)
    }

    /// Close the connection and stay disconnected until `reconnect()`.
    pub async fn disconnect(&self) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Disconnect { reply }).await?;
        rx.await.map_err(|_| CoreError::NotConnected)
    }

    // ── Typed helpers ────────────────────────────────────────────

    pub async fn set_locked(
        &self,
        device_id: &str,
        locked: bool,
    ) -> Result<Arc<DeviceSnapshot>, CoreError> {
        self.request_change(device_id, change(attr::LOCKED, locked)).await
    }

    pub async fn set_hvac_mode(
        &self,
        device_id: &str,
        mode: HvacMode,
    ) -> Result<Arc<DeviceSnapshot>, CoreError> {
        self.request_change(device_id, change(attr::MODE, mode.to_string())).await
    }

    pub async fn set_fan_mode(
        &self,
        device_id: &str,
        mode: FanMode,
    ) -> Result<Arc<DeviceSnapshot>, CoreError> {
        self.request_change(device_id, change(attr::FAN_MODE, mode.to_string())).await
    }

    pub async fn set_cooling_setpoint(
        &self,
        device_id: &str,
        value: f64,
    ) -> Result<Arc<DeviceSnapshot>, CoreError> {
        self.request_change(device_id, change(attr::COOLING_SETPOINT, value)).await
    }

    pub async fn set_heating_setpoint(
        &self,
        device_id: &str,
        value: f64,
    ) -> Result<Arc<DeviceSnapshot>, CoreError> {
        self.request_change(device_id, change(attr::HEATING_SETPOINT, value)).await
    }

    /// Move the cooling setpoint by `delta` from its current effective value.
    pub async fn adjust_cooling_setpoint(
        &self,
        device_id: &str,
        delta: f64,
    ) -> Result<Arc<DeviceSnapshot>, CoreError> {
        let current = self
            .current_state(device_id)?
            .cooling_setpoint()
            .ok_or_else(|| CoreError::invalid(format!("{device_id} has no cooling setpoint")))?;
        self.set_cooling_setpoint(device_id, current + delta).await
    }

    /// Move the heating setpoint by `delta` from its current effective value.
    pub async fn adjust_heating_setpoint(
        &self,
        device_id: &str,
        delta: f64,
    ) -> Result<Arc<DeviceSnapshot>, CoreError> {
        let current = self
            .current_state(device_id)?
            .heating_setpoint()
            .ok_or_else(|| CoreError::invalid(format!("{device_id} has no heating setpoint")))?;
        self.set_heating_setpoint(device_id, current + delta).await
    }

    // ── Plumbing ─────────────────────────────────────────────────

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| CoreError::NotConnected)?
    }

    async fn send(&self, request: Request) -> Result<(), CoreError> {
        self.inner
            .requests
            .send(request)
            .await
            .map_err(|_| CoreError::NotConnected)
    }
}

fn change(name: &str, value: impl Into<AttributeValue>) -> AttributeChanges {
    AttributeChanges::from([(name.to_owned(), value.into())])
}
