// ── Session actor ──
//
// One task owns the connection, the dispatcher (and with it every device
// state machine and the correlator), the offline queue and the control
// waiters. Hosts talk to it through `Request` envelopes; it never shares
// mutable state.
//
// Link lifecycle:
//   Down ──dial──▶ Dialing ──open──▶ Handshake(auth → subscribe) ──▶ Up
//     ▲                │                    │                        │
//     └──── backoff ◀──┴────────────────────┴──── loss / close ◀─────┘
//
// `Down { retry_at: None }` is parked: either the host disconnected or the
// credentials were rejected. Only a `Reconnect` request leaves it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem;
use std::sync::Arc;

use smartrent_api::protocol::{CODE_TOKEN_EXPIRED, CODE_UNAUTHORIZED};
use smartrent_api::{
    AccessToken, Connection, Connector, ControlEvent, CredentialStore, FrameToken, Inbound,
    OutboundFrame, RemoteDevice, calculate_backoff,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::{ControllerConfig, OfflinePolicy};
use crate::controller::ConnectionState;
use crate::correlator::{CommandResult, CorrelationId, PendingCommand};
use crate::dispatcher::{Dispatcher, Routed, duration_ms};
use crate::error::CoreError;
use crate::model::AttributeChanges;
use crate::store::DeviceStore;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, CoreError>>;

/// A command accepted by the session.
#[derive(Debug)]
pub(crate) struct Submitted {
    pub id: CorrelationId,
    pub receiver: oneshot::Receiver<CommandResult>,
}

/// Host request envelope.
#[derive(Debug)]
pub(crate) enum Request {
    Change {
        device_id: String,
        changes: AttributeChanges,
        reply: Reply<Submitted>,
    },
    Subscribe {
        device_ids: Vec<String>,
        reply: Reply<()>,
    },
    Refresh {
        device_id: String,
        reply: Reply<()>,
    },
    /// Resync every subscribed device.
    RefreshAll {
        reply: Reply<()>,
    },
    Reconnect {
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

// ── Link state ───────────────────────────────────────────────────────

struct Dialed {
    conn: Connection,
    token: AccessToken,
    discovered: Option<Vec<RemoteDevice>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Auth,
    Subscribe,
}

enum Link {
    Down {
        retry_at: Option<Instant>,
    },
    Dialing {
        result: oneshot::Receiver<Result<Dialed, CoreError>>,
        task: JoinHandle<()>,
    },
    Handshake {
        conn: Connection,
        stage: Stage,
        reference: String,
        deadline: Instant,
    },
    Up {
        conn: Connection,
        reauth: Option<oneshot::Receiver<Result<AccessToken, CoreError>>>,
    },
}

enum LinkEvent {
    RetryDue,
    Dialed(Result<Dialed, CoreError>),
    Inbound(Option<Inbound>),
    HandshakeTimeout,
    Reauthed(Result<AccessToken, CoreError>),
}

/// Wait for whatever the current link state is waiting on.
async fn next_link_event(link: &mut Link) -> LinkEvent {
    match link {
        Link::Down {
            retry_at: Some(at),
        } => {
            sleep_until(*at).await;
            LinkEvent::RetryDue
        }
        Link::Down { retry_at: None } => std::future::pending().await,
        Link::Dialing { result, .. } => LinkEvent::Dialed(
            result
                .await
                .unwrap_or_else(|_| Err(CoreError::Internal("dial task ended without a result".into()))),
        ),
        Link::Handshake { conn, deadline, .. } => {
            let deadline = *deadline;
            tokio::select! {
                item = conn.recv() => LinkEvent::Inbound(item),
                () = sleep_until(deadline) => LinkEvent::HandshakeTimeout,
            }
        }
        Link::Up {
            conn,
            reauth: Some(pending),
        } => tokio::select! {
            item = conn.recv() => LinkEvent::Inbound(item),
            result = pending => LinkEvent::Reauthed(
                result.unwrap_or_else(|_| Err(CoreError::Internal("token refresh task ended".into()))),
            ),
        },
        Link::Up { conn, reauth: None } => LinkEvent::Inbound(conn.recv().await),
    }
}

// ── Control waiters ──────────────────────────────────────────────────

enum AckAction {
    Subscribe(Vec<String>),
    Sync,
}

struct Waiter {
    deadline: Instant,
    action: AckAction,
    reply: Reply<()>,
}

// ── Session ──────────────────────────────────────────────────────────

pub(crate) struct Session<C: Connector> {
    config: ControllerConfig,
    connector: Arc<C>,
    credentials: Arc<CredentialStore>,
    dispatcher: Dispatcher,
    state: watch::Sender<ConnectionState>,
    requests: mpsc::Receiver<Request>,
    cancel: CancellationToken,
    link: Link,
    attempt: u32,
    token_retry_used: bool,
    ref_counter: u64,
    reauth_ref: Option<String>,
    waiters: HashMap<String, Waiter>,
    offline: VecDeque<PendingCommand>,
}

impl<C: Connector> Session<C> {
    pub(crate) fn new(
        config: ControllerConfig,
        connector: Arc<C>,
        credentials: Arc<CredentialStore>,
        store: Arc<DeviceStore>,
        state: watch::Sender<ConnectionState>,
        requests: mpsc::Receiver<Request>,
        cancel: CancellationToken,
    ) -> Self {
        let mut dispatcher = Dispatcher::new(store, config.command_timeout, config.max_protocol_errors);
        dispatcher.extend_subscription(config.device_ids.iter().cloned());
        Self {
            config,
            connector,
            credentials,
            dispatcher,
            state,
            requests,
            cancel,
            link: Link::Down { retry_at: None },
            attempt: 0,
            token_retry_used: false,
            ref_counter: 0,
            reauth_ref: None,
            waiters: HashMap::new(),
            offline: VecDeque::new(),
        }
    }

    /// Drive the session until cancelled or every handle is dropped.
    pub(crate) async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.start_dial();

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => break,
                },
                event = next_link_event(&mut self.link) => self.on_link_event(event),
                _ = sweep.tick() => self.on_sweep(),
            }
        }

        self.shut_down(&"session stopped");
        debug!("session task finished");
    }

    // ── Dialing ──────────────────────────────────────────────────────

    fn start_dial(&mut self) {
        self.set_state(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let credentials = Arc::clone(&self.credentials);
        let url = self.config.socket_url.clone();
        let timeout = self.config.handshake_timeout;
        let discover = !self.dispatcher.has_subscriptions();

        let (tx, result) = oneshot::channel();
        let task = tokio::spawn(async move {
            let outcome = dial(&*connector, &credentials, &url, timeout, discover).await;
            let _ = tx.send(outcome);
        });
        self.set_link(Link::Dialing { result, task });
    }

    fn on_dialed(&mut self, result: Result<Dialed, CoreError>) {
        let dialed = match result {
            Ok(dialed) => dialed,
            Err(e) if e.is_auth_failure() => return self.park_auth_failed(e.to_string()),
            Err(e) if e.is_token_rejected() => return self.retry_with_fresh_token(&e),
            Err(e) => return self.schedule_reconnect(&e),
        };

        if let Some(devices) = &dialed.discovered {
            self.dispatcher.add_discovered(devices);
            info!(devices = devices.len(), "discovered devices");
        }
        self.dispatcher.reset_protocol_errors();

        let reference = self.next_ref("auth");
        let frame = OutboundFrame::Auth {
            reference: reference.clone(),
            token: FrameToken::new(dialed.token.expose()),
        };
        if let Err(e) = send_frame(&dialed.conn, &frame) {
            return self.schedule_reconnect(&e);
        }
        self.set_link(Link::Handshake {
            conn: dialed.conn,
            stage: Stage::Auth,
            reference,
            deadline: Instant::now() + self.config.handshake_timeout,
        });
    }

    // ── Handshake ────────────────────────────────────────────────────

    fn on_handshake_inbound(&mut self, item: Option<Inbound>) {
        let text = match item {
            Some(Inbound::Text(text)) => text,
            Some(Inbound::Closed { code, reason }) => {
                warn!(code, reason, "socket closed during handshake");
                return self.schedule_reconnect(&"closed during handshake");
            }
            None => return self.schedule_reconnect(&"connection dropped during handshake"),
        };

        match self.dispatcher.route(&text) {
            Routed::SessionAck { reference } => self.on_handshake_ack(&reference),
            Routed::SessionError {
                reference,
                code,
                reason,
            } => {
                let ours = match &self.link {
                    Link::Handshake { reference: r, .. } => reference.as_deref().is_none_or(|x| x == r),
                    _ => false,
                };
                if ours {
                    self.on_handshake_error(code.as_deref(), reason);
                } else {
                    debug!(reference, reason, "error for unknown ref during handshake");
                }
            }
            Routed::TooManyProtocolErrors => self.schedule_reconnect(&"too many malformed frames"),
            Routed::Control {
                event: ControlEvent::Close,
                reason,
            } => {
                info!(reason, "server closed the connection during handshake");
                self.schedule_reconnect(&"server requested close");
            }
            Routed::Handled | Routed::Control { .. } | Routed::AuthExpired => {}
        }
    }

    fn on_handshake_ack(&mut self, reference: &str) {
        let stage = match &self.link {
            Link::Handshake {
                stage,
                reference: expected,
                ..
            } if expected == reference => *stage,
            _ => {
                debug!(reference, "ack for unknown ref during handshake");
                return;
            }
        };

        match stage {
            Stage::Auth => {
                self.set_state(ConnectionState::Authenticated);
                let reference = self.next_ref("subscribe");
                let frame = OutboundFrame::Subscribe {
                    reference: reference.clone(),
                    device_ids: self.dispatcher.subscribed_ids(),
                };
                self.send(&frame);
                let next_deadline = Instant::now() + self.config.handshake_timeout;
                if let Link::Handshake {
                    stage,
                    reference: current,
                    deadline,
                    ..
                } = &mut self.link
                {
                    *stage = Stage::Subscribe;
                    *current = reference;
                    *deadline = next_deadline;
                }
            }
            Stage::Subscribe => self.on_subscribed(),
        }
    }

    fn on_handshake_error(&mut self, code: Option<&str>, reason: String) {
        match code {
            Some(CODE_TOKEN_EXPIRED) => self.retry_with_fresh_token(&reason),
            Some(CODE_UNAUTHORIZED) => self.park_auth_failed(reason),
            _ => self.schedule_reconnect(&reason),
        }
    }

    /// The server refused a token that looked fresh locally. Drop it and
    /// redial at once; a second refusal before subscribing backs off.
    fn retry_with_fresh_token(&mut self, reason: &dyn fmt::Display) {
        self.credentials.invalidate();
        if self.token_retry_used {
            return self.schedule_reconnect(reason);
        }
        info!(%reason, "token refused; redialing with a fresh one");
        self.token_retry_used = true;
        self.set_link(Link::Down {
            retry_at: Some(Instant::now()),
        });
    }

    fn on_subscribed(&mut self) {
        let Link::Handshake { conn, .. } = mem::replace(&mut self.link, Link::Down { retry_at: None })
        else {
            return;
        };
        self.link = Link::Up { conn, reauth: None };
        self.attempt = 0;
        self.token_retry_used = false;

        let devices = self.dispatcher.subscribed_ids();
        info!(devices = devices.len(), "subscribed");
        self.set_state(ConnectionState::Subscribed);

        // Every (re)connect resyncs the full subscription set.
        self.send_sync(devices);
        self.flush_offline();
    }

    // ── Connected ────────────────────────────────────────────────────

    fn on_up_inbound(&mut self, item: Option<Inbound>) {
        let text = match item {
            Some(Inbound::Text(text)) => text,
            Some(Inbound::Closed { code, reason }) => {
                warn!(code, reason, "socket closed");
                return self.connection_lost(&"socket closed", false);
            }
            None => return self.connection_lost(&"connection dropped", false),
        };

        match self.dispatcher.route(&text) {
            Routed::Handled => {}
            Routed::SessionAck { reference } => self.on_session_ack(&reference),
            Routed::SessionError {
                reference,
                code,
                reason,
            } => self.on_session_error(reference, code, reason),
            Routed::Control { event, reason } => match event {
                ControlEvent::Heartbeat => trace!("heartbeat"),
                ControlEvent::Close => {
                    info!(reason, "server requested close");
                    self.connection_lost(&"server requested close", true);
                }
                ControlEvent::Reauthenticate => self.start_reauth(false),
                ControlEvent::Other => debug!(reason, "ignoring unknown control event"),
            },
            Routed::AuthExpired => self.start_reauth(true),
            Routed::TooManyProtocolErrors => self.connection_lost(&"too many malformed frames", false),
        }
    }

    fn on_session_ack(&mut self, reference: &str) {
        if self.reauth_ref.as_deref() == Some(reference) {
            self.reauth_ref = None;
            info!("re-authenticated");
            return;
        }
        let Some(waiter) = self.waiters.remove(reference) else {
            trace!(reference, "session ack");
            return;
        };
        if let AckAction::Subscribe(ids) = waiter.action {
            self.dispatcher.extend_subscription(ids.iter().cloned());
            self.send_sync(ids);
        }
        let _ = waiter.reply.send(Ok(()));
    }

    fn on_session_error(&mut self, reference: Option<String>, code: Option<String>, reason: String) {
        match code.as_deref() {
            Some(CODE_TOKEN_EXPIRED) => return self.start_reauth(true),
            Some(CODE_UNAUTHORIZED) => return self.park_auth_failed(reason),
            _ => {}
        }
        if reference.is_some() && reference == self.reauth_ref {
            self.reauth_ref = None;
            return self.connection_lost(&format!("re-authentication rejected: {reason}"), false);
        }
        let waiter = reference.as_deref().and_then(|r| self.waiters.remove(r));
        match waiter {
            Some(waiter) => {
                let _ = waiter.reply.send(Err(CoreError::CommandRejected { code, reason }));
            }
            None => warn!(reference, code, reason, "server error"),
        }
    }

    fn start_reauth(&mut self, invalidate: bool) {
        let Link::Up { reauth, .. } = &mut self.link else {
            return;
        };
        if reauth.is_some() {
            return;
        }
        if invalidate {
            self.credentials.invalidate();
        }
        debug!(invalidate, "re-authenticating on the open connection");
        let credentials = Arc::clone(&self.credentials);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(credentials.valid_token().await.map_err(CoreError::from));
        });
        *reauth = Some(rx);
    }

    fn on_reauthed(&mut self, result: Result<AccessToken, CoreError>) {
        if let Link::Up { reauth, .. } = &mut self.link {
            *reauth = None;
        }
        match result {
            Ok(token) => {
                let reference = self.next_ref("auth");
                self.send(&OutboundFrame::Auth {
                    reference: reference.clone(),
                    token: FrameToken::new(token.expose()),
                });
                self.reauth_ref = Some(reference);
            }
            Err(e) if e.is_auth_failure() => self.park_auth_failed(e.to_string()),
            Err(e) => self.connection_lost(&e, false),
        }
    }

    // ── Host requests ────────────────────────────────────────────────

    fn on_request(&mut self, request: Request) {
        match request {
            Request::Change {
                device_id,
                changes,
                reply,
            } => {
                let _ = reply.send(self.submit(device_id, &changes));
            }
            Request::Subscribe { device_ids, reply } => self.request_subscribe(device_ids, reply),
            Request::Refresh { device_id, reply } => self.request_refresh(device_id, reply),
            Request::RefreshAll { reply } => {
                let device_ids = self.dispatcher.subscribed_ids();
                self.request_sync(device_ids, reply);
            }
            Request::Reconnect { reply } => {
                info!("reconnect requested");
                self.teardown(&"reconnect requested");
                self.attempt = 0;
                self.token_retry_used = false;
                self.start_dial();
                let _ = reply.send(());
            }
            Request::Disconnect { reply } => {
                info!("disconnect requested");
                self.shut_down(&"disconnect requested");
                let _ = reply.send(());
            }
        }
    }

    fn submit(&mut self, device_id: String, changes: &AttributeChanges) -> Result<Submitted, CoreError> {
        let changes = self.dispatcher.validate(&device_id, changes)?;
        let connected = matches!(self.link, Link::Up { .. });
        if !connected && self.config.offline_policy == OfflinePolicy::Reject {
            return Err(CoreError::NotConnected);
        }

        let (command, receiver) = PendingCommand::new(device_id, changes, Instant::now());
        let id = command.id();
        if connected {
            if let Some(frame) = self.dispatcher.issue(command) {
                self.send(&frame);
            }
        } else {
            self.enqueue(command)?;
        }
        Ok(Submitted { id, receiver })
    }

    fn enqueue(&mut self, command: PendingCommand) -> Result<(), CoreError> {
        let OfflinePolicy::Queue { capacity } = self.config.offline_policy else {
            return Err(CoreError::NotConnected);
        };

        let (superseded, kept): (Vec<_>, Vec<_>) = mem::take(&mut self.offline)
            .into_iter()
            .partition(|queued| queued.overlaps(command.device_id(), command.changes()));
        self.offline = kept.into();
        for old in superseded {
            old.complete(Err(CoreError::Superseded));
        }

        if self.offline.len() >= capacity {
            warn!(capacity, "offline queue full; rejecting command");
            return Err(CoreError::NotConnected);
        }
        debug!(correlation_id = %command.id(), device_id = command.device_id(), "queued while offline");
        self.offline.push_back(command);
        Ok(())
    }

    fn flush_offline(&mut self) {
        if self.offline.is_empty() {
            return;
        }
        let now = Instant::now();
        let timeout = self.dispatcher.timeout();
        let queued = mem::take(&mut self.offline);
        info!(commands = queued.len(), "sending commands queued while offline");
        for command in queued {
            if command.is_expired(now, timeout) {
                command.complete(Err(CoreError::CommandTimeout {
                    timeout_ms: duration_ms(timeout),
                }));
            } else if let Some(frame) = self.dispatcher.issue(command) {
                self.send(&frame);
            }
        }
    }

    fn request_subscribe(&mut self, device_ids: Vec<String>, reply: Reply<()>) {
        if !matches!(self.link, Link::Up { .. }) {
            let _ = reply.send(Err(CoreError::NotConnected));
            return;
        }
        let reference = self.next_ref("subscribe");
        self.send(&OutboundFrame::Subscribe {
            reference: reference.clone(),
            device_ids: device_ids.clone(),
        });
        self.add_waiter(reference, AckAction::Subscribe(device_ids), reply);
    }

    fn request_refresh(&mut self, device_id: String, reply: Reply<()>) {
        if !self.dispatcher.is_subscribed(&device_id) {
            let _ = reply.send(Err(CoreError::DeviceNotFound { device_id }));
            return;
        }
        self.request_sync(vec![device_id], reply);
    }

    fn request_sync(&mut self, device_ids: Vec<String>, reply: Reply<()>) {
        if !matches!(self.link, Link::Up { .. }) {
            let _ = reply.send(Err(CoreError::NotConnected));
            return;
        }
        if device_ids.is_empty() {
            let _ = reply.send(Ok(()));
            return;
        }
        let reference = self.next_ref("sync");
        self.send(&OutboundFrame::Sync {
            reference: reference.clone(),
            device_ids,
        });
        self.add_waiter(reference, AckAction::Sync, reply);
    }

    fn add_waiter(&mut self, reference: String, action: AckAction, reply: Reply<()>) {
        self.waiters.insert(
            reference,
            Waiter {
                deadline: Instant::now() + self.config.command_timeout,
                action,
                reply,
            },
        );
    }

    // ── Periodic sweep ───────────────────────────────────────────────

    fn on_sweep(&mut self) {
        let now = Instant::now();
        let timed_out = self.dispatcher.sweep(now);
        trace!(
            timed_out,
            in_flight = self.dispatcher.pending_commands(),
            queued = self.offline.len(),
            "sweep"
        );

        let timeout = self.dispatcher.timeout();
        let timeout_ms = duration_ms(timeout);
        if self.offline.iter().any(|c| c.is_expired(now, timeout)) {
            let (expired, kept): (Vec<_>, Vec<_>) = mem::take(&mut self.offline)
                .into_iter()
                .partition(|c| c.is_expired(now, timeout));
            self.offline = kept.into();
            for command in expired {
                debug!(correlation_id = %command.id(), "queued command expired");
                command.complete(Err(CoreError::CommandTimeout { timeout_ms }));
            }
        }

        let expired: Vec<String> = self
            .waiters
            .iter()
            .filter(|(_, w)| w.deadline <= now)
            .map(|(r, _)| r.clone())
            .collect();
        for reference in expired {
            if let Some(waiter) = self.waiters.remove(&reference) {
                debug!(reference, "session request timed out");
                let _ = waiter.reply.send(Err(CoreError::CommandTimeout { timeout_ms }));
            }
        }
    }

    // ── Link events ──────────────────────────────────────────────────

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::RetryDue => self.start_dial(),
            LinkEvent::Dialed(result) => self.on_dialed(result),
            LinkEvent::Inbound(item) => {
                if matches!(self.link, Link::Handshake { .. }) {
                    self.on_handshake_inbound(item);
                } else {
                    self.on_up_inbound(item);
                }
            }
            LinkEvent::HandshakeTimeout => self.schedule_reconnect(&"handshake timed out"),
            LinkEvent::Reauthed(result) => self.on_reauthed(result),
        }
    }

    // ── Failure paths ────────────────────────────────────────────────

    /// An established connection went away: fail what was in flight and
    /// reconnect, immediately when the server asked for it.
    fn connection_lost(&mut self, reason: &dyn fmt::Display, immediate: bool) {
        self.teardown(reason);
        if immediate {
            self.set_link(Link::Down {
                retry_at: Some(Instant::now()),
            });
        } else {
            self.schedule_reconnect(reason);
        }
    }

    /// Close the link and fail everything waiting on it. Leaves the link
    /// parked and the state `Disconnected`.
    fn teardown(&mut self, reason: &dyn fmt::Display) {
        self.set_link(Link::Down { retry_at: None });
        self.reauth_ref = None;
        self.set_state(ConnectionState::Disconnected);

        let failed = self.dispatcher.connection_lost();
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.reply.send(Err(CoreError::ConnectionLost));
        }
        if failed > 0 {
            warn!(%reason, commands = failed, "connection lost with commands in flight");
        } else {
            debug!(%reason, "connection closed");
        }
    }

    /// Teardown that also drops queued commands: the host asked to stop.
    fn shut_down(&mut self, reason: &dyn fmt::Display) {
        self.teardown(reason);
        for command in self.offline.drain(..) {
            command.complete(Err(CoreError::NotConnected));
        }
    }

    fn schedule_reconnect(&mut self, reason: &dyn fmt::Display) {
        let delay = calculate_backoff(self.attempt, &self.config.reconnect);
        self.attempt = self.attempt.saturating_add(1);
        warn!(
            attempt = self.attempt,
            delay_ms = duration_ms(delay),
            %reason,
            "connection attempt failed; retrying"
        );
        self.set_link(Link::Down {
            retry_at: Some(Instant::now() + delay),
        });
        self.set_state(ConnectionState::Reconnecting {
            attempt: self.attempt,
        });
    }

    fn park_auth_failed(&mut self, reason: String) {
        error!(reason, "authentication failed; waiting for an explicit reconnect");
        self.shut_down(&"authentication failed");
        self.set_state(ConnectionState::AuthFailed { reason });
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn set_link(&mut self, next: Link) {
        if let Link::Dialing { task, .. } = mem::replace(&mut self.link, next) {
            task.abort();
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            debug!(state = %next, "connection state changed");
        }
    }

    fn next_ref(&mut self, kind: &str) -> String {
        self.ref_counter += 1;
        format!("{kind}-{}", self.ref_counter)
    }

    fn send_sync(&mut self, device_ids: Vec<String>) {
        if device_ids.is_empty() {
            return;
        }
        let reference = self.next_ref("sync");
        self.send(&OutboundFrame::Sync {
            reference,
            device_ids,
        });
    }

    fn send(&self, frame: &OutboundFrame) {
        let conn = match &self.link {
            Link::Up { conn, .. } | Link::Handshake { conn, .. } => conn,
            Link::Down { .. } | Link::Dialing { .. } => {
                debug!(reference = frame.reference(), "no connection; frame dropped");
                return;
            }
        };
        if let Err(e) = send_frame(conn, frame) {
            warn!(error = %e, reference = frame.reference(), "failed to send frame");
        }
    }
}

/// Fetch a token, discover devices if needed, and open the socket.
async fn dial<C: Connector>(
    connector: &C,
    credentials: &CredentialStore,
    url: &Url,
    timeout: std::time::Duration,
    discover: bool,
) -> Result<Dialed, CoreError> {
    let token = credentials.valid_token().await?;
    let discovered = if discover {
        Some(credentials.client().discover_devices(&token).await?)
    } else {
        None
    };

    let headers = [(
        "Authorization".to_owned(),
        format!("Bearer {}", token.expose()),
    )];
    let conn = tokio::time::timeout(timeout, connector.open(url, &headers))
        .await
        .map_err(|_| CoreError::Timeout {
            timeout_secs: timeout.as_secs(),
        })??;

    Ok(Dialed {
        conn,
        token,
        discovered,
    })
}

fn send_frame(conn: &Connection, frame: &OutboundFrame) -> Result<(), CoreError> {
    trace!(reference = frame.reference(), "sending frame");
    conn.send(frame.encode()?)?;
    Ok(())
}
