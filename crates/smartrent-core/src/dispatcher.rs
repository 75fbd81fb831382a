// ── Update dispatcher ──
//
// Owns every device state machine and the command correlator. Decoded
// frames are routed to the machine or command they concern; anything that
// concerns the session itself is handed back as a `Routed` value.
//
// Overlays are always reverted and the resulting snapshot published before
// a command's future is completed. A caller woken by an error never sees
// its own optimistic value still sitting in the store.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use smartrent_api::protocol::CODE_TOKEN_EXPIRED;
use smartrent_api::{ControlEvent, InboundFrame, OutboundFrame, RemoteDevice, WireAttributes};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::convert::{attributes_from_wire, changes_to_wire};
use crate::correlator::{CorrelationId, Correlator, PendingCommand};
use crate::error::CoreError;
use crate::machine::{AckState, DeviceStateMachine};
use crate::model::{AttributeChanges, ChangeCause, DeviceKind};
use crate::store::DeviceStore;

/// What the session has to do after a frame was routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Routed {
    Handled,
    /// An ack for a session-level request (auth, subscribe, sync).
    SessionAck { reference: String },
    /// An error frame that is not about a pending command.
    SessionError {
        reference: Option<String>,
        code: Option<String>,
        reason: String,
    },
    Control {
        event: ControlEvent,
        reason: Option<String>,
    },
    /// A command was rejected because the token expired.
    AuthExpired,
    /// Too many malformed frames in a row; the connection should go.
    TooManyProtocolErrors,
}

/// Kind and name learned from discovery before any snapshot arrives.
#[derive(Debug, Clone)]
struct DeviceHint {
    kind: DeviceKind,
    name: Option<String>,
}

pub(crate) struct Dispatcher {
    store: Arc<DeviceStore>,
    machines: HashMap<String, DeviceStateMachine>,
    subscribed: BTreeSet<String>,
    hints: HashMap<String, DeviceHint>,
    correlator: Correlator,
    protocol_errors: u32,
    max_protocol_errors: u32,
}

impl Dispatcher {
    pub(crate) fn new(
        store: Arc<DeviceStore>,
        command_timeout: Duration,
        max_protocol_errors: u32,
    ) -> Self {
        Self {
            store,
            machines: HashMap::new(),
            subscribed: BTreeSet::new(),
            hints: HashMap::new(),
            correlator: Correlator::new(command_timeout),
            protocol_errors: 0,
            max_protocol_errors,
        }
    }

    // ── Subscription set ─────────────────────────────────────────────

    pub(crate) fn subscribed_ids(&self) -> Vec<String> {
        self.subscribed.iter().cloned().collect()
    }

    pub(crate) fn has_subscriptions(&self) -> bool {
        !self.subscribed.is_empty()
    }

    pub(crate) fn is_subscribed(&self, device_id: &str) -> bool {
        self.subscribed.contains(device_id)
    }

    pub(crate) fn extend_subscription(&mut self, ids: impl IntoIterator<Item = String>) {
        self.subscribed.extend(ids);
    }

    /// Remember what discovery reported and subscribe to it.
    pub(crate) fn add_discovered(&mut self, devices: &[RemoteDevice]) {
        for device in devices {
            let Some(kind) = DeviceKind::from_wire(&device.device_type) else {
                continue;
            };
            self.hints.insert(
                device.id.clone(),
                DeviceHint {
                    kind,
                    name: device.name.clone(),
                },
            );
            self.subscribed.insert(device.id.clone());
        }
    }

    pub(crate) fn reset_protocol_errors(&mut self) {
        self.protocol_errors = 0;
    }

    pub(crate) fn pending_commands(&self) -> usize {
        self.correlator.len()
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.correlator.timeout()
    }

    fn kind_of(&self, device_id: &str) -> Option<DeviceKind> {
        self.machines
            .get(device_id)
            .map(DeviceStateMachine::kind)
            .or_else(|| self.hints.get(device_id).map(|h| h.kind))
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// Decode and route one text frame.
    pub(crate) fn route(&mut self, text: &str) -> Routed {
        let frame = match InboundFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.protocol_errors += 1;
                warn!(
                    error = %e,
                    consecutive = self.protocol_errors,
                    "dropping malformed frame"
                );
                if self.protocol_errors > self.max_protocol_errors {
                    return Routed::TooManyProtocolErrors;
                }
                return Routed::Handled;
            }
        };
        self.protocol_errors = 0;
        trace!(frame_type = frame.frame_type(), "frame received");

        match frame {
            InboundFrame::Event {
                device_id,
                version,
                attributes,
            } => {
                self.on_event(&device_id, version, &attributes);
                Routed::Handled
            }
            InboundFrame::Snapshot {
                device_id,
                kind,
                name,
                version,
                attributes,
            } => {
                self.on_snapshot(device_id, &kind, name, version, &attributes);
                Routed::Handled
            }
            InboundFrame::Ack {
                reference,
                version,
                attributes,
                ..
            } => self.on_ack(reference, version, attributes.as_ref()),
            InboundFrame::Error {
                reference,
                code,
                reason,
            } => self.on_error(reference, code, reason),
            InboundFrame::Control { event, reason } => Routed::Control { event, reason },
            InboundFrame::Unknown { frame_type } => {
                debug!(frame_type, "ignoring frame of unknown type");
                Routed::Handled
            }
        }
    }

    fn on_event(&mut self, device_id: &str, version: u64, wire: &WireAttributes) {
        if !self.is_subscribed(device_id) {
            trace!(device_id, "event for unsubscribed device");
            return;
        }
        let Some(machine) = self.machine_or_infer(device_id, wire) else {
            debug!(device_id, "event for device of unknown kind; waiting for a snapshot");
            return;
        };
        let attributes = attributes_from_wire(machine.kind(), device_id, wire);
        if !machine.apply_event(version, attributes) {
            trace!(device_id, version, "dropping stale event");
            return;
        }
        let snapshot = machine.current_state();
        self.store.publish(snapshot, ChangeCause::Event);
    }

    fn on_snapshot(
        &mut self,
        device_id: String,
        kind: &str,
        name: Option<String>,
        version: u64,
        wire: &WireAttributes,
    ) {
        if !self.is_subscribed(&device_id) {
            trace!(device_id, "snapshot for unsubscribed device");
            return;
        }
        let Some(kind) = DeviceKind::from_wire(kind) else {
            debug!(device_id, kind, "ignoring snapshot of unsupported kind");
            return;
        };
        let attributes = attributes_from_wire(kind, &device_id, wire);
        let name = name.or_else(|| self.hints.get(&device_id).and_then(|h| h.name.clone()));
        let machine = self
            .machines
            .entry(device_id.clone())
            .or_insert_with(|| DeviceStateMachine::new(device_id, kind, None));
        machine.apply_snapshot(kind, name, version, attributes);
        self.store.publish(machine.current_state(), ChangeCause::Resync);
    }

    fn on_ack(
        &mut self,
        reference: String,
        version: Option<u64>,
        wire: Option<&WireAttributes>,
    ) -> Routed {
        let pending = CorrelationId::parse(&reference)
            .and_then(|id| self.correlator.get(id))
            .map(|command| (command.id(), command.device_id().to_owned()));
        let Some((id, device_id)) = pending else {
            return Routed::SessionAck { reference };
        };

        let Some(machine) = self.machines.get_mut(&device_id) else {
            self.correlator.resolve(id, Err(CoreError::DeviceNotFound { device_id }));
            return Routed::Handled;
        };
        let ack = AckState {
            version,
            attributes: wire.map(|w| attributes_from_wire(machine.kind(), machine.id(), w)),
        };
        machine.confirm(id, ack);
        let snapshot = machine.current_state();
        debug!(
            correlation_id = %id,
            device_id,
            version = snapshot.version,
            "command acknowledged"
        );
        self.store.publish(Arc::clone(&snapshot), ChangeCause::Confirmed);
        self.correlator.resolve(id, Ok(snapshot));
        Routed::Handled
    }

    fn on_error(&mut self, reference: Option<String>, code: Option<String>, reason: String) -> Routed {
        let command = reference
            .as_deref()
            .and_then(CorrelationId::parse)
            .and_then(|id| self.correlator.take(id));
        let Some(command) = command else {
            return Routed::SessionError {
                reference,
                code,
                reason,
            };
        };

        warn!(
            correlation_id = %command.id(),
            device_id = command.device_id(),
            code = code.as_deref().unwrap_or("-"),
            reason,
            "command rejected"
        );
        let expired = code.as_deref() == Some(CODE_TOKEN_EXPIRED);
        self.fail(command, CoreError::CommandRejected { code, reason });
        if expired {
            Routed::AuthExpired
        } else {
            Routed::Handled
        }
    }

    fn machine_or_infer(
        &mut self,
        device_id: &str,
        wire: &WireAttributes,
    ) -> Option<&mut DeviceStateMachine> {
        if !self.machines.contains_key(device_id) {
            let hint = self.hints.get(device_id);
            let kind = match hint {
                Some(h) => h.kind,
                None => DeviceKind::infer(wire.keys().map(String::as_str))?,
            };
            let name = hint.and_then(|h| h.name.clone());
            self.machines.insert(
                device_id.to_owned(),
                DeviceStateMachine::new(device_id, kind, name),
            );
        }
        self.machines.get_mut(device_id)
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Check a write against the device's schema.
    pub(crate) fn validate(
        &self,
        device_id: &str,
        changes: &AttributeChanges,
    ) -> Result<AttributeChanges, CoreError> {
        let kind = self
            .kind_of(device_id)
            .filter(|_| self.is_subscribed(device_id))
            .ok_or_else(|| CoreError::DeviceNotFound {
                device_id: device_id.to_owned(),
            })?;
        kind.validate_change(changes)
    }

    /// Register a validated command, layer its optimistic values and build
    /// the frame to send. Overlapping commands are superseded.
    ///
    /// Returns `None` if the device is unknown; the command has then been
    /// completed with `DeviceNotFound`.
    pub(crate) fn issue(&mut self, command: PendingCommand) -> Option<OutboundFrame> {
        let device_id = command.device_id().to_owned();
        let Some(kind) = self.kind_of(&device_id) else {
            command.complete(Err(CoreError::DeviceNotFound { device_id }));
            return None;
        };

        let id = command.id();
        let changes = command.changes().clone();
        let frame = OutboundFrame::Command {
            reference: id.to_string(),
            device_id: device_id.clone(),
            attributes: changes_to_wire(&changes),
        };

        let superseded = self.correlator.issue(command);
        let name = self.hints.get(&device_id).and_then(|h| h.name.clone());
        let machine = self
            .machines
            .entry(device_id.clone())
            .or_insert_with(|| DeviceStateMachine::new(device_id.clone(), kind, name));
        for old in &superseded {
            machine.revert(old.id());
        }
        machine.request_change(id, changes);
        self.store.publish(machine.current_state(), ChangeCause::Optimistic);

        for old in superseded {
            old.complete(Err(CoreError::Superseded));
        }
        debug!(correlation_id = %id, device_id, "command issued");
        Some(frame)
    }

    /// Fail every in-flight command with `ConnectionLost`.
    pub(crate) fn connection_lost(&mut self) -> usize {
        let drained = self.correlator.drain();
        let count = drained.len();
        for command in drained {
            self.fail(command, CoreError::ConnectionLost);
        }
        count
    }

    /// Fail every command older than the command timeout.
    pub(crate) fn sweep(&mut self, now: Instant) -> usize {
        let timeout_ms = duration_ms(self.correlator.timeout());
        let expired = self.correlator.sweep(now);
        let count = expired.len();
        for command in expired {
            warn!(
                correlation_id = %command.id(),
                device_id = command.device_id(),
                timeout_ms,
                "command timed out"
            );
            self.fail(command, CoreError::CommandTimeout { timeout_ms });
        }
        count
    }

    fn fail(&mut self, command: PendingCommand, error: CoreError) {
        if let Some(machine) = self.machines.get_mut(command.device_id()) {
            if machine.revert(command.id()) {
                self.store.publish(machine.current_state(), ChangeCause::Reverted);
            }
        }
        command.complete(Err(error));
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
