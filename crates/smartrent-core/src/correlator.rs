// ── Command correlator ──
//
// Tracks in-flight commands by correlation id. Each command owns a oneshot
// responder; entries leave the table on ack, error, timeout, supersession or
// connection loss, whether or not anyone is still waiting on the receiver.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{AttributeChanges, DeviceSnapshot};

/// Outcome delivered to whoever issued a command.
pub type CommandResult = Result<Arc<DeviceSnapshot>, CoreError>;

/// Links a command to its acknowledgement. Sent on the wire as `ref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a wire `ref`. Refs that are not UUIDs never name a command.
    pub fn parse(reference: &str) -> Option<Self> {
        Uuid::parse_str(reference).ok().map(Self)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

// ── PendingCommand ───────────────────────────────────────────────────

/// A command that has been issued and not yet resolved.
#[derive(Debug)]
pub struct PendingCommand {
    id: CorrelationId,
    device_id: String,
    changes: AttributeChanges,
    issued_at: Instant,
    responder: oneshot::Sender<CommandResult>,
}

impl PendingCommand {
    pub fn new(
        device_id: impl Into<String>,
        changes: AttributeChanges,
        issued_at: Instant,
    ) -> (Self, oneshot::Receiver<CommandResult>) {
        let (responder, receiver) = oneshot::channel();
        (
            Self {
                id: CorrelationId::new(),
                device_id: device_id.into(),
                changes,
                issued_at,
                responder,
            },
            receiver,
        )
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn changes(&self) -> &AttributeChanges {
        &self.changes
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// Whether this command writes any of the same attributes on the same
    /// device.
    pub fn overlaps(&self, device_id: &str, changes: &AttributeChanges) -> bool {
        self.device_id == device_id && changes.keys().any(|k| self.changes.contains_key(k))
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.issued_at) >= timeout
    }

    /// Deliver the outcome. A caller that stopped waiting is not an error.
    pub fn complete(self, result: CommandResult) {
        if self.responder.send(result).is_err() {
            trace!(correlation_id = %self.id, "command result dropped; caller stopped waiting");
        }
    }
}

// ── Correlator ───────────────────────────────────────────────────────

/// In-flight command table keyed by correlation id.
#[derive(Debug)]
pub struct Correlator {
    timeout: Duration,
    pending: HashMap<CorrelationId, PendingCommand>,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a command under its correlation id.
    ///
    /// Overlapping commands are removed and returned, oldest first, without
    /// being completed so the caller can revert their overlays before
    /// failing them with [`CoreError::Superseded`].
    pub fn issue(&mut self, command: PendingCommand) -> Vec<PendingCommand> {
        let overlapping: Vec<CorrelationId> = self
            .pending
            .values()
            .filter(|p| p.overlaps(&command.device_id, &command.changes))
            .map(PendingCommand::id)
            .collect();

        let mut superseded: Vec<PendingCommand> = overlapping
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        superseded.sort_by_key(PendingCommand::issued_at);

        for old in &superseded {
            trace!(old = %old.id, new = %command.id, device_id = %command.device_id, "command superseded");
        }

        self.pending.insert(command.id, command);
        superseded
    }

    pub fn get(&self, id: CorrelationId) -> Option<&PendingCommand> {
        self.pending.get(&id)
    }

    /// Remove a command without completing it.
    pub fn take(&mut self, id: CorrelationId) -> Option<PendingCommand> {
        self.pending.remove(&id)
    }

    /// Complete and remove a command. Unknown ids are ignored.
    pub fn resolve(&mut self, id: CorrelationId, result: CommandResult) -> bool {
        match self.take(id) {
            Some(command) => {
                command.complete(result);
                true
            }
            None => false,
        }
    }

    /// Remove every command older than the timeout, oldest first. The
    /// caller completes them.
    pub fn sweep(&mut self, now: Instant) -> Vec<PendingCommand> {
        let timeout = self.timeout;
        let expired: Vec<CorrelationId> = self
            .pending
            .values()
            .filter(|p| p.is_expired(now, timeout))
            .map(PendingCommand::id)
            .collect();

        let mut removed: Vec<PendingCommand> = expired
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        removed.sort_by_key(PendingCommand::issued_at);
        removed
    }

    /// Remove every command, oldest first.
    pub fn drain(&mut self) -> Vec<PendingCommand> {
        let mut all: Vec<PendingCommand> = self.pending.drain().map(|(_, v)| v).collect();
        all.sort_by_key(PendingCommand::issued_at);
        all
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
