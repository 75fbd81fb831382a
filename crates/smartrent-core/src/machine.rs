// ── Device state machine ──
//
// One per device. Holds the last confirmed server state plus an ordered
// list of optimistic overlays, one per in-flight command. Readers only ever
// see the prebuilt `Arc<DeviceSnapshot>`, rebuilt after every mutation.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::correlator::CorrelationId;
use crate::error::CoreError;
use crate::model::{AttributeChanges, Attributes, DeviceKind, DeviceSnapshot};

/// State carried by a command acknowledgement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AckState {
    pub version: Option<u64>,
    pub attributes: Option<Attributes>,
}

#[derive(Debug)]
pub struct DeviceStateMachine {
    id: String,
    kind: DeviceKind,
    name: Option<String>,
    /// `None` until the first event or snapshot.
    version: Option<u64>,
    confirmed: Attributes,
    /// Optimistic writes in issue order; later entries win.
    overlays: Vec<(CorrelationId, AttributeChanges)>,
    updated_at: DateTime<Utc>,
    snapshot: Arc<DeviceSnapshot>,
}

impl DeviceStateMachine {
    pub fn new(id: impl Into<String>, kind: DeviceKind, name: Option<String>) -> Self {
        let id = id.into();
        let updated_at = Utc::now();
        let snapshot = Arc::new(DeviceSnapshot {
            id: id.clone(),
            kind,
            name: name.clone(),
            version: 0,
            attributes: Attributes::new(),
            pending: BTreeSet::new(),
            updated_at,
        });
        Self {
            id,
            kind,
            name,
            version: None,
            confirmed: Attributes::new(),
            overlays: Vec::new(),
            updated_at,
            snapshot,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn confirmed(&self) -> &Attributes {
        &self.confirmed
    }

    pub fn has_pending(&self) -> bool {
        !self.overlays.is_empty()
    }

    /// Merge a push event. Events at or below the current version are
    /// stale or duplicates and leave the state untouched.
    pub fn apply_event(&mut self, version: u64, attributes: Attributes) -> bool {
        if self.version.is_some_and(|current| version <= current) {
            return false;
        }
        self.confirmed.extend(attributes);
        self.version = Some(version);
        self.touch();
        true
    }

    /// Replace the confirmed state wholesale. In-flight overlays survive;
    /// they are cleared by their own ack, error or timeout.
    pub fn apply_snapshot(
        &mut self,
        kind: DeviceKind,
        name: Option<String>,
        version: u64,
        attributes: Attributes,
    ) {
        self.kind = kind;
        if name.is_some() {
            self.name = name;
        }
        self.confirmed = attributes;
        self.version = Some(version);
        self.touch();
    }

    pub fn validate(&self, changes: &AttributeChanges) -> Result<AttributeChanges, CoreError> {
        self.kind.validate_change(changes)
    }

    /// Layer an optimistic write for command `id` over the confirmed state.
    pub fn request_change(&mut self, id: CorrelationId, changes: AttributeChanges) {
        self.overlays.push((id, changes));
        self.touch();
    }

    /// Clear the overlay of command `id` and fold the acknowledged state in.
    ///
    /// An ack with attributes merges them when its version is newer than
    /// the current one (or carries no version). A bare ack promotes the
    /// command's own values to confirmed.
    pub fn confirm(&mut self, id: CorrelationId, ack: AckState) -> bool {
        let overlay = self.take_overlay(id);
        let newer = match (ack.version, self.version) {
            (Some(v), Some(current)) => v > current,
            _ => true,
        };

        match ack.attributes {
            Some(attributes) if newer => {
                self.confirmed.extend(attributes);
                if ack.version.is_some() {
                    self.version = ack.version;
                }
            }
            Some(_) => {}
            None => {
                if let Some(changes) = &overlay {
                    self.confirmed
                        .extend(changes.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                if newer && ack.version.is_some() {
                    self.version = ack.version;
                }
            }
        }

        self.touch();
        overlay.is_some()
    }

    /// Drop the overlay of command `id`, exposing the confirmed values again.
    pub fn revert(&mut self, id: CorrelationId) -> bool {
        let removed = self.take_overlay(id).is_some();
        if removed {
            self.touch();
        }
        removed
    }

    pub fn current_state(&self) -> Arc<DeviceSnapshot> {
        Arc::clone(&self.snapshot)
    }

    fn take_overlay(&mut self, id: CorrelationId) -> Option<AttributeChanges> {
        let index = self.overlays.iter().position(|(o, _)| *o == id)?;
        Some(self.overlays.remove(index).1)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();

        let mut attributes = self.confirmed.clone();
        let mut pending = BTreeSet::new();
        for (_, changes) in &self.overlays {
            for (name, value) in changes {
                attributes.insert(name.clone(), value.clone());
                pending.insert(name.clone());
            }
        }

        self.snapshot = Arc::new(DeviceSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            name: self.name.clone(),
            version: self.version.unwrap_or(0),
            attributes,
            pending,
            updated_at: self.updated_at,
        });
    }
}
