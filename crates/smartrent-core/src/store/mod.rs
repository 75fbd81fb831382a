// ── Published device state ──
//
// The session task is the only writer. Hosts read snapshots directly from
// here without going through the session, so reads never wait on it.

mod collection;

use std::sync::Arc;

use tokio::sync::broadcast;

use collection::EntityCollection;

use crate::model::{ChangeCause, DeviceChange, DeviceSnapshot, DeviceSummary};
use crate::stream::DeviceStream;

/// Snapshot store plus the change broadcast.
pub struct DeviceStore {
    devices: EntityCollection<DeviceSnapshot>,
    changes: broadcast::Sender<DeviceChange>,
}

impl DeviceStore {
    pub(crate) fn new(change_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_capacity);
        Self {
            devices: EntityCollection::new(),
            changes,
        }
    }

    /// Store `snapshot` and notify change subscribers.
    pub(crate) fn publish(&self, snapshot: Arc<DeviceSnapshot>, cause: ChangeCause) {
        let device_id = snapshot.id.clone();
        self.devices.upsert(device_id.clone(), Arc::clone(&snapshot));
        // No receivers is fine; the store itself still holds the state.
        let _ = self.changes.send(DeviceChange {
            device_id,
            snapshot,
            cause,
        });
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceSnapshot>> {
        self.devices.get(device_id)
    }

    /// All devices ordered by id.
    pub fn snapshot(&self) -> Arc<Vec<Arc<DeviceSnapshot>>> {
        self.devices.snapshot()
    }

    pub fn summaries(&self) -> Vec<DeviceSummary> {
        self.snapshot().iter().map(|d| d.summary()).collect()
    }

    pub fn changes(&self) -> broadcast::Receiver<DeviceChange> {
        self.changes.subscribe()
    }

    pub fn stream(&self) -> DeviceStream {
        DeviceStream::new(self.devices.subscribe())
    }

    /// Number of mutations applied so far.
    pub fn version(&self) -> u64 {
        self.devices.version()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::*;
    use crate::model::{AttributeValue, Attributes, DeviceKind};

    fn lock(id: &str, locked: bool) -> Arc<DeviceSnapshot> {
        Arc::new(DeviceSnapshot {
            id: id.into(),
            kind: DeviceKind::Lock,
            name: None,
            version: 1,
            attributes: Attributes::from([("locked".to_owned(), AttributeValue::Bool(locked))]),
            pending: BTreeSet::new(),
            updated_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn publish_stores_and_broadcasts() {
        let store = DeviceStore::new(8);
        let mut changes = store.changes();

        store.publish(lock("lock-1", true), ChangeCause::Event);

        let change = changes.recv().await.unwrap();
        assert_eq!(change.device_id, "lock-1");
        assert_eq!(change.cause, ChangeCause::Event);
        assert_eq!(store.get("lock-1").unwrap().locked(), Some(true));
    }

    #[test]
    fn summaries_follow_id_order() {
        let store = DeviceStore::new(8);
        store.publish(lock("b", true), ChangeCause::Resync);
        store.publish(lock("a", false), ChangeCause::Resync);

        let ids: Vec<_> = store.summaries().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(store.len(), 2);
    }
}
