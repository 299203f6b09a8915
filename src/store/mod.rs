//! Resource Cache for StorageVolume objects
//!
//! A continuously-updated, keyed snapshot of all StorageVolume objects known
//! to the cluster, populated by list+watch. The reconciler only depends on
//! the [`VolumeStore`] trait, which keeps it decoupled from the watch
//! transport; change notifications flow to the event bridge as
//! [`VolumeEvent`]s on a channel.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Api;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::crd::StorageVolume;

// =============================================================================
// Events
// =============================================================================

/// A change notification for a single StorageVolume
#[derive(Debug, Clone)]
pub enum VolumeEvent {
    Added(Arc<StorageVolume>),
    Modified {
        old: Arc<StorageVolume>,
        new: Arc<StorageVolume>,
    },
    Deleted(Arc<StorageVolume>),
}

impl VolumeEvent {
    /// Resource key of the object this event refers to
    pub fn key(&self) -> String {
        match self {
            VolumeEvent::Added(v) => v.key(),
            VolumeEvent::Modified { new, .. } => new.key(),
            VolumeEvent::Deleted(v) => v.key(),
        }
    }
}

// =============================================================================
// VolumeStore Trait
// =============================================================================

/// Synchronous lookup interface over the volume cache.
///
/// Reads are treated as already-synchronized and conflict-free; the store is
/// eventually consistent with the cluster state.
pub trait VolumeStore: Send + Sync {
    /// Look up a volume by "namespace/name" key
    fn get(&self, key: &str) -> Option<Arc<StorageVolume>>;

    /// Snapshot of all known volumes
    fn list(&self) -> Vec<Arc<StorageVolume>>;
}

// =============================================================================
// Shared State
// =============================================================================

/// Keyed map plus the outbound event channel, shared by the watch-backed and
/// in-memory stores.
struct StoreState {
    volumes: RwLock<HashMap<String, Arc<StorageVolume>>>,
    events: mpsc::UnboundedSender<VolumeEvent>,
}

impl StoreState {
    fn new(events: mpsc::UnboundedSender<VolumeEvent>) -> Self {
        Self {
            volumes: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn apply(&self, obj: StorageVolume) {
        let obj = Arc::new(obj);
        let key = obj.key();
        let old = self.volumes.write().insert(key, obj.clone());
        let event = match old {
            None => VolumeEvent::Added(obj),
            Some(old) => VolumeEvent::Modified { old, new: obj },
        };
        let _ = self.events.send(event);
    }

    fn remove(&self, obj: StorageVolume) {
        let key = obj.key();
        let removed = self.volumes.write().remove(&key);
        // Prefer the cached copy; the final watch event may be stale.
        let gone = removed.unwrap_or_else(|| Arc::new(obj));
        let _ = self.events.send(VolumeEvent::Deleted(gone));
    }

    /// Replace the whole map after a relist, synthesizing the diff as events
    /// so no add/update/delete is lost across a watch restart.
    fn replace(&self, objs: Vec<StorageVolume>) {
        let mut fresh: HashMap<String, Arc<StorageVolume>> = HashMap::with_capacity(objs.len());
        for obj in objs {
            let obj = Arc::new(obj);
            fresh.insert(obj.key(), obj);
        }

        let old = {
            let mut guard = self.volumes.write();
            std::mem::replace(&mut *guard, fresh.clone())
        };

        for (key, new) in &fresh {
            match old.get(key) {
                None => {
                    let _ = self.events.send(VolumeEvent::Added(new.clone()));
                }
                Some(prev) if prev.metadata.resource_version != new.metadata.resource_version => {
                    let _ = self.events.send(VolumeEvent::Modified {
                        old: prev.clone(),
                        new: new.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        for (key, prev) in old {
            if !fresh.contains_key(&key) {
                let _ = self.events.send(VolumeEvent::Deleted(prev));
            }
        }
    }

    fn get(&self, key: &str) -> Option<Arc<StorageVolume>> {
        self.volumes.read().get(key).cloned()
    }

    fn list(&self) -> Vec<Arc<StorageVolume>> {
        self.volumes.read().values().cloned().collect()
    }
}

// =============================================================================
// WatchStore
// =============================================================================

/// Volume cache fed by a Kubernetes list+watch stream.
pub struct WatchStore {
    state: StoreState,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl WatchStore {
    /// Create the store and the receiving end of its event channel.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<VolumeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        (
            Arc::new(Self {
                state: StoreState::new(tx),
                ready_tx,
                ready_rx,
            }),
            rx,
        )
    }

    /// Drive the watch stream until it terminates.
    ///
    /// Watch errors are logged and retried with the default backoff; they do
    /// not tear the store down.
    pub async fn run(self: Arc<Self>, api: Api<StorageVolume>) {
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        tokio::pin!(stream);

        info!("Starting StorageVolume watch");
        while let Some(result) = stream.next().await {
            match result {
                Ok(Event::Applied(obj)) => self.state.apply(obj),
                Ok(Event::Deleted(obj)) => self.state.remove(obj),
                Ok(Event::Restarted(objs)) => {
                    debug!(count = objs.len(), "Volume watch (re)listed");
                    self.state.replace(objs);
                    self.mark_ready();
                }
                Err(e) => warn!(error = %e, "Volume watch error, will retry"),
            }
        }
        info!("StorageVolume watch stream ended");
    }

    pub(crate) fn mark_ready(&self) {
        let _ = self.ready_tx.send(true);
    }

    /// Block until the initial list has populated the cache.
    pub async fn wait_until_ready(&self) {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl VolumeStore for WatchStore {
    fn get(&self, key: &str) -> Option<Arc<StorageVolume>> {
        self.state.get(key)
    }

    fn list(&self) -> Vec<Arc<StorageVolume>> {
        self.state.list()
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-memory store with the same event semantics as [`WatchStore`], used by
/// tests and local development.
pub struct MemoryStore {
    state: StoreState,
}

impl MemoryStore {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<VolumeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                state: StoreState::new(tx),
            }),
            rx,
        )
    }

    /// Insert or update a volume, emitting Added/Modified
    pub fn apply(&self, obj: StorageVolume) {
        self.state.apply(obj);
    }

    /// Remove a volume, emitting Deleted
    pub fn delete(&self, obj: StorageVolume) {
        self.state.remove(obj);
    }
}

impl VolumeStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Arc<StorageVolume>> {
        self.state.get(key)
    }

    fn list(&self) -> Vec<Arc<StorageVolume>> {
        self.state.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::StorageVolumeSpec;
    use kube::core::ObjectMeta;

    fn volume(name: &str, rv: &str) -> StorageVolume {
        StorageVolume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("scp".to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            spec: StorageVolumeSpec {
                own_node_id: "node-1".into(),
                capacity: "1Gi".into(),
                device_path: "/dev/sdb".into(),
            },
            status: None,
        }
    }

    #[test]
    fn test_apply_emits_added_then_modified() {
        let (store, mut rx) = MemoryStore::new();

        store.apply(volume("v1", "1"));
        assert!(matches!(rx.try_recv().unwrap(), VolumeEvent::Added(_)));

        store.apply(volume("v1", "2"));
        assert!(matches!(
            rx.try_recv().unwrap(),
            VolumeEvent::Modified { .. }
        ));

        assert!(store.get("scp/v1").is_some());
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_delete_emits_deleted_and_clears() {
        let (store, mut rx) = MemoryStore::new();
        store.apply(volume("v1", "1"));
        let _ = rx.try_recv();

        store.delete(volume("v1", "1"));
        assert!(matches!(rx.try_recv().unwrap(), VolumeEvent::Deleted(_)));
        assert!(store.get("scp/v1").is_none());
    }

    #[test]
    fn test_replace_synthesizes_diff() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = StoreState::new(tx);

        state.apply(volume("stay", "1"));
        state.apply(volume("gone", "1"));
        while rx.try_recv().is_ok() {}

        state.replace(vec![volume("stay", "2"), volume("new", "1")]);

        let mut added = 0;
        let mut modified = 0;
        let mut deleted = 0;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                VolumeEvent::Added(v) => {
                    assert_eq!(v.name(), "new");
                    added += 1;
                }
                VolumeEvent::Modified { new, .. } => {
                    assert_eq!(new.name(), "stay");
                    modified += 1;
                }
                VolumeEvent::Deleted(v) => {
                    assert_eq!(v.name(), "gone");
                    deleted += 1;
                }
            }
        }
        assert_eq!((added, modified, deleted), (1, 1, 1));
    }
}
