//! Event bridge between the volume store and the work queue
//!
//! Translates store change notifications into queued resource keys. Updates
//! that change nothing the reconciler acts on (same spec, same phase, same
//! deletion marker) are filtered to avoid churn; capacity, device-path and
//! deletion-timestamp changes always pass through. This component never
//! touches a disk.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::controller::queue::WorkQueue;
use crate::crd::StorageVolume;
use crate::store::VolumeEvent;

pub struct EventBridge {
    queue: Arc<WorkQueue>,
}

impl EventBridge {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }

    /// Consume store events until the channel closes.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<VolumeEvent>) {
        while let Some(event) = events.recv().await {
            let key = event.key();
            match event {
                VolumeEvent::Added(_) | VolumeEvent::Deleted(_) => {
                    debug!(key, "Enqueueing volume");
                    self.queue.add(&key);
                }
                VolumeEvent::Modified { old, new } => {
                    if significant_update(&old, &new) {
                        debug!(key, "Enqueueing updated volume");
                        self.queue.add(&key);
                    } else {
                        trace!(key, "Ignoring no-op update");
                    }
                }
            }
        }
        debug!("Event channel closed, bridge exiting");
    }
}

/// Whether an update can change the reconciler's decision for this object.
fn significant_update(old: &StorageVolume, new: &StorageVolume) -> bool {
    old.spec.capacity != new.spec.capacity
        || old.spec.device_path != new.spec.device_path
        || old.spec.own_node_id != new.spec.own_node_id
        || old.phase() != new.phase()
        || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
}
