//! Volume reconciler
//!
//! Given a resource key, fetches desired state from the volume store,
//! compares it to last-known actual state and drives the partitioner until
//! they converge. The reconciler holds no retry state between passes; the
//! work queue owns backoff. The only state kept here is the key-to-device
//! index needed to remove partitions for objects that no longer exist.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::crd::{StorageVolume, VolumePhase};
use crate::error::{Error, Result};
use crate::metrics;
use crate::partition::Partitioner;
use crate::store::VolumeStore;

// =============================================================================
// Outcome
// =============================================================================

/// Result of one reconcile pass. Produced and consumed within the pass; the
/// worker lane translates it into queue operations.
#[derive(Debug)]
pub enum Outcome {
    /// Actual state matches desired state (or nothing needed doing)
    Succeeded,
    /// Transient failure; redeliver the key with backoff
    Retryable(Error),
    /// Failure that cannot succeed until the object changes; no redelivery
    Terminal(Error),
}

/// Seam between the worker pool and reconciliation logic.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &str) -> Outcome;
}

// =============================================================================
// VolumeApi Port
// =============================================================================

/// Writes back to the cluster: status updates and operator-visible event
/// records. Optimistic-concurrency retry for status writes is the client
/// layer's responsibility, not ours.
#[async_trait]
pub trait VolumeApi: Send + Sync {
    async fn update_phase(
        &self,
        vol: &StorageVolume,
        phase: VolumePhase,
        message: Option<&str>,
    ) -> Result<()>;

    async fn publish_warning(&self, vol: &StorageVolume, reason: &str, note: &str) -> Result<()>;
}

/// VolumeApi backed by the typed Kubernetes client.
pub struct KubeVolumeApi {
    client: Client,
    reporter: Reporter,
}

impl KubeVolumeApi {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self { client, reporter }
    }
}

#[async_trait]
impl VolumeApi for KubeVolumeApi {
    async fn update_phase(
        &self,
        vol: &StorageVolume,
        phase: VolumePhase,
        message: Option<&str>,
    ) -> Result<()> {
        let namespace = vol.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<StorageVolume> = Api::namespaced(self.client.clone(), namespace);

        let patch = serde_json::json!({
            "status": {
                "phase": phase,
                "message": message,
                "lastTransitionTime": Utc::now(),
            }
        });
        api.patch_status(vol.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn publish_warning(&self, vol: &StorageVolume, reason: &str, note: &str) -> Result<()> {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            vol.object_ref(&()),
        );
        recorder
            .publish(KubeEvent {
                type_: EventType::Warning,
                reason: reason.to_string(),
                note: Some(note.to_string()),
                action: "Reconcile".to_string(),
                secondary: None,
            })
            .await?;
        Ok(())
    }
}

// =============================================================================
// VolumeReconciler
// =============================================================================

pub struct VolumeReconciler {
    /// Node this controller instance provisions for
    node_id: String,
    store: Arc<dyn VolumeStore>,
    partitioner: Arc<dyn Partitioner>,
    api: Arc<dyn VolumeApi>,
    /// Key-to-device index, retained so a deleted object's partition can
    /// still be removed after the object itself is gone.
    devices: Mutex<HashMap<String, String>>,
}

impl VolumeReconciler {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn VolumeStore>,
        partitioner: Arc<dyn Partitioner>,
        api: Arc<dyn VolumeApi>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            partitioner,
            api,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// The object is gone from the cluster: remove whatever we provisioned
    /// for it. Missing-on-disk is not an error.
    async fn handle_absent(&self, key: &str) -> Outcome {
        let device = match self.devices.lock().get(key).cloned() {
            Some(device) => device,
            None => {
                debug!(key, "Deleted volume has no recorded device, nothing to undo");
                return Outcome::Succeeded;
            }
        };

        match self.partitioner.delete_partition(&device).await {
            Ok(()) => {
                info!(key, device, "Removed partition for deleted volume");
                metrics::PARTITION_OPS.with_label_values(&["delete"]).inc();
                self.devices.lock().remove(key);
                Outcome::Succeeded
            }
            Err(e) => Outcome::Retryable(e),
        }
    }

    async fn handle_present(&self, key: &str, vol: &StorageVolume) -> Outcome {
        if vol.spec.own_node_id != self.node_id {
            debug!(key, node = %vol.spec.own_node_id, "Volume targets another node, skipping");
            return Outcome::Succeeded;
        }

        let size_bytes = match self.validate(key, vol) {
            Ok(size) => size,
            Err(e) => return self.fail_terminal(vol, e).await,
        };

        if vol.is_deleting() {
            return self.release(key, vol).await;
        }

        match vol.phase() {
            VolumePhase::Bound => {
                // Crash-safe: re-learn the mapping on redelivery
                self.record_device(key, &vol.spec.device_path);
                debug!(key, "Volume already provisioned, no-op");
                Outcome::Succeeded
            }
            VolumePhase::Released => Outcome::Succeeded,
            VolumePhase::Releasing => self.release(key, vol).await,
            _ => self.provision(key, vol, size_bytes).await,
        }
    }

    async fn provision(&self, key: &str, vol: &StorageVolume, size_bytes: u64) -> Outcome {
        let device = vol.spec.device_path.clone();
        // Record the mapping before touching the disk so a crash between
        // mkpart and status update still leaves the partition removable.
        self.record_device(key, &device);

        if vol.phase() != VolumePhase::Provisioning {
            if let Err(e) = self
                .api
                .update_phase(vol, VolumePhase::Provisioning, None)
                .await
            {
                return Outcome::Retryable(e);
            }
        }

        if let Err(e) = self.partitioner.create_partition(&device, size_bytes).await {
            return Outcome::Retryable(e);
        }
        metrics::PARTITION_OPS.with_label_values(&["create"]).inc();

        if let Err(e) = self.api.update_phase(vol, VolumePhase::Bound, None).await {
            // Partition exists; the redelivered pass hits the idempotent
            // create and only repeats the status write.
            return Outcome::Retryable(e);
        }

        info!(key, device, size_bytes, "Volume provisioned");
        Outcome::Succeeded
    }

    async fn release(&self, key: &str, vol: &StorageVolume) -> Outcome {
        let device = vol.spec.device_path.clone();

        if vol.phase() != VolumePhase::Releasing {
            if let Err(e) = self.api.update_phase(vol, VolumePhase::Releasing, None).await {
                return Outcome::Retryable(e);
            }
        }

        if let Err(e) = self.partitioner.delete_partition(&device).await {
            return Outcome::Retryable(e);
        }
        metrics::PARTITION_OPS.with_label_values(&["delete"]).inc();

        if let Err(e) = self.api.update_phase(vol, VolumePhase::Released, None).await {
            return Outcome::Retryable(e);
        }

        self.devices.lock().remove(key);
        info!(key, device, "Volume released");
        Outcome::Succeeded
    }

    /// Surface a terminal failure on the object, then halt redelivery.
    async fn fail_terminal(&self, vol: &StorageVolume, err: Error) -> Outcome {
        if vol.phase() == VolumePhase::Failed {
            // Already surfaced; stay quiet until the object changes
            return Outcome::Succeeded;
        }

        let message = err.to_string();
        if let Err(e) = self
            .api
            .update_phase(vol, VolumePhase::Failed, Some(&message))
            .await
        {
            return Outcome::Retryable(e);
        }
        if let Err(e) = self
            .api
            .publish_warning(vol, "ProvisioningFailed", &message)
            .await
        {
            warn!(error = %e, "Failed to publish warning event");
        }
        Outcome::Terminal(err)
    }

    fn validate(&self, key: &str, vol: &StorageVolume) -> Result<u64> {
        if !vol.spec.device_path.starts_with("/dev/") {
            return Err(Error::InvalidSpec {
                key: key.to_string(),
                reason: format!("device path {:?} is not under /dev", vol.spec.device_path),
            });
        }
        let size = vol.capacity_bytes().map_err(|e| Error::InvalidSpec {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        if size == 0 {
            return Err(Error::InvalidSpec {
                key: key.to_string(),
                reason: "capacity must be non-zero".into(),
            });
        }
        Ok(size)
    }

    fn record_device(&self, key: &str, device: &str) {
        self.devices
            .lock()
            .insert(key.to_string(), device.to_string());
    }
}

#[async_trait]
impl Reconcile for VolumeReconciler {
    async fn reconcile(&self, key: &str) -> Outcome {
        match self.store.get(key) {
            Some(vol) => self.handle_present(key, &vol).await,
            None => self.handle_absent(key).await,
        }
    }
}
