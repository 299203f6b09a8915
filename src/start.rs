//! Process entry point wiring
//!
//! Builds the Kubernetes client (in-cluster first, explicit kubeconfig-file
//! fallback), registers the CRD once per process, starts the volume watch and
//! blocks running the controller until shutdown or a fatal setup error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::config::{Kubeconfig, KubeConfigOptions};
use kube::runtime::events::Reporter;
use kube::{Api, Client, Config, CustomResourceExt};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controller::{
    Controller, EventBridge, KubeVolumeApi, RateLimiterConfig, VolumeReconciler, WorkQueue,
    WORKER_COUNT,
};
use crate::controller::reconciler::Reconcile;
use crate::crd::StorageVolume;
use crate::error::{Error, Result};
use crate::partition::{PartedTool, Partitioner};
use crate::store::{VolumeStore, WatchStore};

/// Settings consumed by [`start`]
#[derive(Debug, Clone)]
pub struct Settings {
    /// Node this controller instance provisions for
    pub node_id: String,
    /// Kubeconfig file used when in-cluster discovery fails
    pub kubeconfig: Option<PathBuf>,
    /// Path to the parted binary
    pub parted_path: PathBuf,
}

/// CRD registration is a startup-time side effect shared by every controller
/// in the process; it must run exactly once.
static CRD_REGISTRATION: OnceCell<()> = OnceCell::const_new();

/// Build clients, start the background sync and run the controller until
/// `shutdown` fires. Setup errors are fatal and returned without retry.
pub async fn start(settings: Settings, shutdown: CancellationToken) -> Result<()> {
    let config = cluster_config(settings.kubeconfig.as_deref()).await?;
    let client = Client::try_from(config)?;

    CRD_REGISTRATION
        .get_or_try_init(|| ensure_crd(client.clone()))
        .await?;

    let (store, events) = WatchStore::new();
    let volumes: Api<StorageVolume> = Api::all(client.clone());
    tokio::spawn(Arc::clone(&store).run(volumes));

    info!("Waiting for initial volume list");
    if !wait_for_initial_sync(&store, &shutdown).await {
        info!("Shutdown requested before the initial list completed");
        return Ok(());
    }

    let queue = WorkQueue::new(RateLimiterConfig::default());
    let bridge = EventBridge::new(Arc::clone(&queue));
    tokio::spawn(bridge.run(events));

    let reporter = Reporter {
        controller: "storage-volume-operator".into(),
        instance: Some(settings.node_id.clone()),
    };
    let volume_api = Arc::new(KubeVolumeApi::new(client, reporter));
    let partitioner: Arc<dyn Partitioner> = Arc::new(PartedTool::new(settings.parted_path));
    let reconciler = Arc::new(VolumeReconciler::new(
        settings.node_id,
        store as Arc<dyn VolumeStore>,
        partitioner,
        volume_api,
    ));

    let controller = Controller::new(queue, reconciler as Arc<dyn Reconcile>, WORKER_COUNT);
    controller.run(shutdown).await;
    Ok(())
}

/// Wait for the cache to finish its initial list, bailing out early when the
/// shutdown signal fires first. The watch retries transport errors forever,
/// so this wait is the only place a stuck sync can be interrupted.
async fn wait_for_initial_sync(store: &WatchStore, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = store.wait_until_ready() => true,
        _ = shutdown.cancelled() => false,
    }
}

/// In-cluster config, falling back to an explicit kubeconfig file.
async fn cluster_config(kubeconfig: Option<&Path>) -> Result<Config> {
    match Config::incluster() {
        Ok(config) => Ok(config),
        Err(e) => {
            warn!(error = %e, "Not running in-cluster, trying kubeconfig fallback");
            let path = kubeconfig.ok_or_else(|| {
                Error::Configuration(
                    "not running in-cluster and no kubeconfig file provided".into(),
                )
            })?;
            let kubeconfig = Kubeconfig::read_from(path)?;
            let config =
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
            Ok(config)
        }
    }
}

/// Server-side apply of the StorageVolume CRD.
async fn ensure_crd(client: Client) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let crd = StorageVolume::crd();
    let name = "storagevolumes.scp.storage.io";

    let params = PatchParams::apply("storage-volume-operator").force();
    crds.patch(name, &params, &Patch::Apply(&crd)).await?;
    info!("StorageVolume CRD registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_interrupts_initial_sync_wait() {
        // The watch never delivers a list; only the signal can end the wait
        let (store, _events) = WatchStore::new();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert!(!wait_for_initial_sync(&store, &shutdown).await);
    }

    #[tokio::test]
    async fn test_initial_sync_wait_ends_when_list_arrives() {
        let (store, _events) = WatchStore::new();
        let shutdown = CancellationToken::new();
        store.mark_ready();

        assert!(wait_for_initial_sync(&store, &shutdown).await);
    }
}
