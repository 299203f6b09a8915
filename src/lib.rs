//! StorageVolume Local-Disk Operator
//!
//! A Kubernetes operator that reconciles StorageVolume custom resources
//! against physical local-disk state on a node, driving an external
//! partitioning tool to create and remove partitions until actual state
//! converges to desired state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Resource Cache (store)                     │
//! │                list+watch → keyed snapshot + events              │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ VolumeEvent
//! ┌───────────────────────────────┴──────────────────────────────────┐
//! │  Event Bridge ──► Work Queue (dedup, backoff) ──► Worker Pool    │
//! │                                                    (1 lane)      │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ Reconcile(key)
//! ┌───────────────────────────────┴──────────────────────────────────┐
//! │   Reconciler ──► Volume Manager (parted) ──► local disk          │
//! │        └───────► status / events (Kubernetes API)                │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The worker pool is fixed at one lane: the partitioning tool is unsafe
//! under concurrent invocation, and serializing all disk-affecting work
//! through a single lane is the chosen mutual-exclusion mechanism.
//!
//! # Modules
//!
//! - [`controller`]: work queue, event bridge, worker pool and reconciler
//! - [`crd`]: the StorageVolume custom resource
//! - [`store`]: watch-backed resource cache
//! - [`partition`]: partition create/remove via the external tool
//! - [`start`]: process entry point wiring
//! - [`error`]: error types and retryable/terminal classification
//! - [`metrics`]: prometheus metrics and health endpoints

pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod start;
pub mod store;

// Re-export commonly used types
pub use controller::{
    Controller, EventBridge, Outcome, RateLimiterConfig, Reconcile, VolumeApi, VolumeReconciler,
    WorkQueue, WORKER_COUNT,
};
pub use crd::{StorageVolume, StorageVolumeSpec, StorageVolumeStatus, VolumePhase};
pub use error::{Error, Result};
pub use partition::{PartedTool, PartitionHandle, Partitioner};
pub use start::{start, Settings};
pub use store::{MemoryStore, VolumeEvent, VolumeStore, WatchStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
