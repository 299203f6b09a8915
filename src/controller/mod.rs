//! Reconciliation controller
//!
//! Event-driven loop that converges local disk state to the desired
//! StorageVolume set: store change events are bridged onto a deduplicating,
//! rate-limited work queue, and a fixed pool of worker lanes drains the
//! queue through the reconciler.

pub mod bridge;
pub mod queue;
pub mod reconciler;
pub mod worker;

pub use bridge::EventBridge;
pub use queue::{next_delay, RateLimiterConfig, WorkQueue};
pub use reconciler::{KubeVolumeApi, Outcome, Reconcile, VolumeApi, VolumeReconciler};
pub use worker::{Controller, WORKER_COUNT};
