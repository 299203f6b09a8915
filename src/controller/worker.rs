//! Worker pool
//!
//! A fixed set of symmetric, stateless processing lanes that pull keys from
//! the work queue and invoke the reconciler. Lanes run each pass to
//! completion before fetching the next key, and exit when the queue signals
//! shutdown. An in-progress partition operation is always finished, never
//! abandoned; partial disk operations are not safely cancelable.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::queue::WorkQueue;
use crate::controller::reconciler::{Outcome, Reconcile};
use crate::metrics;

/// Number of worker lanes in this deployment.
///
/// Fixed at 1: the partitioning tool is unsafe under concurrent invocation
/// and can leak partitions when two lanes race on the same disk, so
/// serializing every disk-affecting operation through a single lane is the
/// mutual-exclusion mechanism.
pub const WORKER_COUNT: usize = 1;

pub struct Controller {
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconcile>,
    workers: usize,
}

impl Controller {
    pub fn new(queue: Arc<WorkQueue>, reconciler: Arc<dyn Reconcile>, workers: usize) -> Self {
        Self {
            queue,
            reconciler,
            workers,
        }
    }

    /// Run the lanes until `shutdown` fires and the queue drains its
    /// in-flight work.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(workers = self.workers, "Starting worker lanes");

        let mut lanes = JoinSet::new();
        for lane in 0..self.workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            lanes.spawn(async move {
                worker_loop(lane, queue, reconciler).await;
            });
        }

        // Relay the shutdown signal into the queue; blocked lanes wake and
        // exit after finishing their current pass.
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            shutdown.cancelled().await;
            info!("Shutdown signal received, closing work queue");
            queue.shut_down();
        });

        while lanes.join_next().await.is_some() {}
        info!("All worker lanes exited");
    }
}

async fn worker_loop(lane: usize, queue: Arc<WorkQueue>, reconciler: Arc<dyn Reconcile>) {
    debug!(lane, "Worker lane started");

    while let Some(key) = queue.get().await {
        let timer = metrics::RECONCILE_DURATION.start_timer();
        metrics::RECONCILIATIONS.inc();

        let outcome = reconciler.reconcile(&key).await;
        timer.observe_duration();

        match outcome {
            Outcome::Succeeded => {
                queue.forget(&key);
            }
            Outcome::Retryable(e) => {
                metrics::RECONCILE_ERRORS.with_label_values(&["retryable"]).inc();
                warn!(lane, key, error = %e, retries = queue.retries(&key),
                    "Reconcile failed, requeueing with backoff");
                queue.add_rate_limited(&key);
            }
            Outcome::Terminal(e) => {
                metrics::RECONCILE_ERRORS.with_label_values(&["terminal"]).inc();
                error!(lane, key, error = %e,
                    "Reconcile failed terminally, waiting for object change");
                queue.forget(&key);
            }
        }

        queue.done(&key);
    }

    debug!(lane, "Worker lane exiting");
}
