//! Deduplicating, rate-limited work queue
//!
//! The concurrency backbone of the controller. Keys wait in a FIFO queue with
//! the classic dirty/processing set semantics: duplicate adds collapse while a
//! key is queued or in-flight, and a key re-added during processing is
//! redelivered exactly once after [`WorkQueue::done`]. Retry backoff is owned
//! entirely by the queue, keyed by resource identity, so the reconciler stays
//! stateless between passes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

// =============================================================================
// Rate Limiter
// =============================================================================

/// Per-key exponential backoff configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Delay applied on the first failure
    pub base_delay: Duration,
    /// Ceiling for the computed delay
    pub max_delay: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        // Matches the default item exponential failure rate limiter used by
        // upstream controller workqueues.
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

/// Delay before the next redelivery after `failures` consecutive failures.
///
/// Grows as base * 2^failures, saturating at the configured ceiling.
pub fn next_delay(failures: u32, config: &RateLimiterConfig) -> Duration {
    let factor = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
    let nanos = (config.base_delay.as_nanos() as u64).saturating_mul(factor);
    Duration::from_nanos(nanos).min(config.max_delay)
}

// =============================================================================
// Work Queue
// =============================================================================

struct Inner {
    queue: VecDeque<String>,
    /// Keys awaiting processing (queued, or re-added while in-flight)
    dirty: HashSet<String>,
    /// Keys currently held by a worker lane
    processing: HashSet<String>,
    /// Consecutive failure count per key
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// Deduplicating, retry-aware queue of resource keys.
///
/// One semaphore permit exists per queued key; closing the semaphore is the
/// shutdown signal that wakes every blocked [`get`](WorkQueue::get).
pub struct WorkQueue {
    inner: Mutex<Inner>,
    items: Semaphore,
    limiter: RateLimiterConfig,
}

impl WorkQueue {
    pub fn new(limiter: RateLimiterConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            items: Semaphore::new(0),
            limiter,
        })
    }

    /// Idempotent enqueue. A key already queued or marked dirty is collapsed
    /// into the pending delivery; a key in-flight is remembered and
    /// redelivered once its current pass calls [`done`](WorkQueue::done).
    pub fn add(&self, key: &str) {
        {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            if !inner.dirty.insert(key.to_string()) {
                trace!(key, "Coalesced duplicate add");
                return;
            }
            if inner.processing.contains(key) {
                trace!(key, "Key in-flight, deferring redelivery");
                return;
            }
            inner.queue.push_back(key.to_string());
        }
        self.items.add_permits(1);
    }

    /// Block until a key is available, or return `None` once the queue is
    /// shutting down and fully drained. Keys already queued at shutdown are
    /// still delivered.
    pub async fn get(&self) -> Option<String> {
        loop {
            match self.items.acquire().await {
                Ok(permit) => permit.forget(),
                // Closed semaphore is the shutdown signal; hand out whatever
                // was queued before it fired.
                Err(_) => return self.pop(),
            }
            if let Some(key) = self.pop() {
                return Some(key);
            }
            // A permit without a queued key cannot normally happen; loop and
            // wait for the next one rather than panicking a worker lane.
        }
    }

    fn pop(&self) -> Option<String> {
        let mut inner = self.inner.lock();
        let key = inner.queue.pop_front()?;
        inner.dirty.remove(&key);
        inner.processing.insert(key.clone());
        Some(key)
    }

    /// Mark the current pass for `key` complete. If the key was re-added
    /// while in-flight it goes straight back onto the queue.
    pub fn done(&self, key: &str) {
        let redeliver = {
            let mut inner = self.inner.lock();
            inner.processing.remove(key);
            if inner.dirty.contains(key) && !inner.shutting_down {
                inner.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if redeliver {
            debug!(key, "Redelivering key re-added during processing");
            self.items.add_permits(1);
        }
    }

    /// Re-enqueue `key` after an exponentially growing, capped delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            let failures = inner.failures.entry(key.to_string()).or_insert(0);
            let delay = next_delay(*failures, &self.limiter);
            *failures += 1;
            delay
        };

        debug!(key, ?delay, "Scheduling rate-limited redelivery");
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Reset the failure counter for `key` after a fully successful pass.
    pub fn forget(&self, key: &str) {
        self.inner.lock().failures.remove(key);
    }

    /// Stop accepting new items and wake every blocked `get`. Keys already
    /// queued keep flowing until the queue is empty; in-flight passes are
    /// finished, not abandoned.
    pub fn shut_down(&self) {
        self.inner.lock().shutting_down = true;
        self.items.close();
    }

    /// Number of keys waiting to be dequeued
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consecutive failure count currently tracked for `key`
    pub fn retries(&self, key: &str) -> u32 {
        self.inner.lock().failures.get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let queue = WorkQueue::new(RateLimiterConfig::default());
        queue.add("scp/v1");
        queue.add("scp/v1");
        queue.add("scp/v1");
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.get().await.as_deref(), Some("scp/v1"));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_readd_while_in_flight_redelivers_once() {
        let queue = WorkQueue::new(RateLimiterConfig::default());
        queue.add("scp/v1");
        let key = queue.get().await.unwrap();

        // Two adds while in-flight coalesce into one pending redelivery
        queue.add(&key);
        queue.add(&key);
        assert_eq!(queue.len(), 0);

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("scp/v1"));
        queue.done(&key);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_get() {
        let queue = WorkQueue::new(RateLimiterConfig::default());

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        // Adds after shutdown are ignored
        queue.add("scp/v1");
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_delivers_already_queued_keys() {
        let queue = WorkQueue::new(RateLimiterConfig::default());
        queue.add("scp/v1");
        queue.add("scp/v2");
        queue.shut_down();

        // Keys queued before shutdown still come out, in order
        assert_eq!(queue.get().await.as_deref(), Some("scp/v1"));
        assert_eq!(queue.get().await.as_deref(), Some("scp/v2"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_redelivery() {
        let queue = WorkQueue::new(RateLimiterConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        });

        queue.add("scp/v1");
        let key = queue.get().await.unwrap();
        queue.add_rate_limited(&key);
        queue.done(&key);
        assert_eq!(queue.retries(&key), 1);

        // The paused clock advances while awaiting, firing the delayed add
        assert_eq!(queue.get().await.as_deref(), Some("scp/v1"));

        queue.forget(&key);
        assert_eq!(queue.retries(&key), 0);
    }

    #[test]
    fn test_next_delay_monotone_and_capped() {
        let config = RateLimiterConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        };

        let mut last = Duration::ZERO;
        for failures in 0..80 {
            let delay = next_delay(failures, &config);
            assert!(delay >= last, "delay must be non-decreasing");
            assert!(delay <= config.max_delay, "delay must be capped");
            last = delay;
        }
        assert_eq!(next_delay(0, &config), Duration::from_millis(5));
        assert_eq!(next_delay(1, &config), Duration::from_millis(10));
        assert_eq!(next_delay(40, &config), config.max_delay);
    }
}
