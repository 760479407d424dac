//! Queue consumer and retry engine.
//!
//! Each worker block-pops work items and marks the referenced transaction
//! processed. Per item:
//!
//! ```text
//! Queued -> Processing -> Done
//!                      -> Requeued(retry + 1)   after sleeping base * 2^retry
//!                      -> Dropped               once retry has reached the ceiling
//! ```
//!
//! Items that do not parse, or whose retry counter is already past the
//! ceiling, are discarded immediately and never requeued.
//! The backoff sleep happens inside the worker that popped the item, so an
//! item in backoff is held by exactly one worker and never retried
//! concurrently. A requeued item goes to the tail of the queue.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{Config, DEFAULT_BACKOFF_BASE, DEFAULT_RETRY_CEILING};
use crate::metrics::Metrics;
use crate::queue::{enqueue, WorkQueue};
use crate::store::TransactionStore;
use crate::types::{WorkItem, TX_KIND};

/// Pause after a failed pop before trying the queue again.
const POP_ERROR_DELAY: Duration = Duration::from_secs(1);

/// Retry ceiling and exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed before an item is dropped.
    pub ceiling: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_RETRY_CEILING,
            base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ceiling: config.retry_ceiling,
            base: config.backoff_base,
        }
    }

    /// Delay before requeueing an item that failed with `retry_count` retries
    /// so far: `base * 2^retry_count`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }
}

/// Result of handling one raw queue payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; the item is finished.
    Done { hash: String },
    /// Failed and pushed back with an incremented retry counter.
    Requeued { hash: String, retry_count: u32, delay: Duration },
    /// Failed on its last allowed attempt and discarded.
    Dropped { hash: String, attempts: u32 },
    /// Unparseable, of an unknown kind or out of range; discarded without retry.
    Malformed,
}

impl Outcome {
    /// Metric label of this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Done { .. } => "processed",
            Self::Requeued { .. } => "requeued",
            Self::Dropped { .. } => "dropped",
            Self::Malformed => "malformed",
        }
    }
}

/// A single queue consumer.
#[derive(Clone)]
pub struct Worker {
    id: usize,
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn TransactionStore>,
    policy: RetryPolicy,
    metrics: Option<Metrics>,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn TransactionStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            id,
            queue,
            store,
            policy,
            metrics: None,
        }
    }

    /// Counts every handled item in `metrics` by outcome.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Consumes the queue until the task is aborted.
    pub async fn run(self) {
        info!(worker = self.id, ceiling = self.policy.ceiling, "Queue worker started");
        loop {
            match self.queue.pop().await {
                Ok(raw) => {
                    self.handle(&raw).await;
                }
                Err(err) => {
                    warn!(worker = self.id, error = %err, "Queue pop failed");
                    tokio::time::sleep(POP_ERROR_DELAY).await;
                }
            }
        }
    }

    /// Spawns [`Worker::run`] on the runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Processes one raw payload, sleeping and requeueing on failure.
    pub async fn handle(&self, raw: &str) -> Outcome {
        let outcome = self.process(raw).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_worker_outcome(outcome.label());
        }
        outcome
    }

    async fn process(&self, raw: &str) -> Outcome {
        let item: WorkItem = match serde_json::from_str(raw) {
            Ok(item) => item,
            Err(err) => {
                warn!(worker = self.id, error = %err, "Discarding malformed queue item");
                return Outcome::Malformed;
            }
        };

        if item.kind != TX_KIND || item.correlation_id.is_empty() {
            warn!(worker = self.id, kind = %item.kind, "Discarding queue item of unknown kind");
            return Outcome::Malformed;
        }

        if item.retry_count > self.policy.ceiling {
            warn!(
                worker = self.id,
                hash = %item.correlation_id,
                retry = item.retry_count,
                ceiling = self.policy.ceiling,
                "Discarding queue item with out-of-range retry count"
            );
            return Outcome::Malformed;
        }

        let hash = item.correlation_id.clone();
        let attempts = item.retry_count.saturating_add(1);
        debug!(worker = self.id, hash = %hash, retry = item.retry_count, "Processing transaction");

        let err = match self.store.mark_processed(&hash, attempts).await {
            Ok(()) => {
                info!(worker = self.id, hash = %hash, attempts, "Transaction processed");
                return Outcome::Done { hash };
            }
            Err(err) => err,
        };

        if item.retry_count >= self.policy.ceiling {
            error!(
                worker = self.id,
                hash = %hash,
                attempts,
                error = %err,
                "Dropping transaction after max retries"
            );
            self.record_drop(&hash, attempts).await;
            return Outcome::Dropped { hash, attempts };
        }

        let delay = self.policy.delay_for(item.retry_count);
        let next = item.retried();
        warn!(
            worker = self.id,
            hash = %hash,
            retry = next.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Processing failed, retrying after backoff"
        );
        tokio::time::sleep(delay).await;

        match enqueue(self.queue.as_ref(), &next).await {
            Ok(()) => Outcome::Requeued {
                hash,
                retry_count: next.retry_count,
                delay,
            },
            Err(queue_err) => {
                error!(
                    worker = self.id,
                    hash = %hash,
                    attempts,
                    error = %queue_err,
                    "Failed to requeue transaction, dropping"
                );
                self.record_drop(&hash, attempts).await;
                Outcome::Dropped { hash, attempts }
            }
        }
    }

    async fn record_drop(&self, hash: &str, attempts: u32) {
        if let Err(err) = self.store.mark_dropped(hash, attempts).await {
            warn!(worker = self.id, hash = %hash, error = %err, "Could not record dropped transaction");
        }
    }
}
