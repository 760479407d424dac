//! Transaction intake.
//!
//! Once the ledger has accepted a submission and assigned it an identifier,
//! intake records a pending transaction and queues a work item for it. The
//! ledger is authoritative for acceptance, so these two writes are an outbox:
//! their failures are logged and reported in [`IntakeOutcome`], never
//! returned to the caller as an error.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::queue::{enqueue, WorkQueue};
use crate::store::TransactionStore;
use crate::types::WorkItem;

/// What intake managed to do for one accepted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakeOutcome {
    /// A new pending record was inserted.
    pub recorded: bool,
    /// The record already existed and was left untouched.
    pub duplicate: bool,
    /// A work item was pushed onto the queue.
    pub enqueued: bool,
}

impl IntakeOutcome {
    /// True when any durability step failed.
    pub fn is_degraded(&self) -> bool {
        !self.enqueued || !(self.recorded || self.duplicate)
    }
}

/// Records accepted transactions and queues them for processing.
#[derive(Clone)]
pub struct Intake {
    store: Arc<dyn TransactionStore>,
    queue: Arc<dyn WorkQueue>,
}

impl Intake {
    pub fn new(store: Arc<dyn TransactionStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { store, queue }
    }

    /// Inserts a pending record for `id` and enqueues `{kind: "tx", hash: id, retry: 0}`.
    ///
    /// The item is queued whatever the insert reports. A duplicate leaves
    /// the existing record alone but is queued again, so a resubmission
    /// recovers a transaction whose first enqueue was lost; processing
    /// upserts the record, so a second item is harmless.
    pub async fn record_accepted(&self, id: &str) -> IntakeOutcome {
        let mut outcome = IntakeOutcome {
            recorded: false,
            duplicate: false,
            enqueued: false,
        };

        match self.store.insert_if_absent(id).await {
            Ok(true) => outcome.recorded = true,
            Ok(false) => {
                debug!(hash = %id, "Transaction already recorded, queueing again");
                outcome.duplicate = true;
            }
            Err(err) => {
                warn!(hash = %id, error = %err, "Failed to record accepted transaction");
            }
        }

        match enqueue(self.queue.as_ref(), &WorkItem::transaction(id)).await {
            Ok(()) => outcome.enqueued = true,
            Err(err) => {
                warn!(hash = %id, error = %err, "Failed to enqueue accepted transaction");
            }
        }

        if !outcome.is_degraded() {
            info!(hash = %id, "Transaction accepted and queued");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryQueue, QueueError};
    use crate::store::{MemoryStore, StoreError};
    use crate::types::{TransactionRecord, TransactionStatus};
    use async_trait::async_trait;

    struct DownStore;

    #[async_trait]
    impl TransactionStore for DownStore {
        async fn insert_if_absent(&self, _hash: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn mark_processed(&self, _hash: &str, _attempts: u32) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn mark_dropped(&self, _hash: &str, _attempts: u32) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn get(&self, _hash: &str) -> Result<Option<TransactionRecord>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    struct DownQueue;

    #[async_trait]
    impl WorkQueue for DownQueue {
        async fn push(&self, _payload: String) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("down".into()))
        }
        async fn pop(&self) -> Result<String, QueueError> {
            Err(QueueError::Unavailable("down".into()))
        }
        async fn len(&self) -> Result<usize, QueueError> {
            Err(QueueError::Unavailable("down".into()))
        }
        async fn ping(&self) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn records_and_queues_new_transaction() {
        let store = MemoryStore::new();
        let queue = MemoryQueue::new();
        let intake = Intake::new(Arc::new(store.clone()), Arc::new(queue.clone()));

        let outcome = intake.record_accepted("0xabc").await;
        assert!(outcome.recorded && outcome.enqueued);
        assert!(!outcome.is_degraded());

        let record = store.get("0xabc").await.unwrap().unwrap();
        assert_eq!(record.status, TransactionStatus::Pending);

        let raw = queue.pop().await.unwrap();
        let item: WorkItem = serde_json::from_str(&raw).unwrap();
        assert_eq!(item, WorkItem::transaction("0xabc"));
    }

    #[tokio::test]
    async fn duplicate_identifier_keeps_one_record_and_queues_again() {
        let store = MemoryStore::new();
        let queue = MemoryQueue::new();
        let intake = Intake::new(Arc::new(store.clone()), Arc::new(queue.clone()));

        intake.record_accepted("dup").await;
        let second = intake.record_accepted("dup").await;

        assert!(second.duplicate && second.enqueued);
        assert!(!second.is_degraded());
        assert_eq!(store.transaction_count().await, 1);
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn resubmission_recovers_lost_enqueue() {
        let store = MemoryStore::new();
        let queue = MemoryQueue::new();

        let first = Intake::new(Arc::new(store.clone()), Arc::new(DownQueue))
            .record_accepted("0xabc")
            .await;
        assert!(first.recorded && !first.enqueued);

        let second = Intake::new(Arc::new(store.clone()), Arc::new(queue.clone()))
            .record_accepted("0xabc")
            .await;
        assert!(second.duplicate && second.enqueued);

        let item: WorkItem = serde_json::from_str(&queue.pop().await.unwrap()).unwrap();
        assert_eq!(item, WorkItem::transaction("0xabc"));
        assert_eq!(store.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn store_failure_still_queues() {
        let queue = MemoryQueue::new();
        let intake = Intake::new(Arc::new(DownStore), Arc::new(queue.clone()));

        let outcome = intake.record_accepted("h").await;
        assert!(!outcome.recorded);
        assert!(outcome.enqueued);
        assert!(outcome.is_degraded());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn queue_failure_is_reported_not_raised() {
        let store = MemoryStore::new();
        let intake = Intake::new(Arc::new(store.clone()), Arc::new(DownQueue));

        let outcome = intake.record_accepted("h").await;
        assert!(outcome.recorded);
        assert!(!outcome.enqueued);
        assert!(outcome.is_degraded());
    }
}
