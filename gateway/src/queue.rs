//! Work queue shared by the transaction intake and the queue consumers.
//!
//! Items are JSON-encoded [`WorkItem`]s. Producers push to the head and
//! consumers block-pop from the tail, so the queue is FIFO in the absence of
//! retries. Two implementations are provided:
//!
//! - [`MemoryQueue`]: in-process deque with a `Notify` wakeup
//! - [`RedisQueue`]: `LPUSH` / `BRPOP` on the `tx_queue` list
//!
//! Neither polls: a consumer with nothing to do is parked until an item
//! arrives.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

use crate::types::WorkItem;

/// Redis list holding pending work items.
pub const QUEUE_KEY: &str = "tx_queue";

/// Seconds a single `BRPOP` blocks before it is reissued.
const BLOCK_TIMEOUT_SECS: u64 = 5;

/// Errors raised by a work queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode work item: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Blocking FIFO of raw work item payloads.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Appends a payload.
    async fn push(&self, payload: String) -> Result<(), QueueError>;

    /// Removes the oldest payload, waiting until one is available.
    async fn pop(&self) -> Result<String, QueueError>;

    /// Number of queued payloads.
    async fn len(&self) -> Result<usize, QueueError>;

    /// Checks the queue backend is reachable.
    async fn ping(&self) -> Result<(), QueueError>;
}

/// Serializes `item` and pushes it onto `queue`.
pub async fn enqueue(queue: &dyn WorkQueue, item: &WorkItem) -> Result<(), QueueError> {
    let payload = serde_json::to_string(item)?;
    queue.push(payload).await
}

/// In-process work queue.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    items: Arc<Mutex<VecDeque<String>>>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the queued payloads, oldest first.
    pub async fn snapshot(&self) -> Vec<String> {
        self.items.lock().await.iter().cloned().collect()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn push(&self, payload: String) -> Result<(), QueueError> {
        self.items.lock().await.push_back(payload);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self) -> Result<String, QueueError> {
        loop {
            if let Some(payload) = self.items.lock().await.pop_front() {
                return Ok(payload);
            }
            // A push between the check and this await leaves a permit behind.
            self.notify.notified().await;
        }
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.items.lock().await.len())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Redis list work queue.
///
/// Pushes go through the shared connection manager. Each consumer owns a
/// dedicated connection for `BRPOP` so a parked consumer never stalls other
/// commands; use [`RedisQueue::consumer`] to get one per worker.
#[derive(Clone)]
pub struct RedisQueue {
    client: redis::Client,
    conn: ConnectionManager,
    blocking: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl RedisQueue {
    pub fn new(client: redis::Client, conn: ConnectionManager) -> Self {
        Self {
            client,
            conn,
            blocking: Arc::new(Mutex::new(None)),
        }
    }

    /// A handle sharing the push connection but with its own pop connection.
    pub fn consumer(&self) -> Self {
        Self::new(self.client.clone(), self.conn.clone())
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn push(&self, payload: String) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(QUEUE_KEY, payload).await?;
        Ok(())
    }

    async fn pop(&self) -> Result<String, QueueError> {
        let mut slot = self.blocking.lock().await;
        loop {
            if slot.is_none() {
                *slot = Some(self.client.get_multiplexed_async_connection().await?);
            }
            let Some(conn) = slot.as_mut() else {
                continue;
            };

            let popped: redis::RedisResult<Option<(String, String)>> = redis::cmd("BRPOP")
                .arg(QUEUE_KEY)
                .arg(BLOCK_TIMEOUT_SECS)
                .query_async(conn)
                .await;

            match popped {
                Ok(Some((_key, payload))) => return Ok(payload),
                Ok(None) => continue,
                Err(err) => {
                    *slot = None;
                    return Err(err.into());
                }
            }
        }
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(QUEUE_KEY).await?;
        Ok(len)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
