//! Durable store for transaction records and chat messages.
//!
//! Writes are idempotent per key so concurrent intake and worker activity
//! need no explicit locking:
//!
//! - transactions are inserted if absent and updated by hash
//! - messages are keyed by `sha256(ciphertext || nonce)`; a duplicate create
//!   returns the existing row
//! - a message's anchor block is set at most once
//!
//! [`MemoryStore`] backs tests and single-process deployments; [`PgStore`]
//! is the Postgres implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::GatewayError;
use crate::types::{
    AnchorOutcome, CreatedMessage, Message, MessageQuery, NewMessage, TransactionRecord,
    TransactionStatus, PENDING_PAYLOAD, PROCESSED_PAYLOAD,
};

pub type DbPool = Pool<Postgres>;

/// Errors raised by a store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(err.to_string())
            }
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => GatewayError::unavailable("durable store unavailable"),
            other => GatewayError::internal(other.to_string()),
        }
    }
}

/// Content-derived idempotency key of a message.
pub fn message_hash(ciphertext: &[u8], nonce: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ciphertext);
    hasher.update(nonce);
    hex::encode(hasher.finalize())
}

/// Transaction records written by intake and the queue consumer.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Inserts a pending record; returns false if one already existed.
    async fn insert_if_absent(&self, hash: &str) -> Result<bool, StoreError>;

    /// Marks a record processed, creating it if missing.
    async fn mark_processed(&self, hash: &str, attempts: u32) -> Result<(), StoreError>;

    /// Marks a record dropped after its final failed attempt. A processed
    /// record is left untouched.
    async fn mark_dropped(&self, hash: &str, attempts: u32) -> Result<(), StoreError>;

    async fn get(&self, hash: &str) -> Result<Option<TransactionRecord>, StoreError>;

    /// Checks the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Chat messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, new: NewMessage) -> Result<CreatedMessage, StoreError>;

    /// Messages exchanged between two parties, oldest first.
    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError>;

    async fn anchor_message(&self, id: i64, block: i64) -> Result<AnchorOutcome, StoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    transactions: HashMap<String, TransactionRecord>,
    messages: Vec<Message>,
    message_ids: HashMap<String, usize>,
}

/// In-process store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transaction_count(&self) -> usize {
        self.inner.read().await.transactions.len()
    }

    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn insert_if_absent(&self, hash: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.transactions.contains_key(hash) {
            return Ok(false);
        }
        inner
            .transactions
            .insert(hash.to_string(), TransactionRecord::pending(hash));
        Ok(true)
    }

    async fn mark_processed(&self, hash: &str, attempts: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .transactions
            .entry(hash.to_string())
            .or_insert_with(|| TransactionRecord::pending(hash));
        record.payload = PROCESSED_PAYLOAD.to_vec();
        record.status = TransactionStatus::Processed;
        record.attempts = record.attempts.max(attempts);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_dropped(&self, hash: &str, attempts: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .transactions
            .entry(hash.to_string())
            .or_insert_with(|| TransactionRecord::pending(hash));
        if record.status != TransactionStatus::Processed {
            record.status = TransactionStatus::Dropped;
            record.attempts = record.attempts.max(attempts);
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get(&self, hash: &str) -> Result<Option<TransactionRecord>, StoreError> {
        Ok(self.inner.read().await.transactions.get(hash).cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_message(&self, new: NewMessage) -> Result<CreatedMessage, StoreError> {
        let hash = message_hash(&new.ciphertext, &new.nonce);
        let mut inner = self.inner.write().await;

        if let Some(&index) = inner.message_ids.get(&hash) {
            return Ok(CreatedMessage {
                message: inner.messages[index].clone(),
                created: false,
            });
        }

        let message = Message {
            id: inner.messages.len() as i64 + 1,
            sender: new.sender,
            recipient: new.recipient,
            content_ciphertext: new.ciphertext,
            content_nonce: new.nonce,
            hash: hash.clone(),
            created_at: Utc::now(),
            anchored_at_block: None,
        };
        let index = inner.messages.len();
        inner.messages.push(message.clone());
        inner.message_ids.insert(hash, index);

        Ok(CreatedMessage {
            message,
            created: true,
        })
    }

    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        let between = |m: &&Message| {
            (m.sender == query.address && m.recipient == query.peer)
                || (m.sender == query.peer && m.recipient == query.address)
        };
        let mut found: Vec<Message> = inner
            .messages
            .iter()
            .filter(between)
            .filter(|m| query.since.map_or(true, |since| m.created_at >= since))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        found.truncate(query.limit);
        Ok(found)
    }

    async fn anchor_message(&self, id: i64, block: i64) -> Result<AnchorOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(message) = inner.messages.iter_mut().find(|m| m.id == id) else {
            return Ok(AnchorOutcome::NotFound);
        };
        Ok(match message.anchored_at_block {
            None => {
                message.anchored_at_block = Some(block);
                AnchorOutcome::Anchored
            }
            Some(existing) if existing == block => AnchorOutcome::Unchanged,
            Some(existing) => AnchorOutcome::Conflict { existing },
        })
    }
}

// ============================================================================
// Postgres store
// ============================================================================

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        tx_hash TEXT PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        payload BYTEA
    )
    "#,
    "ALTER TABLE transactions ADD COLUMN IF NOT EXISTS status TEXT NOT NULL DEFAULT 'pending'",
    "ALTER TABLE transactions ADD COLUMN IF NOT EXISTS attempts INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE transactions ADD COLUMN IF NOT EXISTS updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()",
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id BIGSERIAL PRIMARY KEY,
        sender TEXT NOT NULL,
        recipient TEXT NOT NULL,
        content_ciphertext BYTEA NOT NULL,
        content_nonce BYTEA NOT NULL,
        hash TEXT NOT NULL UNIQUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        anchored_at_block BIGINT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS messages_pair_created_idx ON messages (sender, recipient, created_at)",
];

const MESSAGE_COLUMNS: &str =
    "id, sender, recipient, content_ciphertext, content_nonce, hash, created_at, anchored_at_block";

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    tx_hash: String,
    payload: Option<Vec<u8>>,
    status: String,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            hash: row.tx_hash,
            payload: row.payload.unwrap_or_default(),
            attempts: u32::try_from(row.attempts).unwrap_or_default(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Connects and creates the tables if they do not exist.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Database schema ready");
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for PgStore {
    async fn insert_if_absent(&self, hash: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO transactions (tx_hash, payload, status)
            VALUES ($1, $2, 'pending')
            ON CONFLICT (tx_hash) DO NOTHING
            "#,
        )
        .bind(hash)
        .bind(PENDING_PAYLOAD)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_processed(&self, hash: &str, attempts: u32) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO transactions (tx_hash, payload, status, attempts, updated_at)
            VALUES ($1, $2, 'processed', $3, NOW())
            ON CONFLICT (tx_hash) DO UPDATE
            SET payload = EXCLUDED.payload,
                status = 'processed',
                attempts = GREATEST(transactions.attempts, EXCLUDED.attempts),
                updated_at = NOW()
            "#,
        )
        .bind(hash)
        .bind(PROCESSED_PAYLOAD)
        .bind(attempts as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_dropped(&self, hash: &str, attempts: u32) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO transactions (tx_hash, payload, status, attempts, updated_at)
            VALUES ($1, $2, 'dropped', $3, NOW())
            ON CONFLICT (tx_hash) DO UPDATE
            SET status = 'dropped',
                attempts = GREATEST(transactions.attempts, EXCLUDED.attempts),
                updated_at = NOW()
            WHERE transactions.status <> 'processed'
            "#,
        )
        .bind(hash)
        .bind(PENDING_PAYLOAD)
        .bind(attempts as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, hash: &str) -> Result<Option<TransactionRecord>, StoreError> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT tx_hash, payload, status, attempts, created_at, updated_at
            FROM transactions
            WHERE tx_hash = $1
            "#,
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransactionRecord::try_from).transpose()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn create_message(&self, new: NewMessage) -> Result<CreatedMessage, StoreError> {
        let hash = message_hash(&new.ciphertext, &new.nonce);

        let inserted = sqlx::query_as::<_, Message>(&format!(
            r#"
            INSERT INTO messages (sender, recipient, content_ciphertext, content_nonce, hash)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (hash) DO NOTHING
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(&new.sender)
        .bind(&new.recipient)
        .bind(&new.ciphertext)
        .bind(&new.nonce)
        .bind(&hash)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(message) = inserted {
            return Ok(CreatedMessage {
                message,
                created: true,
            });
        }

        let existing = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE hash = $1"
        ))
        .bind(&hash)
        .fetch_one(&self.pool)
        .await?;

        Ok(CreatedMessage {
            message: existing,
            created: false,
        })
    }

    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let messages = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE ((sender = $1 AND recipient = $2) OR (sender = $2 AND recipient = $1))
              AND ($3::timestamptz IS NULL OR created_at >= $3)
            ORDER BY created_at ASC, id ASC
            LIMIT $4
            "#
        ))
        .bind(&query.address)
        .bind(&query.peer)
        .bind(query.since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    async fn anchor_message(&self, id: i64, block: i64) -> Result<AnchorOutcome, StoreError> {
        let updated = sqlx::query(
            "UPDATE messages SET anchored_at_block = $2 WHERE id = $1 AND anchored_at_block IS NULL",
        )
        .bind(id)
        .bind(block)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(AnchorOutcome::Anchored);
        }

        let current: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT anchored_at_block FROM messages WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match current {
            None => AnchorOutcome::NotFound,
            Some((Some(existing),)) if existing == block => AnchorOutcome::Unchanged,
            Some((Some(existing),)) => AnchorOutcome::Conflict { existing },
            // Raced with a concurrent anchor that has since been cleared.
            Some((None,)) => AnchorOutcome::NotFound,
        })
    }
}
