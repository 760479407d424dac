//! Shared data types for the Tollgate gateway.
//!
//! This module defines the records flowing through the transaction pipeline
//! and the envelopes fanned out to live listeners. Queue items and envelopes
//! keep the field names used on the wire by the other services sharing the
//! queue and channels.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Work item kind for accepted transactions.
pub const TX_KIND: &str = "tx";

/// Channel carrying new-message notifications.
pub const MESSAGES_CHANNEL: &str = "messages";

/// Prefix of per-recipient signal channels.
pub const SIGNALS_CHANNEL_PREFIX: &str = "signals:";

/// Name of the signal channel for a recipient address.
pub fn signal_channel(recipient: &str) -> String {
    format!("{SIGNALS_CHANNEL_PREFIX}{recipient}")
}

/// A queued reference to a pending asynchronous task.
///
/// Serialized as `{"kind": "tx", "hash": "...", "retry": 0}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub kind: String,
    #[serde(rename = "hash")]
    pub correlation_id: String,
    #[serde(rename = "retry", default)]
    pub retry_count: u32,
}

impl WorkItem {
    /// A fresh work item for an accepted transaction.
    pub fn transaction(id: impl Into<String>) -> Self {
        Self {
            kind: TX_KIND.to_string(),
            correlation_id: id.into(),
            retry_count: 0,
        }
    }

    /// The same item with its retry counter incremented.
    pub fn retried(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }
}

/// Pipeline status of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processed,
    Dropped,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Dropped => "dropped",
        }
    }

    /// Processed and dropped are terminal.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processed" => Ok(Self::Processed),
            "dropped" => Ok(Self::Dropped),
            other => Err(format!("unknown transaction status '{other}'")),
        }
    }
}

/// Placeholder payload written at intake.
pub const PENDING_PAYLOAD: &[u8] = b"{}";

/// Payload written when the worker processes a transaction.
pub const PROCESSED_PAYLOAD: &[u8] = b"processed";

/// Local record of a transaction's progress through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    pub hash: String,
    #[serde(serialize_with = "serialize_lossy_utf8")]
    pub payload: Vec<u8>,
    pub status: TransactionStatus,
    /// Processing attempts made by the worker.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// A new pending record with the placeholder payload.
    pub fn pending(hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            hash: hash.into(),
            payload: PENDING_PAYLOAD.to_vec(),
            status: TransactionStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

fn serialize_lossy_utf8<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

/// A persisted chat message.
///
/// Ciphertext and nonce are opaque bytes, base64-encoded in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub sender: String,
    pub recipient: String,
    #[serde(serialize_with = "serialize_base64")]
    pub content_ciphertext: Vec<u8>,
    #[serde(serialize_with = "serialize_base64")]
    pub content_nonce: Vec<u8>,
    pub hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchored_at_block: Option<i64>,
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    use base64::Engine as _;
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Decoded input for message creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender: String,
    pub recipient: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// Result of message creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedMessage {
    pub message: Message,
    /// False when an existing row with the same hash was returned.
    pub created: bool,
}

/// Outcome of an anchor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorOutcome {
    /// The block was recorded.
    Anchored,
    /// The message was already anchored at the same block.
    Unchanged,
    /// The message is anchored at a different block.
    Conflict { existing: i64 },
    NotFound,
}

/// Filter for listing the messages exchanged by two parties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub address: String,
    pub peer: String,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Envelope published on the `messages` channel when a message is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageNotice {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: i64,
    pub sender: String,
    pub recipient: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessageNotice {
    fn from(message: &Message) -> Self {
        Self {
            kind: "message".to_string(),
            id: message.id,
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            hash: message.hash.clone(),
            created_at: message.created_at,
        }
    }
}

/// Transient peer-signaling envelope, published to `signals:{to}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// A serialized envelope travelling through a named channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub channel: String,
    pub data: String,
}

impl Envelope {
    pub fn new(channel: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            data: data.into(),
        }
    }
}
