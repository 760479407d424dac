//! Event fan-out over named channels.
//!
//! [`EventHub`] keeps one tokio broadcast channel per channel name
//! (`messages`, `signals:{recipient}`) and hands out receivers to streaming
//! responders. Publishing is fire-and-forget: envelopes are not persisted
//! and subscribers that are absent at publish time never see them.
//!
//! Handlers publish through the [`EventPublisher`] port. In a single process
//! the hub itself is the publisher. With Redis configured, envelopes go out
//! with `PUBLISH` and [`spawn_redis_bridge`] feeds every instance's hub from
//! `SUBSCRIBE messages` + `PSUBSCRIBE signals:*`.
//!
//! # Example
//!
//! ```rust
//! use tollgate_gateway::broadcast::EventHub;
//!
//! let hub = EventHub::new();
//! let mut rx = hub.subscribe("signals:bob");
//!
//! assert_eq!(hub.publish("signals:bob", r#"{"type":"offer"}"#), 1);
//! assert_eq!(hub.publish("signals:alice", "{}"), 0);
//! assert_eq!(rx.try_recv().unwrap(), r#"{"type":"offer"}"#);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, info, trace, warn};

use crate::types::{Envelope, MESSAGES_CHANNEL, SIGNALS_CHANNEL_PREFIX};

/// Per-channel buffer. Receivers further behind than this see
/// `RecvError::Lagged` and skip ahead.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Delay before the Redis bridge resubscribes after a failure.
const BRIDGE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Named broadcast channels.
///
/// Clones share the same channels.
#[derive(Debug, Clone)]
pub struct EventHub {
    channels: Arc<RwLock<HashMap<String, Sender<String>>>>,
    capacity: usize,
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be positive");
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Subscribes to `channel`, creating it if needed.
    ///
    /// Only envelopes published after this call are received. Channels whose
    /// last receiver has gone away are pruned here.
    #[must_use]
    pub fn subscribe(&self, channel: &str) -> Receiver<String> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels.retain(|_, sender| sender.receiver_count() > 0);

        let rx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        debug!(channel, channel_count = channels.len(), "New stream subscriber");
        rx
    }

    /// Publishes `data` on `channel`, returning how many receivers got it.
    pub fn publish(&self, channel: &str, data: impl Into<String>) -> usize {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = channels.get(channel) else {
            trace!(channel, "No subscribers for channel");
            return 0;
        };

        match sender.send(data.into()) {
            Ok(receivers) => {
                trace!(channel, receivers, "Envelope published");
                receivers
            }
            Err(_) => 0,
        }
    }

    /// Total receivers across all channels.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Sender::receiver_count)
            .sum()
    }

    /// Receivers on one channel.
    #[must_use]
    pub fn channel_subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, Sender::receiver_count)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors raised while publishing an envelope.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish failed: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for PublishError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Outbound port for envelopes.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: Envelope) -> Result<(), PublishError>;
}

#[async_trait]
impl EventPublisher for EventHub {
    async fn publish(&self, envelope: Envelope) -> Result<(), PublishError> {
        EventHub::publish(self, &envelope.channel, envelope.data);
        Ok(())
    }
}

/// Publishes through Redis so every gateway instance receives the envelope.
#[derive(Clone)]
pub struct RedisPublisher {
    conn: ConnectionManager,
}

impl RedisPublisher {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl EventPublisher for RedisPublisher {
    async fn publish(&self, envelope: Envelope) -> Result<(), PublishError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(&envelope.channel, &envelope.data).await?;
        Ok(())
    }
}

/// Publishes `envelope`, logging instead of failing.
///
/// Request handlers call this after their primary write has succeeded; a
/// side-channel failure never fails the request.
pub async fn publish_or_log(publisher: &dyn EventPublisher, envelope: Envelope) {
    let channel = envelope.channel.clone();
    if let Err(err) = publisher.publish(envelope).await {
        warn!(channel = %channel, error = %err, "Failed to publish envelope");
    }
}

/// Spawns the task relaying Redis pub/sub traffic into `hub`.
///
/// The task resubscribes after connection failures and runs until aborted.
pub fn spawn_redis_bridge(client: redis::Client, hub: EventHub) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match run_bridge(&client, &hub).await {
                Ok(()) => warn!("Redis pub/sub stream ended, resubscribing"),
                Err(err) => warn!(error = %err, "Redis pub/sub bridge failed, resubscribing"),
            }
            tokio::time::sleep(BRIDGE_RETRY_DELAY).await;
        }
    })
}

async fn run_bridge(client: &redis::Client, hub: &EventHub) -> redis::RedisResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(MESSAGES_CHANNEL).await?;
    pubsub.psubscribe(format!("{SIGNALS_CHANNEL_PREFIX}*")).await?;
    info!("Redis pub/sub bridge subscribed");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(channel = msg.get_channel_name(), error = %err, "Dropping non-text envelope");
                continue;
            }
        };
        hub.publish(msg.get_channel_name(), payload);
    }

    Ok(())
}
