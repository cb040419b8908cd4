use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

mod pattern;
#[cfg(feature = "redis-bus")]
mod redis_bus;

pub use pattern::{topic_matches, TopicPattern};
#[cfg(feature = "redis-bus")]
pub use redis_bus::{RedisBus, RedisBusConfig};

const SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("invalid topic pattern: {0}")]
    InvalidPattern(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Connection state of a networked bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Pub/sub side channel shared by every signaling session.
///
/// `publish` hands over one whole message; implementations never split or
/// interleave payloads, so concurrent callers are safe.
pub trait Bus: Send + Sync {
    fn subscribe(&self, pattern: &str) -> BusResult<broadcast::Receiver<BusMessage>>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

/// Simple in-memory bus for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct LocalBus {
    subscriptions: parking_lot::RwLock<HashMap<TopicPattern, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .values()
            .filter(|sender| sender.receiver_count() > 0)
            .count()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, pattern: &str) -> BusResult<broadcast::Receiver<BusMessage>> {
        let pattern = TopicPattern::parse(pattern)?;
        let mut guard = self.subscriptions.write();
        guard.retain(|_, sender| sender.receiver_count() > 0);
        Ok(guard
            .entry(pattern)
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CAPACITY).0)
            .subscribe())
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        if topic.contains('#') || topic.contains('+') {
            return Err(BusError::InvalidPattern(format!(
                "wildcards are not allowed in published topic {topic}"
            )));
        }
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        let guard = self.subscriptions.read();
        for (pattern, sender) in guard.iter() {
            if pattern.matches(topic) {
                // no receivers left is not an error on a lossy bus
                let _ = sender.send(message.clone());
            }
        }
        Ok(())
    }
}
