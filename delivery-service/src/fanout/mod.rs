//! Process-to-process event propagation.
//!
//! The broker sits behind a narrow publish/subscribe capability so the
//! implementation is swappable: [`MemoryFanout`] for tests and single-node
//! deployments, [`RedisFanout`] for a real fleet. Each process runs one
//! subscriber feeding its local connection registry, so an event published
//! anywhere reaches every process exactly once per publish; per-topic
//! ordering is FIFO, cross-topic interleaving is unspecified.

pub mod memory;
pub mod redis;

use crate::error::DeliveryError;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

pub use memory::MemoryFanout;
pub use self::redis::RedisFanout;

/// Control topic for presence broadcasts.
pub const PRESENCE_TOPIC: &str = "presence";

/// Topic carrying everything addressed to one user's sessions.
pub fn user_topic(user_id: Uuid) -> String {
    format!("user:{user_id}")
}

/// Extracts the user id from a `user:{uuid}` topic.
pub fn parse_user_topic(topic: &str) -> Option<Uuid> {
    topic
        .strip_prefix("user:")
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

#[derive(Debug, Clone)]
pub struct FanoutMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("fanout unavailable: {0}")]
    Unavailable(String),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

impl From<FanoutError> for DeliveryError {
    fn from(err: FanoutError) -> Self {
        DeliveryError::FanoutUnavailable(err.to_string())
    }
}

#[async_trait]
pub trait FanoutBus: Send + Sync {
    /// Publishes a payload on a topic. At-least-once at the transport level
    /// is acceptable; delivery records downstream make retries idempotent.
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), FanoutError>;

    /// One subscription per process; the receiver sees every topic and the
    /// listener filters against the local registry.
    fn subscribe(&self) -> broadcast::Receiver<FanoutMessage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_topic_round_trips() {
        let id = Uuid::new_v4();
        assert_eq!(parse_user_topic(&user_topic(id)), Some(id));
    }

    #[test]
    fn parse_rejects_foreign_topics() {
        assert_eq!(parse_user_topic(PRESENCE_TOPIC), None);
        assert_eq!(parse_user_topic("user:not-a-uuid"), None);
    }
}
