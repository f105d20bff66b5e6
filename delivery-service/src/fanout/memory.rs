//! In-memory bus for tests and single-node deployments.

use super::{FanoutBus, FanoutError, FanoutMessage};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Capacity of the shared channel. Receivers that fall behind see
/// `RecvError::Lagged` and skip.
const CHANNEL_CAPACITY: usize = 4096;

/// Single broadcast channel shared by every subscribed "process". Cloneable;
/// clones publish into the same channel, so several engine instances in one
/// test process behave like a fleet sharing one broker.
#[derive(Clone)]
pub struct MemoryFanout {
    sender: broadcast::Sender<FanoutMessage>,
    available: std::sync::Arc<AtomicBool>,
}

impl MemoryFanout {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            available: std::sync::Arc::new(AtomicBool::new(true)),
        }
    }

    /// Fault injection: while unavailable, every publish fails with
    /// `FanoutError::Unavailable` so callers exercise the queue fallback.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl Default for MemoryFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FanoutBus for MemoryFanout {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), FanoutError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(FanoutError::Unavailable("broker offline".into()));
        }
        // send() errs only when no receiver is subscribed; with no live
        // process listening there is nothing to deliver to.
        let _ = self.sender.send(FanoutMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<FanoutMessage> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = MemoryFanout::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish("user:test", "hello").await.unwrap();

        assert_eq!(a.recv().await.unwrap().payload, "hello");
        assert_eq!(b.recv().await.unwrap().payload, "hello");
    }

    #[tokio::test]
    async fn publishes_fail_while_offline() {
        let bus = MemoryFanout::new();
        let _rx = bus.subscribe();

        bus.set_available(false);
        assert!(bus.publish("user:test", "lost?").await.is_err());

        bus.set_available(true);
        assert!(bus.publish("user:test", "ok").await.is_ok());
    }

    #[tokio::test]
    async fn per_topic_order_is_preserved() {
        let bus = MemoryFanout::new();
        let mut rx = bus.subscribe();

        bus.publish("user:x", "first").await.unwrap();
        bus.publish("user:x", "second").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().payload, "first");
        assert_eq!(rx.recv().await.unwrap().payload, "second");
    }
}
