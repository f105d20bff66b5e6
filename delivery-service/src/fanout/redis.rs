//! Redis pub/sub backed fanout for multi-process fleets.
//!
//! Topics map to channels under a `fanout:` prefix. Each process runs one
//! psubscribe listener that feeds the process-local broadcast channel every
//! `FanoutBus::subscribe` receiver hangs off.

use super::{FanoutBus, FanoutError, FanoutMessage};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{error, info};

const CHANNEL_PREFIX: &str = "fanout:";
const LOCAL_CAPACITY: usize = 4096;

fn channel_for(topic: &str) -> String {
    format!("{CHANNEL_PREFIX}{topic}")
}

pub struct RedisFanout {
    client: redis::Client,
    local: broadcast::Sender<FanoutMessage>,
}

impl RedisFanout {
    /// Opens the client and spawns the pattern-subscriber task.
    pub async fn connect(redis_url: &str) -> Result<Self, FanoutError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| FanoutError::Unavailable(e.to_string()))?;
        let (local, _) = broadcast::channel(LOCAL_CAPACITY);

        let listener_client = client.clone();
        let listener_local = local.clone();
        tokio::spawn(async move {
            if let Err(e) = run_listener(listener_client, listener_local).await {
                error!(error = %e, "redis fanout listener exited");
            }
        });

        Ok(Self { client, local })
    }
}

async fn run_listener(
    client: redis::Client,
    local: broadcast::Sender<FanoutMessage>,
) -> redis::RedisResult<()> {
    // Pub/sub requires a dedicated connection, not multiplexed.
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.psubscribe(format!("{CHANNEL_PREFIX}*")).await?;
    info!("redis fanout listener subscribed");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel: String = msg.get_channel_name().into();
        let payload: String = msg.get_payload()?;
        if let Some(topic) = channel.strip_prefix(CHANNEL_PREFIX) {
            let _ = local.send(FanoutMessage {
                topic: topic.to_string(),
                payload,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl FanoutBus for RedisFanout {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), FanoutError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| FanoutError::Unavailable(e.to_string()))?;
        conn.publish::<_, _, ()>(channel_for(topic), payload)
            .await
            .map_err(|e| FanoutError::Unavailable(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<FanoutMessage> {
        self.local.subscribe()
    }
}
