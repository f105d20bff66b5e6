//! Process-level wiring: one [`ProcessContext`] per engine process, plus the
//! background tasks that keep it flowing.

use crate::clock::Clock;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::fanout::{parse_user_topic, FanoutBus, PRESENCE_TOPIC};
use crate::metrics::{self, MetricsSnapshot};
use crate::models::DeliveryLedger;
use crate::presence::PresenceTracker;
use crate::error::DeliveryResult;
use crate::queue::{DeliveryQueue, FailedJobReport};
use crate::registry::{ConnectionRegistry, SessionClaims};
use crate::rooms::RoomStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often the queue pump sweeps for due jobs.
const PUMP_INTERVAL: Duration = Duration::from_millis(250);
/// How often debounced presence broadcasts are flushed.
const PRESENCE_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
/// How often the metrics snapshot is refreshed and settled state swept.
const METRICS_INTERVAL: Duration = Duration::from_secs(15);
/// How long terminal delivery records linger before the sweep drops them.
/// Long-term retention belongs to the external store.
const RECORD_RETENTION_SECS: i64 = 3_600;

/// Everything one engine process shares across its session tasks.
pub struct ProcessContext {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub bus: Arc<dyn FanoutBus>,
    pub ledger: Arc<DeliveryLedger>,
    pub rooms: Arc<RoomStore>,
    pub presence: Arc<PresenceTracker>,
    pub registry: Arc<ConnectionRegistry>,
    pub queue: Arc<DeliveryQueue>,
    pub dispatcher: Arc<Dispatcher>,
}

impl ProcessContext {
    /// Builds the full object graph around an already-connected bus.
    /// Returns the context and the operator failure channel.
    pub fn new(
        config: Config,
        bus: Arc<dyn FanoutBus>,
        clock: Arc<dyn Clock>,
    ) -> (Arc<Self>, UnboundedReceiver<FailedJobReport>) {
        let ledger = Arc::new(DeliveryLedger::new());
        let rooms = Arc::new(RoomStore::new(clock.clone()));
        let presence = Arc::new(PresenceTracker::new(
            bus.clone(),
            clock.clone(),
            config.presence_debounce_ms,
        ));
        let registry = Arc::new(ConnectionRegistry::new(
            presence.clone(),
            clock.clone(),
            config.process_id.clone(),
        ));
        let (queue, failures) = DeliveryQueue::new(&config, ledger.clone(), clock.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            rooms.clone(),
            presence.clone(),
            queue.clone(),
            ledger.clone(),
            bus.clone(),
            clock.clone(),
        ));
        let context = Arc::new(Self {
            config,
            clock,
            bus,
            ledger,
            rooms,
            presence,
            registry,
            queue,
            dispatcher,
        });
        (context, failures)
    }

    /// Opens a client session: registers it and pushes the room and
    /// favorites snapshots the new session renders its lists from. A bus
    /// hiccup on the snapshot push never fails the registration; the
    /// client can still request state explicitly.
    pub async fn open_session(
        &self,
        claims: &SessionClaims,
        user_id: Uuid,
        session_id: Uuid,
    ) -> DeliveryResult<UnboundedReceiver<String>> {
        let rx = self.registry.register(claims, user_id, session_id).await?;
        if let Err(err) = self.dispatcher.push_session_snapshots(user_id).await {
            warn!(%user_id, error = %err, "session snapshots dropped");
        }
        Ok(rx)
    }

    /// Spawns the long-running tasks of one process: the fanout listener,
    /// the queue pump, the presence flusher, the failure drain and the
    /// metrics updater.
    pub fn spawn_background(
        self: &Arc<Self>,
        failures: UnboundedReceiver<FailedJobReport>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_fanout_listener(),
            self.spawn_queue_pump(),
            self.spawn_presence_flusher(),
            self.spawn_failure_drain(failures),
            self.spawn_metrics_updater(),
        ]
    }

    /// Routes bus messages into the local registry: presence broadcasts to
    /// every session, user topics to that user's sessions on this process.
    fn spawn_fanout_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let ctx = self.clone();
        let mut rx = ctx.bus.subscribe();
        tokio::spawn(async move {
            info!(process_id = %ctx.config.process_id, "fanout listener started");
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if message.topic == PRESENCE_TOPIC {
                            ctx.registry.deliver_to_all(&message.payload).await;
                        } else if let Some(user_id) = parse_user_topic(&message.topic) {
                            ctx.registry.deliver_to_user(user_id, &message.payload).await;
                        } else {
                            debug!(topic = %message.topic, "unroutable fanout topic");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Skipped messages are recovered by the queue path;
                        // records for them are still PENDING.
                        warn!(skipped, "fanout listener lagged");
                    }
                    Err(RecvError::Closed) => {
                        warn!("fanout channel closed, listener exiting");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_queue_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let ctx = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PUMP_INTERVAL);
            loop {
                tick.tick().await;
                let dispatched = ctx.dispatcher.run_due(ctx.clock.now()).await;
                if dispatched > 0 {
                    debug!(dispatched, "queue pump dispatched jobs");
                }
            }
        })
    }

    fn spawn_presence_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let ctx = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PRESENCE_FLUSH_INTERVAL);
            loop {
                tick.tick().await;
                if let Err(err) = ctx.presence.flush_due(ctx.clock.now()).await {
                    warn!(error = %err, "presence flush failed, broadcasts retained");
                }
            }
        })
    }

    /// Drains the operator failure channel. A report here means an envelope
    /// exhausted its retry budget and its pending records are FAILED.
    fn spawn_failure_drain(
        self: &Arc<Self>,
        mut failures: UnboundedReceiver<FailedJobReport>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(report) = failures.recv().await {
                error!(
                    job_id = %report.job_id,
                    envelope_id = %report.envelope_id,
                    attempts = report.attempts,
                    reason = %report.reason,
                    "delivery job exhausted retries"
                );
            }
        })
    }

    fn spawn_metrics_updater(self: &Arc<Self>) -> JoinHandle<()> {
        let ctx = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(METRICS_INTERVAL);
            loop {
                tick.tick().await;
                let cutoff = ctx.clock.now() - chrono::Duration::seconds(RECORD_RETENTION_SECS);
                let pruned_records = ctx.ledger.prune_terminal(cutoff);
                let pruned_envelopes = ctx.dispatcher.prune_settled();
                if pruned_records > 0 || pruned_envelopes > 0 {
                    debug!(pruned_records, pruned_envelopes, "settled state swept");
                }
                let depth = ctx.queue.depth();
                metrics::set_queue_depth(
                    depth.waiting,
                    depth.active,
                    depth.completed,
                    depth.failed,
                );
                let snapshot = MetricsSnapshot::capture();
                let sessions = ctx.registry.connected_sessions().await;
                debug!(
                    sessions,
                    waiting = depth.waiting,
                    uptime_seconds = snapshot.uptime_seconds,
                    "engine heartbeat"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fanout::MemoryFanout;
    use crate::models::{Audience, DeliveryState, SendOptions};
    use crate::registry::SessionClaims;
    use chrono::Utc;
    use uuid::Uuid;

    fn context() -> (Arc<ProcessContext>, UnboundedReceiver<FailedJobReport>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let bus: Arc<dyn FanoutBus> = Arc::new(MemoryFanout::new());
        ProcessContext::new(Config::default(), bus, clock)
    }

    #[tokio::test]
    async fn listener_routes_user_topics_to_local_sessions() {
        let (ctx, failures) = context();
        let handles = ctx.spawn_background(failures);

        let user = Uuid::new_v4();
        let claims = SessionClaims {
            verified_user_id: user,
        };
        let mut session_rx = ctx
            .registry
            .register(&claims, user, Uuid::new_v4())
            .await
            .unwrap();

        let envelope = ctx
            .dispatcher
            .send(
                Audience::users(vec![user]),
                serde_json::json!({"body": "end to end"}),
                SendOptions::default(),
            )
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), session_rx.recv())
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "notification.new");
        assert_eq!(
            ctx.ledger.get(envelope.id, user).unwrap().state,
            DeliveryState::Sent
        );

        for handle in handles {
            handle.abort();
        }
    }
}
