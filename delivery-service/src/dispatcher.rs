//! Delivery orchestration: resolves audiences, publishes over the fanout
//! bus, falls back to the queue when the bus is unhealthy, and applies
//! client commands.
//!
//! Every accepted send creates PENDING records before any publish is
//! attempted, so a crash between accept and publish leaves recoverable
//! state rather than a silent drop.

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{DeliveryError, DeliveryResult};
use crate::events::{AckKind, ClientCommand, ServerEvent};
use crate::fanout::{user_topic, FanoutBus, FanoutError};
use crate::metrics;
use crate::models::{Audience, DeliveryLedger, DeliveryState, Envelope, SendOptions};
use crate::presence::PresenceTracker;
use crate::queue::DeliveryQueue;
use crate::rooms::RoomStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Dispatcher {
    rooms: Arc<RoomStore>,
    presence: Arc<PresenceTracker>,
    queue: Arc<DeliveryQueue>,
    ledger: Arc<DeliveryLedger>,
    bus: Arc<dyn FanoutBus>,
    clock: Arc<dyn Clock>,
    /// Accepted envelopes by id, kept for acknowledgement handling.
    outbox: DashMap<Uuid, Envelope>,
    publish_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        rooms: Arc<RoomStore>,
        presence: Arc<PresenceTracker>,
        queue: Arc<DeliveryQueue>,
        ledger: Arc<DeliveryLedger>,
        bus: Arc<dyn FanoutBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rooms,
            presence,
            queue,
            ledger,
            bus,
            clock,
            outbox: DashMap::new(),
            publish_timeout: Duration::from_millis(config.publish_timeout_ms),
        }
    }

    fn resolve_recipients(&self, audience: &Audience) -> DeliveryResult<Vec<Uuid>> {
        match audience {
            Audience::Users(ids) => Ok(ids.clone()),
            Audience::Room(room_id) => self.rooms.members_of(*room_id),
        }
    }

    /// Accepts an envelope for immediate delivery. The audience is resolved
    /// to concrete recipients up front and a PENDING record created per
    /// recipient; publishing then runs against the fanout bus with a
    /// timeout, and on any bus failure the whole envelope falls back to the
    /// queue instead of being dropped.
    pub async fn send(
        &self,
        audience: Audience,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> DeliveryResult<Envelope> {
        let now = self.clock.now();
        let envelope = Envelope::new(audience, payload, &options, now);
        let recipients = self.accept(&envelope, now)?;

        if envelope.is_expired(now) {
            self.ledger.expire_pending(envelope.id, now);
            info!(envelope_id = %envelope.id, "envelope expired on arrival");
            return Ok(envelope);
        }

        // Batched sends always take the queue path so the coalescing
        // window can absorb siblings.
        if options.batch_key.is_some() {
            let job_id = self
                .queue
                .enqueue(envelope.clone(), now, options.batch_key.clone());
            debug!(envelope_id = %envelope.id, %job_id, "send queued for batching");
            return Ok(envelope);
        }

        if let Err(err) = self.publish_envelope(&envelope, &recipients, now).await {
            self.fall_back_to_queue(&envelope, now, &err);
        }
        Ok(envelope)
    }

    /// Accepts an envelope for delivery at `run_at`. Returns the envelope
    /// and the queue job carrying it.
    pub async fn schedule(
        &self,
        audience: Audience,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
        options: SendOptions,
    ) -> DeliveryResult<(Envelope, Uuid)> {
        let now = self.clock.now();
        let envelope = Envelope::scheduled(audience, payload, run_at, &options, now);
        self.accept(&envelope, now)?;
        let job_id = self
            .queue
            .enqueue(envelope.clone(), run_at, options.batch_key.clone());
        debug!(envelope_id = %envelope.id, %job_id, %run_at, "envelope scheduled");
        Ok((envelope, job_id))
    }

    /// Resolves recipients and creates PENDING records. Records exist
    /// before any publish is attempted.
    fn accept(&self, envelope: &Envelope, now: DateTime<Utc>) -> DeliveryResult<Vec<Uuid>> {
        let recipients = self.resolve_recipients(&envelope.audience)?;
        for user in &recipients {
            self.ledger.create_pending(envelope.id, *user, now);
        }
        self.outbox.insert(envelope.id, envelope.clone());
        Ok(recipients)
    }

    /// One pump iteration over the queue: dispatches every due job to its
    /// still-PENDING recipients. Returns the number of jobs dispatched.
    pub async fn run_due(&self, now: DateTime<Utc>) -> usize {
        let jobs = self.queue.dequeue_due(now);
        let mut dispatched = 0;
        for job in jobs {
            // Coalesced jobs carry recipients the envelope's audience field
            // does not know about; the ledger is authoritative.
            let pending = self
                .ledger
                .recipients_in_state(job.envelope.id, DeliveryState::Pending);
            if pending.is_empty() {
                let _ = self.queue.ack(job.job_id);
                continue;
            }
            match self.publish_envelope(&job.envelope, &pending, now).await {
                Ok(()) => {
                    if self.queue.ack(job.job_id).is_ok() {
                        dispatched += 1;
                    }
                }
                Err(err) => {
                    warn!(job_id = %job.job_id, error = %err, "queued dispatch failed");
                    if let Err(exhausted) = self.queue.fail(job.job_id, &err.to_string()) {
                        warn!(job_id = %job.job_id, error = %exhausted, "job abandoned");
                    }
                }
            }
        }
        dispatched
    }

    /// Publishes the envelope to each recipient's fanout topic, advancing
    /// records to SENT as publishes succeed. Stops at the first bus error;
    /// already-SENT recipients keep their state and the remainder stay
    /// PENDING for the fallback path.
    async fn publish_envelope(
        &self,
        envelope: &Envelope,
        recipients: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<(), FanoutError> {
        let event = ServerEvent::Notification {
            envelope: envelope.clone(),
        };
        let payload = event
            .to_payload(now)
            .map_err(|e| FanoutError::Unavailable(e.to_string()))?;

        for user in recipients {
            self.ledger.note_attempt(envelope.id, *user, now);
            self.publish_with_timeout(&user_topic(*user), &payload)
                .await?;
            if let Ok(true) = self.ledger.advance(envelope.id, *user, DeliveryState::Sent, now) {
                metrics::DELIVERY_TRANSITIONS
                    .with_label_values(&["sent"])
                    .inc();
            }
        }
        Ok(())
    }

    async fn publish_with_timeout(&self, topic: &str, payload: &str) -> Result<(), FanoutError> {
        match timeout(self.publish_timeout, self.bus.publish(topic, payload)).await {
            Ok(result) => result,
            Err(_) => Err(FanoutError::Timeout(self.publish_timeout)),
        }
    }

    fn fall_back_to_queue(&self, envelope: &Envelope, now: DateTime<Utc>, err: &FanoutError) {
        let reason = match err {
            FanoutError::Unavailable(_) => "unavailable",
            FanoutError::Timeout(_) => "timeout",
        };
        metrics::FANOUT_FALLBACKS.with_label_values(&[reason]).inc();
        let job_id = self.queue.enqueue(envelope.clone(), now, None);
        warn!(envelope_id = %envelope.id, %job_id, reason, "fanout failed, send queued");
    }

    /// Applies a client acknowledgement. Transitions are monotonic: a late
    /// `displayed` after `read` is a no-op, never a regression.
    pub async fn acknowledge(
        &self,
        user_id: Uuid,
        envelope_id: Uuid,
        kind: AckKind,
    ) -> DeliveryResult<()> {
        let now = self.clock.now();
        let (target, label) = match kind {
            AckKind::Displayed => (DeliveryState::Delivered, "delivered"),
            AckKind::Read => (DeliveryState::Read, "read"),
        };
        let changed = self.ledger.advance(envelope_id, user_id, target, now)?;
        if !changed {
            return Ok(());
        }
        metrics::DELIVERY_TRANSITIONS.with_label_values(&[label]).inc();

        let ack_required = self
            .outbox
            .get(&envelope_id)
            .map(|e| e.acknowledgement_required)
            .unwrap_or(false);
        if ack_required {
            // Mirror the state change back to the user's other sessions.
            let event = ServerEvent::Update {
                envelope_id,
                patch: serde_json::json!({ "state": target }),
            };
            self.push_to_user(user_id, &event).await?;
        }
        Ok(())
    }

    /// Parses and applies one raw client frame. Client-visible failures go
    /// back to the issuing user as `error.notice`; everything else is
    /// logged and swallowed so one bad frame cannot kill the session task.
    pub async fn handle_command(&self, user_id: Uuid, raw: &str) {
        let command = match serde_json::from_str::<ClientCommand>(raw) {
            Ok(command) => command,
            Err(err) => {
                debug!(%user_id, error = %err, "unparseable client frame");
                self.notify_error(user_id, "unrecognized command").await;
                return;
            }
        };
        if let Err(err) = self.apply_command(user_id, command).await {
            if err.is_client_visible() {
                self.notify_error(user_id, &err.to_string()).await;
            } else {
                warn!(%user_id, error = %err, "client command failed");
            }
        }
    }

    async fn apply_command(&self, user_id: Uuid, command: ClientCommand) -> DeliveryResult<()> {
        match command {
            ClientCommand::JoinRoom { room_id } => {
                self.rooms.join(room_id, user_id)?;
                self.push_room_snapshot(user_id).await?;
                self.push_people_snapshot(room_id).await
            }
            ClientCommand::LeaveRoom { room_id } => {
                self.rooms.leave(room_id, user_id)?;
                self.push_room_snapshot(user_id).await?;
                self.push_people_snapshot(room_id).await
            }
            ClientCommand::SendMessage { room_id, body } => {
                self.send(Audience::Room(room_id), body, SendOptions::default())
                    .await?;
                Ok(())
            }
            ClientCommand::SetTyping { room_id, active } => {
                self.relay_typing(user_id, room_id, active).await
            }
            ClientCommand::SetPresence { status } => {
                use crate::models::PresenceStatus;
                match status {
                    PresenceStatus::Away => self.presence.set_away(user_id),
                    PresenceStatus::Online => self.presence.set_online(user_id),
                    // Offline is derived from session counts, never claimed.
                    PresenceStatus::Offline => {}
                }
                Ok(())
            }
            ClientCommand::Acknowledge { envelope_id, kind } => {
                self.acknowledge(user_id, envelope_id, kind).await
            }
            ClientCommand::NotificationAction {
                envelope_id,
                action,
            } => {
                info!(%user_id, %envelope_id, action, "notification action");
                // Acting on a notification implies it was read, and the
                // client's other sessions dismiss it.
                self.ledger
                    .advance(envelope_id, user_id, DeliveryState::Read, self.clock.now())?;
                self.push_to_user(user_id, &ServerEvent::Delete { envelope_id })
                    .await
            }
            ClientCommand::ToggleFavorite {
                target_id,
                target_kind,
            } => {
                self.rooms.toggle_favorite(user_id, target_id, target_kind)?;
                let favorites = self.rooms.favorites_of(user_id);
                self.push_to_user(user_id, &ServerEvent::FavoritesSnapshot { favorites })
                    .await
            }
            ClientCommand::StartDirectChat { peer_id } => {
                let room_id = self.rooms.direct_room(user_id, peer_id);
                debug!(%user_id, %peer_id, %room_id, "direct room resolved");
                self.push_room_snapshot(user_id).await
            }
        }
    }

    /// Ephemeral typing relay: straight to the other members' topics, no
    /// records, no queue, dropped on the floor if the bus is down.
    async fn relay_typing(&self, user_id: Uuid, room_id: Uuid, active: bool) -> DeliveryResult<()> {
        let members = self.rooms.members_of(room_id)?;
        let event = ServerEvent::TypingStatus {
            room_id,
            user_id,
            active,
        };
        let payload = event.to_payload(self.clock.now())?;
        for member in members {
            if member == user_id {
                continue;
            }
            if let Err(err) = self.publish_with_timeout(&user_topic(member), &payload).await {
                debug!(%member, error = %err, "typing relay dropped");
            }
        }
        Ok(())
    }

    /// Pushes the room and favorites snapshots a freshly opened session
    /// needs to render its lists.
    pub async fn push_session_snapshots(&self, user_id: Uuid) -> DeliveryResult<()> {
        self.push_room_snapshot(user_id).await?;
        let favorites = self.rooms.favorites_of(user_id);
        self.push_to_user(user_id, &ServerEvent::FavoritesSnapshot { favorites })
            .await
    }

    /// Pushes the updated roster to every current member of the room.
    async fn push_people_snapshot(&self, room_id: Uuid) -> DeliveryResult<()> {
        let members = self.rooms.members_of(room_id)?;
        let event = ServerEvent::PeopleSnapshot {
            room_id,
            members: members.clone(),
        };
        for member in members {
            self.push_to_user(member, &event).await?;
        }
        Ok(())
    }

    async fn push_room_snapshot(&self, user_id: Uuid) -> DeliveryResult<()> {
        let rooms = self.rooms.rooms_for(user_id);
        self.push_to_user(user_id, &ServerEvent::RoomSnapshot { rooms })
            .await
    }

    async fn push_to_user(&self, user_id: Uuid, event: &ServerEvent) -> DeliveryResult<()> {
        let payload = event.to_payload(self.clock.now())?;
        self.publish_with_timeout(&user_topic(user_id), &payload)
            .await
            .map_err(DeliveryError::from)
    }

    async fn notify_error(&self, user_id: Uuid, message: &str) {
        let event = ServerEvent::ErrorNotice {
            message: message.to_string(),
        };
        if let Err(err) = self.push_to_user(user_id, &event).await {
            debug!(%user_id, error = %err, "error notice dropped");
        }
    }

    pub fn envelope(&self, envelope_id: Uuid) -> Option<Envelope> {
        self.outbox.get(&envelope_id).map(|e| e.clone())
    }

    /// Drops outbox envelopes whose delivery records are all gone, i.e.
    /// settled and pruned from the ledger. Keeps the outbox bounded by the
    /// in-flight working set instead of the process lifetime.
    pub fn prune_settled(&self) -> usize {
        let before = self.outbox.len();
        self.outbox
            .retain(|id, _| !self.ledger.recipients_of(*id).is_empty());
        before - self.outbox.len()
    }
}
