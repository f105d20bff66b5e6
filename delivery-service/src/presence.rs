//! Per-user online/away/offline state machine.
//!
//! Session open/close transitions come straight from the connection
//! registry; explicit away/online events come from client commands. State
//! updates apply immediately, broadcasts are debounced: transitions inside
//! the configured window collapse into a single presence event, so a flappy
//! reconnect never becomes a broadcast storm.

use crate::clock::Clock;
use crate::error::DeliveryResult;
use crate::events::ServerEvent;
use crate::fanout::{FanoutBus, PRESENCE_TOPIC};
use crate::models::{PresenceRecord, PresenceStatus};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

pub struct PresenceTracker {
    records: DashMap<Uuid, PresenceRecord>,
    /// Users with a broadcast owed, and the moment the window closes.
    pending: Mutex<HashMap<Uuid, DateTime<Utc>>>,
    /// Last status actually put on the wire per user.
    last_broadcast: Mutex<HashMap<Uuid, PresenceStatus>>,
    bus: Arc<dyn FanoutBus>,
    clock: Arc<dyn Clock>,
    debounce: Duration,
}

impl PresenceTracker {
    pub fn new(bus: Arc<dyn FanoutBus>, clock: Arc<dyn Clock>, debounce_ms: u64) -> Self {
        Self {
            records: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            last_broadcast: Mutex::new(HashMap::new()),
            bus,
            clock,
            debounce: Duration::milliseconds(debounce_ms as i64),
        }
    }

    /// Registry hook: a session for the user opened. A new session always
    /// pulls an away user back online.
    pub fn note_session_opened(&self, user_id: Uuid, now: DateTime<Utc>) {
        self.mutate(user_id, now, |record| {
            record.active_session_count += 1;
            record.away_override = false;
        });
    }

    /// Registry hook: a session for the user closed.
    pub fn note_session_closed(&self, user_id: Uuid, now: DateTime<Utc>) {
        self.mutate(user_id, now, |record| {
            record.active_session_count = record.active_session_count.saturating_sub(1);
        });
    }

    /// Explicit away event from the user.
    pub fn set_away(&self, user_id: Uuid) {
        let now = self.clock.now();
        self.mutate(user_id, now, |record| {
            record.away_override = true;
        });
    }

    /// Explicit online event; clears the away override.
    pub fn set_online(&self, user_id: Uuid) {
        let now = self.clock.now();
        self.mutate(user_id, now, |record| {
            record.away_override = false;
        });
    }

    pub fn status(&self, user_id: Uuid) -> PresenceStatus {
        self.records
            .get(&user_id)
            .map(|r| r.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    pub fn active_session_count(&self, user_id: Uuid) -> usize {
        self.records
            .get(&user_id)
            .map(|r| r.active_session_count)
            .unwrap_or(0)
    }

    pub fn record(&self, user_id: Uuid) -> Option<PresenceRecord> {
        self.records.get(&user_id).map(|r| r.clone())
    }

    fn mutate(&self, user_id: Uuid, now: DateTime<Utc>, apply: impl FnOnce(&mut PresenceRecord)) {
        let mut record = self
            .records
            .entry(user_id)
            .or_insert_with(|| PresenceRecord::offline(user_id, now));
        let before = record.status;
        apply(&mut record);
        let after = record.effective_status();
        record.status = after;
        if after != before {
            if matches!(after, PresenceStatus::Offline | PresenceStatus::Away) {
                record.last_seen_at = now;
            }
            drop(record);
            debug!(%user_id, ?before, ?after, "presence transition");
            // Coalesce: an already-open window keeps its deadline.
            self.pending
                .lock()
                .expect("presence pending lock poisoned")
                .entry(user_id)
                .or_insert(now + self.debounce);
        }
    }

    /// Broadcasts the final status of every user whose debounce window has
    /// closed. Flap sequences that land back on the last broadcast status
    /// emit nothing. Returns the number of events published.
    pub async fn flush_due(&self, now: DateTime<Utc>) -> DeliveryResult<usize> {
        let due: Vec<Uuid> = {
            let mut pending = self.pending.lock().expect("presence pending lock poisoned");
            let due: Vec<Uuid> = pending
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(user, _)| *user)
                .collect();
            for user in &due {
                pending.remove(user);
            }
            due
        };

        let mut published = 0;
        for user_id in due {
            let Some(record) = self.record(user_id) else {
                continue;
            };
            let already_broadcast = {
                let last = self
                    .last_broadcast
                    .lock()
                    .expect("presence broadcast lock poisoned");
                last.get(&user_id).copied().unwrap_or(PresenceStatus::Offline) == record.status
            };
            if already_broadcast {
                continue;
            }

            let event = ServerEvent::PresenceUpdate {
                user_id,
                status: record.status,
                last_seen_at: record.last_seen_at,
            };
            let payload = event.to_payload(now)?;
            match self.bus.publish(PRESENCE_TOPIC, &payload).await {
                Ok(()) => {
                    self.last_broadcast
                        .lock()
                        .expect("presence broadcast lock poisoned")
                        .insert(user_id, record.status);
                    published += 1;
                }
                Err(e) => {
                    warn!(%user_id, error = %e, "presence broadcast failed; will retry");
                    self.pending
                        .lock()
                        .expect("presence pending lock poisoned")
                        .insert(user_id, now);
                }
            }
        }
        Ok(published)
    }

    /// Number of broadcasts still waiting on their window.
    pub fn pending_broadcasts(&self) -> usize {
        self.pending
            .lock()
            .expect("presence pending lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fanout::MemoryFanout;

    fn tracker() -> (Arc<PresenceTracker>, Arc<ManualClock>, MemoryFanout) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let bus = MemoryFanout::new();
        let tracker = Arc::new(PresenceTracker::new(
            Arc::new(bus.clone()),
            clock.clone(),
            500,
        ));
        (tracker, clock, bus)
    }

    #[test]
    fn online_iff_sessions_unless_away() {
        let (tracker, clock, _bus) = tracker();
        let user = Uuid::new_v4();
        let now = clock.now();

        assert_eq!(tracker.status(user), PresenceStatus::Offline);

        tracker.note_session_opened(user, now);
        assert_eq!(tracker.status(user), PresenceStatus::Online);
        assert_eq!(tracker.active_session_count(user), 1);

        tracker.set_away(user);
        assert_eq!(tracker.status(user), PresenceStatus::Away);

        // A new session pulls an away user back online.
        tracker.note_session_opened(user, now);
        assert_eq!(tracker.status(user), PresenceStatus::Online);

        tracker.note_session_closed(user, now);
        tracker.note_session_closed(user, now);
        assert_eq!(tracker.status(user), PresenceStatus::Offline);
    }

    #[test]
    fn away_is_reachable_from_offline() {
        let (tracker, _clock, _bus) = tracker();
        let user = Uuid::new_v4();
        tracker.set_away(user);
        assert_eq!(tracker.status(user), PresenceStatus::Away);
        tracker.set_online(user);
        assert_eq!(tracker.status(user), PresenceStatus::Offline);
    }

    #[test]
    fn last_seen_updates_on_offline_and_away() {
        let (tracker, clock, _bus) = tracker();
        let user = Uuid::new_v4();
        let t0 = clock.now();
        tracker.note_session_opened(user, t0);

        clock.advance(Duration::seconds(10));
        let t1 = clock.now();
        tracker.note_session_closed(user, t1);
        assert_eq!(tracker.record(user).unwrap().last_seen_at, t1);
    }

    #[tokio::test]
    async fn rapid_reconnect_coalesces_to_one_broadcast() {
        let (tracker, clock, bus) = tracker();
        let mut rx = bus.subscribe();
        let user = Uuid::new_v4();

        // Flap within the window: offline -> online -> offline -> online.
        let now = clock.now();
        tracker.note_session_opened(user, now);
        tracker.note_session_closed(user, now);
        tracker.note_session_opened(user, now);

        clock.advance(Duration::milliseconds(600));
        let published = tracker.flush_due(clock.now()).await.unwrap();
        assert_eq!(published, 1);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, PRESENCE_TOPIC);
        let parsed: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(parsed["type"], "presence.update");
        assert_eq!(parsed["status"], "online");
    }

    #[tokio::test]
    async fn flap_back_to_last_broadcast_emits_nothing() {
        let (tracker, clock, bus) = tracker();
        let _rx = bus.subscribe();
        let user = Uuid::new_v4();

        let now = clock.now();
        tracker.note_session_opened(user, now);
        tracker.note_session_closed(user, now);

        clock.advance(Duration::milliseconds(600));
        // Never broadcast online, ends offline again: nothing to say.
        let published = tracker.flush_due(clock.now()).await.unwrap();
        assert_eq!(published, 0);
    }

    #[tokio::test]
    async fn window_holds_broadcast_until_deadline() {
        let (tracker, clock, bus) = tracker();
        let _rx = bus.subscribe();
        let user = Uuid::new_v4();

        tracker.note_session_opened(user, clock.now());

        // Window still open: no broadcast yet.
        assert_eq!(tracker.flush_due(clock.now()).await.unwrap(), 0);
        assert_eq!(tracker.pending_broadcasts(), 1);

        clock.advance(Duration::milliseconds(501));
        assert_eq!(tracker.flush_due(clock.now()).await.unwrap(), 1);
        assert_eq!(tracker.pending_broadcasts(), 0);
    }
}
