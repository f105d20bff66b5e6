use crate::error::{DeliveryError, DeliveryResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-recipient delivery progress. Transitions are monotonic: the observed
/// sequence is always a subsequence of PENDING -> SENT -> DELIVERED -> READ,
/// or PENDING -> EXPIRED, or PENDING -> FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Sent,
    Delivered,
    Read,
    Expired,
    Failed,
}

impl DeliveryState {
    fn rank(self) -> u8 {
        match self {
            DeliveryState::Pending => 0,
            DeliveryState::Sent => 1,
            DeliveryState::Delivered => 2,
            DeliveryState::Read => 3,
            DeliveryState::Expired | DeliveryState::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryState::Read | DeliveryState::Expired | DeliveryState::Failed
        )
    }
}

/// Tracking record for one (envelope, recipient) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub envelope_id: Uuid,
    pub user_id: Uuid,
    pub state: DeliveryState,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn new(envelope_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            envelope_id,
            user_id,
            state: DeliveryState::Pending,
            attempts: 0,
            last_attempt_at: None,
            updated_at: now,
        }
    }

    /// Advances the record. Returns `Ok(true)` when the state changed,
    /// `Ok(false)` for an idempotent repeat or stale (backward) transition,
    /// and an error for transitions the state machine forbids.
    pub fn advance(&mut self, to: DeliveryState, now: DateTime<Utc>) -> DeliveryResult<bool> {
        let from = self.state;
        if from == to {
            return Ok(false);
        }
        let invalid = DeliveryError::InvalidTransition { from, to };

        if from.is_terminal() {
            return Err(invalid);
        }
        match to {
            // READ requires a prior SENT or DELIVERED.
            DeliveryState::Read if from == DeliveryState::Pending => return Err(invalid),
            // Expiry and retry exhaustion only claim records still pending.
            DeliveryState::Expired | DeliveryState::Failed
                if from != DeliveryState::Pending =>
            {
                return Err(invalid)
            }
            DeliveryState::Pending => return Ok(false),
            _ => {}
        }
        if to.rank() < from.rank() {
            // Stale acknowledgement, e.g. `displayed` arriving after `read`.
            return Ok(false);
        }

        self.state = to;
        self.updated_at = now;
        Ok(true)
    }

    /// Records a fanout attempt without changing state.
    pub fn note_attempt(&mut self, now: DateTime<Utc>) {
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        self.updated_at = now;
    }
}

/// Per-process map of delivery records, keyed by (envelope, user). Durable
/// storage is owned by an external store; these types are serde-ready so
/// that store can persist and restore the same shapes.
#[derive(Debug, Default)]
pub struct DeliveryLedger {
    records: DashMap<(Uuid, Uuid), DeliveryRecord>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a PENDING record. Returns false if the pair already exists,
    /// so repeated resolution of the same envelope stays exactly-one-record
    /// per recipient.
    pub fn create_pending(&self, envelope_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> bool {
        let mut created = false;
        self.records.entry((envelope_id, user_id)).or_insert_with(|| {
            created = true;
            DeliveryRecord::new(envelope_id, user_id, now)
        });
        created
    }

    pub fn get(&self, envelope_id: Uuid, user_id: Uuid) -> Option<DeliveryRecord> {
        self.records
            .get(&(envelope_id, user_id))
            .map(|r| r.clone())
    }

    pub fn advance(
        &self,
        envelope_id: Uuid,
        user_id: Uuid,
        to: DeliveryState,
        now: DateTime<Utc>,
    ) -> DeliveryResult<bool> {
        let mut record = self
            .records
            .get_mut(&(envelope_id, user_id))
            .ok_or(DeliveryError::RecordNotFound {
                envelope_id,
                user_id,
            })?;
        record.advance(to, now)
    }

    pub fn note_attempt(&self, envelope_id: Uuid, user_id: Uuid, now: DateTime<Utc>) {
        if let Some(mut record) = self.records.get_mut(&(envelope_id, user_id)) {
            record.note_attempt(now);
        }
    }

    /// All recipients the envelope was resolved to.
    pub fn recipients_of(&self, envelope_id: Uuid) -> Vec<Uuid> {
        self.records
            .iter()
            .filter(|entry| entry.key().0 == envelope_id)
            .map(|entry| entry.key().1)
            .collect()
    }

    /// Recipients whose record is still in the given state.
    pub fn recipients_in_state(&self, envelope_id: Uuid, state: DeliveryState) -> Vec<Uuid> {
        self.records
            .iter()
            .filter(|entry| entry.key().0 == envelope_id && entry.value().state == state)
            .map(|entry| entry.key().1)
            .collect()
    }

    /// Moves every still-pending record of the envelope to EXPIRED.
    pub fn expire_pending(&self, envelope_id: Uuid, now: DateTime<Utc>) -> usize {
        self.transition_pending(envelope_id, DeliveryState::Expired, now)
    }

    /// Moves every still-pending record of the envelope to FAILED.
    pub fn fail_pending(&self, envelope_id: Uuid, now: DateTime<Utc>) -> usize {
        self.transition_pending(envelope_id, DeliveryState::Failed, now)
    }

    fn transition_pending(
        &self,
        envelope_id: Uuid,
        to: DeliveryState,
        now: DateTime<Utc>,
    ) -> usize {
        let mut moved = 0;
        for mut entry in self.records.iter_mut() {
            if entry.key().0 == envelope_id && entry.value().state == DeliveryState::Pending {
                if entry.value_mut().advance(to, now).unwrap_or(false) {
                    moved += 1;
                }
            }
        }
        moved
    }

    /// Re-keys every record of `from` under `to`. Used when the queue
    /// coalesces batch jobs so absorbed envelopes keep their per-recipient
    /// tracking under the surviving envelope.
    pub fn remap_envelope(&self, from: Uuid, to: Uuid) -> usize {
        let keys: Vec<Uuid> = self.recipients_of(from);
        let mut moved = 0;
        for user_id in keys {
            if let Some((_, mut record)) = self.records.remove(&(from, user_id)) {
                record.envelope_id = to;
                // Keep the older record if the recipient is already tracked
                // under the surviving envelope.
                self.records.entry((to, user_id)).or_insert(record);
                moved += 1;
            }
        }
        moved
    }

    /// Drops terminal records untouched since the cutoff so the map does
    /// not grow for the process lifetime. DELIVERED records are kept: they
    /// may still advance to READ. The external store owns long-term
    /// retention.
    pub fn prune_terminal(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| !(record.state.is_terminal() && record.updated_at < cutoff));
        before - self.records.len()
    }

    /// Number of records for this user sitting in SENT (pushed but not yet
    /// acknowledged as delivered). Drives per-user backpressure.
    pub fn in_flight_count(&self, user_id: Uuid) -> usize {
        self.records
            .iter()
            .filter(|entry| entry.key().1 == user_id && entry.value().state == DeliveryState::Sent)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DeliveryRecord {
        DeliveryRecord::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now())
    }

    #[test]
    fn happy_path_is_monotonic() {
        let now = Utc::now();
        let mut r = record();
        assert!(r.advance(DeliveryState::Sent, now).unwrap());
        assert!(r.advance(DeliveryState::Delivered, now).unwrap());
        assert!(r.advance(DeliveryState::Read, now).unwrap());
        assert_eq!(r.state, DeliveryState::Read);
    }

    #[test]
    fn read_requires_sent_or_delivered() {
        let now = Utc::now();
        let mut r = record();
        assert!(r.advance(DeliveryState::Read, now).is_err());
        r.advance(DeliveryState::Sent, now).unwrap();
        assert!(r.advance(DeliveryState::Read, now).unwrap());
    }

    #[test]
    fn delivered_may_skip_sent() {
        let now = Utc::now();
        let mut r = record();
        assert!(r.advance(DeliveryState::Delivered, now).unwrap());
        assert!(r.advance(DeliveryState::Read, now).unwrap());
    }

    #[test]
    fn stale_ack_is_a_noop() {
        let now = Utc::now();
        let mut r = record();
        r.advance(DeliveryState::Sent, now).unwrap();
        r.advance(DeliveryState::Read, now).unwrap();
        // Terminal; a repeat of the same state is idempotent.
        assert!(!r.advance(DeliveryState::Read, now).unwrap());
    }

    #[test]
    fn downgrade_is_a_noop() {
        let now = Utc::now();
        let mut r = record();
        r.advance(DeliveryState::Delivered, now).unwrap();
        assert!(!r.advance(DeliveryState::Sent, now).unwrap());
        assert_eq!(r.state, DeliveryState::Delivered);
    }

    #[test]
    fn expiry_only_claims_pending() {
        let now = Utc::now();
        let mut r = record();
        r.advance(DeliveryState::Sent, now).unwrap();
        assert!(r.advance(DeliveryState::Expired, now).is_err());

        let mut fresh = record();
        assert!(fresh.advance(DeliveryState::Expired, now).unwrap());
    }

    #[test]
    fn ledger_creates_one_record_per_pair() {
        let ledger = DeliveryLedger::new();
        let envelope = Uuid::new_v4();
        let user = Uuid::new_v4();
        let now = Utc::now();
        assert!(ledger.create_pending(envelope, user, now));
        assert!(!ledger.create_pending(envelope, user, now));
        assert_eq!(ledger.recipients_of(envelope).len(), 1);
    }

    #[test]
    fn ledger_remap_moves_records() {
        let ledger = DeliveryLedger::new();
        let from = Uuid::new_v4();
        let to = Uuid::new_v4();
        let user = Uuid::new_v4();
        let now = Utc::now();
        ledger.create_pending(from, user, now);
        assert_eq!(ledger.remap_envelope(from, to), 1);
        assert!(ledger.get(from, user).is_none());
        assert!(ledger.get(to, user).is_some());
    }

    #[test]
    fn prune_drops_only_stale_terminal_records() {
        let ledger = DeliveryLedger::new();
        let user = Uuid::new_v4();
        let t0 = Utc::now();
        let read = Uuid::new_v4();
        let expired = Uuid::new_v4();
        let sent = Uuid::new_v4();
        let delivered = Uuid::new_v4();
        for envelope in [read, expired, sent, delivered] {
            ledger.create_pending(envelope, user, t0);
        }
        ledger.advance(read, user, DeliveryState::Sent, t0).unwrap();
        ledger.advance(read, user, DeliveryState::Read, t0).unwrap();
        ledger
            .advance(expired, user, DeliveryState::Expired, t0)
            .unwrap();
        ledger.advance(sent, user, DeliveryState::Sent, t0).unwrap();
        ledger
            .advance(delivered, user, DeliveryState::Delivered, t0)
            .unwrap();

        let cutoff = t0 + chrono::Duration::hours(1);
        assert_eq!(ledger.prune_terminal(cutoff), 2);
        assert!(ledger.get(read, user).is_none());
        assert!(ledger.get(expired, user).is_none());
        // Still-live progress survives: SENT awaits acks, DELIVERED may
        // still advance to READ.
        assert!(ledger.get(sent, user).is_some());
        assert!(ledger.get(delivered, user).is_some());
    }

    #[test]
    fn in_flight_counts_sent_only() {
        let ledger = DeliveryLedger::new();
        let user = Uuid::new_v4();
        let now = Utc::now();
        let e1 = Uuid::new_v4();
        let e2 = Uuid::new_v4();
        ledger.create_pending(e1, user, now);
        ledger.create_pending(e2, user, now);
        ledger.advance(e1, user, DeliveryState::Sent, now).unwrap();
        assert_eq!(ledger.in_flight_count(user), 1);
        ledger
            .advance(e1, user, DeliveryState::Delivered, now)
            .unwrap();
        assert_eq!(ledger.in_flight_count(user), 0);
    }
}
