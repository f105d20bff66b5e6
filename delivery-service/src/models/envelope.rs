use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery priority. Ordering is significant: `High > Medium > Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Who should receive an envelope: an explicit user set, or a room whose
/// roster is resolved by the room store at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "lowercase")]
pub enum Audience {
    Users(Vec<Uuid>),
    Room(Uuid),
}

impl Audience {
    /// Explicit user audience with a normalized (sorted, deduplicated) set.
    pub fn users(mut ids: Vec<Uuid>) -> Self {
        ids.sort();
        ids.dedup();
        Audience::Users(ids)
    }
}

/// Options accepted by the dispatcher's send/schedule paths.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: Priority,
    pub expires_at: Option<DateTime<Utc>>,
    /// Jobs sharing a batch key within the coalescing window are merged into
    /// a single outbound envelope.
    pub batch_key: Option<String>,
    /// When set, a displayed -> read transition re-emits an update event to
    /// the observer's other sessions.
    pub acknowledgement_required: bool,
}

/// An immutable notification/message payload plus metadata. Per-recipient
/// delivery progress lives in [`crate::models::DeliveryRecord`]s, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub audience: Audience,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub acknowledgement_required: bool,
}

impl Envelope {
    pub fn new(
        audience: Audience,
        payload: serde_json::Value,
        options: &SendOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            audience,
            payload,
            priority: options.priority,
            created_at: now,
            scheduled_at: None,
            expires_at: options.expires_at,
            acknowledgement_required: options.acknowledgement_required,
        }
    }

    pub fn scheduled(
        audience: Audience,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
        options: &SendOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let mut envelope = Self::new(audience, payload, options, now);
        envelope.scheduled_at = Some(run_at);
        envelope
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}
