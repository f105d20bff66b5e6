use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// Presence state for one user. `status` is `online` iff
/// `active_session_count > 0`, unless an explicit away override is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub last_seen_at: DateTime<Utc>,
    pub active_session_count: usize,
    #[serde(default)]
    pub away_override: bool,
}

impl PresenceRecord {
    pub fn offline(user_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            status: PresenceStatus::Offline,
            last_seen_at: now,
            active_session_count: 0,
            away_override: false,
        }
    }

    /// Status implied by session count and override.
    pub fn effective_status(&self) -> PresenceStatus {
        if self.away_override {
            PresenceStatus::Away
        } else if self.active_session_count > 0 {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        }
    }
}
