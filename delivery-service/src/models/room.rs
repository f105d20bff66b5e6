use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Namespace for deterministic direct-room id derivation. Fixed forever:
/// clients rely on the same pair always resolving to the same room.
pub const DIRECT_ROOM_NAMESPACE: Uuid = Uuid::from_u128(0x7e57_a11c_e5e1_4a0b_9d2f_c0ffee00d00d);

/// Deterministic, commutative direct-room id for a pair of users.
///
/// Pure function: sorts the pair and derives a UUID v5 over the concatenated
/// bytes, so `direct_room_id(a, b) == direct_room_id(b, a)` and repeated
/// calls are stable without the room existing yet.
pub fn direct_room_id(a: Uuid, b: Uuid) -> Uuid {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut buf = [0u8; 32];
    buf[..16].copy_from_slice(lo.as_bytes());
    buf[16..].copy_from_slice(hi.as_bytes());
    Uuid::new_v5(&DIRECT_ROOM_NAMESPACE, &buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Group,
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub kind: RoomKind,
    pub members: HashSet<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn group(members: impl IntoIterator<Item = Uuid>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: RoomKind::Group,
            members: members.into_iter().collect(),
            created_at: now,
        }
    }

    pub fn direct(a: Uuid, b: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: direct_room_id(a, b),
            kind: RoomKind::Direct,
            members: [a, b].into_iter().collect(),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Room,
    User,
}

/// Idempotent favorite marker, unique per (owner, target, kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Favorite {
    pub owner_id: Uuid,
    pub target_id: Uuid,
    pub target_kind: TargetKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_room_id_is_commutative_and_stable() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let id = direct_room_id(a, b);
        assert_eq!(id, direct_room_id(b, a));
        assert_eq!(id, direct_room_id(a, b));
    }

    #[test]
    fn direct_room_id_differs_per_pair() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        assert_ne!(direct_room_id(a, b), direct_room_id(a, c));
    }

    #[test]
    fn direct_room_has_exactly_two_members() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let room = Room::direct(a, b, Utc::now());
        assert_eq!(room.members.len(), 2);
        assert_eq!(room.id, direct_room_id(a, b));
    }
}
