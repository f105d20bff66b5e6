//! Room rosters and favorites.
//!
//! State is sharded per key: concurrent toggles on unrelated rooms never
//! serialize, while entry-level mutation keeps concurrent updates to one
//! room from losing each other. Direct rooms are auto-vivified from the
//! deterministic pair id; group rooms must be created explicitly.

use crate::clock::Clock;
use crate::error::{DeliveryError, DeliveryResult};
use crate::models::{direct_room_id, Favorite, Room, RoomKind, TargetKind};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub struct RoomStore {
    rooms: DashMap<Uuid, Room>,
    favorites: DashMap<Uuid, HashSet<(Uuid, TargetKind)>>,
    clock: Arc<dyn Clock>,
}

impl RoomStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            rooms: DashMap::new(),
            favorites: DashMap::new(),
            clock,
        }
    }

    /// Creates a room. Direct rooms require exactly two members and resolve
    /// to their deterministic id, so repeated creation for the same pair
    /// returns the same room.
    pub fn create_room(
        &self,
        kind: RoomKind,
        members: Vec<Uuid>,
    ) -> DeliveryResult<Uuid> {
        match kind {
            RoomKind::Direct => {
                let [a, b] = members.as_slice() else {
                    return Err(DeliveryError::Config(
                        "direct rooms have exactly two members".into(),
                    ));
                };
                Ok(self.direct_room(*a, *b))
            }
            RoomKind::Group => {
                let room = Room::group(members, self.clock.now());
                let id = room.id;
                self.rooms.insert(id, room);
                debug!(room_id = %id, "group room created");
                Ok(id)
            }
        }
    }

    /// Resolves (and on first call creates) the direct room for a pair.
    pub fn direct_room(&self, a: Uuid, b: Uuid) -> Uuid {
        let id = direct_room_id(a, b);
        self.rooms
            .entry(id)
            .or_insert_with(|| Room::direct(a, b, self.clock.now()));
        id
    }

    pub fn get(&self, room_id: Uuid) -> DeliveryResult<Room> {
        self.rooms
            .get(&room_id)
            .map(|r| r.clone())
            .ok_or(DeliveryError::RoomNotFound(room_id))
    }

    pub fn members_of(&self, room_id: Uuid) -> DeliveryResult<Vec<Uuid>> {
        let room = self.get(room_id)?;
        let mut members: Vec<Uuid> = room.members.into_iter().collect();
        members.sort();
        Ok(members)
    }

    /// Adds a user to a group room roster.
    pub fn join(&self, room_id: Uuid, user_id: Uuid) -> DeliveryResult<()> {
        let mut room = self
            .rooms
            .get_mut(&room_id)
            .ok_or(DeliveryError::RoomNotFound(room_id))?;
        if room.kind == RoomKind::Direct {
            return Err(DeliveryError::Config("direct rooms have a fixed roster".into()));
        }
        room.members.insert(user_id);
        Ok(())
    }

    pub fn leave(&self, room_id: Uuid, user_id: Uuid) -> DeliveryResult<()> {
        let mut room = self
            .rooms
            .get_mut(&room_id)
            .ok_or(DeliveryError::RoomNotFound(room_id))?;
        if room.kind == RoomKind::Direct {
            return Err(DeliveryError::Config("direct rooms have a fixed roster".into()));
        }
        room.members.remove(&user_id);
        Ok(())
    }

    /// Idempotent favorite toggle; applying it twice restores the original
    /// set. Room targets must exist; user existence is owned by the external
    /// identity service and accepted at this boundary. Returns whether the
    /// target is favorited after the call.
    pub fn toggle_favorite(
        &self,
        owner_id: Uuid,
        target_id: Uuid,
        target_kind: TargetKind,
    ) -> DeliveryResult<bool> {
        if target_kind == TargetKind::Room && !self.rooms.contains_key(&target_id) {
            return Err(DeliveryError::TargetNotFound(target_id));
        }
        let mut set = self.favorites.entry(owner_id).or_default();
        let key = (target_id, target_kind);
        let now_favorited = if set.contains(&key) {
            set.remove(&key);
            false
        } else {
            set.insert(key);
            true
        };
        Ok(now_favorited)
    }

    pub fn favorites_of(&self, owner_id: Uuid) -> Vec<Favorite> {
        self.favorites
            .get(&owner_id)
            .map(|set| {
                set.iter()
                    .map(|(target_id, target_kind)| Favorite {
                        owner_id,
                        target_id: *target_id,
                        target_kind: *target_kind,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every room the user is a member of, for roster snapshots.
    pub fn rooms_for(&self, user_id: Uuid) -> Vec<Room> {
        self.rooms
            .iter()
            .filter(|entry| entry.value().members.contains(&user_id))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn store() -> RoomStore {
        RoomStore::new(Arc::new(SystemClock))
    }

    #[test]
    fn direct_room_resolution_is_idempotent() {
        let store = store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let first = store.direct_room(a, b);
        let second = store.direct_room(b, a);
        assert_eq!(first, second);

        let members = store.members_of(first).unwrap();
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn unknown_group_room_is_an_error() {
        let store = store();
        let missing = Uuid::new_v4();
        assert!(matches!(
            store.members_of(missing),
            Err(DeliveryError::RoomNotFound(id)) if id == missing
        ));
    }

    #[test]
    fn group_roster_join_and_leave() {
        let store = store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let room = store.create_room(RoomKind::Group, vec![a]).unwrap();

        store.join(room, b).unwrap();
        assert_eq!(store.members_of(room).unwrap().len(), 2);

        store.leave(room, a).unwrap();
        assert_eq!(store.members_of(room).unwrap(), vec![b]);
    }

    #[test]
    fn direct_roster_is_fixed() {
        let store = store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let room = store.direct_room(a, b);
        assert!(store.join(room, Uuid::new_v4()).is_err());
    }

    #[test]
    fn favorite_toggle_is_an_involution() {
        let store = store();
        let owner = Uuid::new_v4();
        let target = Uuid::new_v4();

        assert!(store
            .toggle_favorite(owner, target, TargetKind::User)
            .unwrap());
        assert_eq!(store.favorites_of(owner).len(), 1);

        assert!(!store
            .toggle_favorite(owner, target, TargetKind::User)
            .unwrap());
        assert!(store.favorites_of(owner).is_empty());
    }

    #[test]
    fn favoriting_a_missing_room_is_rejected() {
        let store = store();
        let owner = Uuid::new_v4();
        let missing = Uuid::new_v4();
        assert!(matches!(
            store.toggle_favorite(owner, missing, TargetKind::Room),
            Err(DeliveryError::TargetNotFound(id)) if id == missing
        ));
    }

    #[test]
    fn rooms_for_lists_memberships() {
        let store = store();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();
        store.create_room(RoomKind::Group, vec![user]).unwrap();
        store.direct_room(user, other);
        store.create_room(RoomKind::Group, vec![other]).unwrap();

        assert_eq!(store.rooms_for(user).len(), 2);
    }
}
