//! Per-process registry of live client sessions.
//!
//! Each session owns an unbounded channel; the socket task drains the
//! receiver and writes to the wire. Registration requires the identity
//! assertion produced by the external authentication handshake; the
//! registry performs no credential checks of its own. All mutation happens
//! under one write lock, so concurrent register/unregister calls for the
//! same user are linearized and session counts never lose updates.

use crate::clock::Clock;
use crate::error::{DeliveryError, DeliveryResult};
use crate::metrics;
use crate::presence::PresenceTracker;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Identity assertion from the external authentication handshake. The
/// handshake verifies credentials and asserts which user the connection
/// belongs to; the registry only cross-checks the claim.
#[derive(Debug, Clone)]
pub struct SessionClaims {
    pub verified_user_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub process_id: String,
    pub connected_at: DateTime<Utc>,
    sender: UnboundedSender<String>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<Uuid, Session>,
    by_user: HashMap<Uuid, HashSet<Uuid>>,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    presence: Arc<PresenceTracker>,
    clock: Arc<dyn Clock>,
    process_id: String,
}

impl ConnectionRegistry {
    pub fn new(presence: Arc<PresenceTracker>, clock: Arc<dyn Clock>, process_id: String) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            presence,
            clock,
            process_id,
        }
    }

    /// Registers a live session for a user. Fails with
    /// `UnauthenticatedSession` when the claimed user does not match the
    /// verified identity. Returns the receiver the socket task drains.
    pub async fn register(
        &self,
        claims: &SessionClaims,
        user_id: Uuid,
        session_id: Uuid,
    ) -> DeliveryResult<UnboundedReceiver<String>> {
        if claims.verified_user_id != user_id {
            return Err(DeliveryError::UnauthenticatedSession { user_id });
        }

        let (tx, rx) = unbounded_channel();
        let now = self.clock.now();
        let session = Session {
            session_id,
            user_id,
            process_id: self.process_id.clone(),
            connected_at: now,
            sender: tx,
        };

        let mut inner = self.inner.write().await;
        inner.sessions.insert(session_id, session);
        inner.by_user.entry(user_id).or_default().insert(session_id);
        // Presence update inside the write lock keeps per-user session
        // counting linearizable.
        self.presence.note_session_opened(user_id, now);
        metrics::CONNECTED_SESSIONS.set(inner.sessions.len() as i64);
        debug!(%user_id, %session_id, "session registered");
        Ok(rx)
    }

    /// Removes a session on disconnect or forced close (auth revoked).
    pub async fn unregister(&self, session_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.remove(&session_id) {
            if let Some(set) = inner.by_user.get_mut(&session.user_id) {
                set.remove(&session_id);
                if set.is_empty() {
                    inner.by_user.remove(&session.user_id);
                }
            }
            self.presence
                .note_session_closed(session.user_id, self.clock.now());
            metrics::CONNECTED_SESSIONS.set(inner.sessions.len() as i64);
            debug!(user_id = %session.user_id, %session_id, "session unregistered");
        }
    }

    pub async fn sessions_for(&self, user_id: Uuid) -> Vec<Session> {
        let inner = self.inner.read().await;
        inner
            .by_user
            .get(&user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn has_sessions_for(&self, user_id: Uuid) -> bool {
        self.inner.read().await.by_user.contains_key(&user_id)
    }

    /// Pushes a serialized event to every live session of the user.
    /// Sessions whose channel has closed are pruned lazily. Returns how
    /// many sessions the payload reached.
    pub async fn deliver_to_user(&self, user_id: Uuid, payload: &str) -> usize {
        let mut inner = self.inner.write().await;
        let Some(ids) = inner.by_user.get(&user_id) else {
            return 0;
        };
        let mut reached = 0;
        let mut dead = Vec::new();
        for id in ids {
            match inner.sessions.get(id) {
                Some(session) if session.sender.send(payload.to_string()).is_ok() => reached += 1,
                _ => dead.push(*id),
            }
        }
        for id in dead {
            inner.sessions.remove(&id);
            if let Some(set) = inner.by_user.get_mut(&user_id) {
                set.remove(&id);
                if set.is_empty() {
                    inner.by_user.remove(&user_id);
                }
            }
        }
        reached
    }

    /// Pushes a serialized event to every session on this process.
    pub async fn deliver_to_all(&self, payload: &str) -> usize {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .filter(|session| session.sender.send(payload.to_string()).is_ok())
            .count()
    }

    pub async fn connected_sessions(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::fanout::MemoryFanout;

    fn registry() -> ConnectionRegistry {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let presence = Arc::new(PresenceTracker::new(
            Arc::new(MemoryFanout::new()),
            clock.clone(),
            500,
        ));
        ConnectionRegistry::new(presence, clock, "test-process".into())
    }

    #[tokio::test]
    async fn register_requires_matching_identity() {
        let registry = registry();
        let user = Uuid::new_v4();
        let claims = SessionClaims {
            verified_user_id: Uuid::new_v4(),
        };

        let err = registry
            .register(&claims, user, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::UnauthenticatedSession { user_id } if user_id == user
        ));
        assert_eq!(registry.connected_sessions().await, 0);
    }

    #[tokio::test]
    async fn register_and_deliver() {
        let registry = registry();
        let user = Uuid::new_v4();
        let claims = SessionClaims {
            verified_user_id: user,
        };

        let mut rx = registry
            .register(&claims, user, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(registry.deliver_to_user(user, "ping").await, 1);
        assert_eq!(rx.recv().await.unwrap(), "ping");
    }

    #[tokio::test]
    async fn deliver_reaches_every_session_of_user() {
        let registry = registry();
        let user = Uuid::new_v4();
        let claims = SessionClaims {
            verified_user_id: user,
        };

        let mut rx1 = registry
            .register(&claims, user, Uuid::new_v4())
            .await
            .unwrap();
        let mut rx2 = registry
            .register(&claims, user, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(registry.deliver_to_user(user, "hello").await, 2);
        assert_eq!(rx1.recv().await.unwrap(), "hello");
        assert_eq!(rx2.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn unregister_updates_session_count() {
        let registry = registry();
        let user = Uuid::new_v4();
        let claims = SessionClaims {
            verified_user_id: user,
        };
        let session = Uuid::new_v4();

        let _rx = registry.register(&claims, user, session).await.unwrap();
        assert_eq!(registry.connected_sessions().await, 1);

        registry.unregister(session).await;
        assert_eq!(registry.connected_sessions().await, 0);
        assert_eq!(registry.deliver_to_user(user, "gone").await, 0);
    }

    #[tokio::test]
    async fn registration_drives_presence() {
        let registry = registry();
        let user = Uuid::new_v4();
        let claims = SessionClaims {
            verified_user_id: user,
        };
        let session = Uuid::new_v4();

        let _rx = registry.register(&claims, user, session).await.unwrap();
        assert_eq!(registry.presence.active_session_count(user), 1);

        registry.unregister(session).await;
        assert_eq!(registry.presence.active_session_count(user), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_delivery() {
        let registry = registry();
        let user = Uuid::new_v4();
        let claims = SessionClaims {
            verified_user_id: user,
        };

        let rx = registry
            .register(&claims, user, Uuid::new_v4())
            .await
            .unwrap();
        drop(rx);

        assert_eq!(registry.deliver_to_user(user, "lost").await, 0);
        assert!(!registry.has_sessions_for(user).await);
    }
}
