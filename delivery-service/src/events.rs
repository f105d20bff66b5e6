//! Wire events: inbound client commands and outbound server events.
//!
//! Both sides are exhaustive tagged enums following the `object.action`
//! naming convention. All outbound payloads share the same top-level
//! structure: `type`, `timestamp`, plus variant fields flattened in.

use crate::models::{Envelope, Favorite, PresenceStatus, Room, TargetKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client acknowledgement kinds for a delivered envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckKind {
    /// Rendered on screen; advances the record to DELIVERED.
    Displayed,
    /// Read by the user; advances the record to READ.
    Read,
}

/// Commands a connected client may issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    #[serde(rename = "room.join")]
    JoinRoom { room_id: Uuid },

    #[serde(rename = "room.leave")]
    LeaveRoom { room_id: Uuid },

    #[serde(rename = "message.send")]
    SendMessage {
        room_id: Uuid,
        body: serde_json::Value,
    },

    #[serde(rename = "typing.set")]
    SetTyping { room_id: Uuid, active: bool },

    #[serde(rename = "presence.set")]
    SetPresence { status: PresenceStatus },

    #[serde(rename = "notification.ack")]
    Acknowledge { envelope_id: Uuid, kind: AckKind },

    #[serde(rename = "notification.action")]
    NotificationAction { envelope_id: Uuid, action: String },

    #[serde(rename = "favorite.toggle")]
    ToggleFavorite {
        target_id: Uuid,
        target_kind: TargetKind,
    },

    #[serde(rename = "chat.start_direct")]
    StartDirectChat { peer_id: Uuid },
}

/// Events pushed to client sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "notification.new")]
    Notification { envelope: Envelope },

    #[serde(rename = "notification.update")]
    Update {
        envelope_id: Uuid,
        patch: serde_json::Value,
    },

    #[serde(rename = "notification.delete")]
    Delete { envelope_id: Uuid },

    #[serde(rename = "presence.update")]
    PresenceUpdate {
        user_id: Uuid,
        status: PresenceStatus,
        last_seen_at: DateTime<Utc>,
    },

    #[serde(rename = "typing.status")]
    TypingStatus {
        room_id: Uuid,
        user_id: Uuid,
        active: bool,
    },

    #[serde(rename = "room.snapshot")]
    RoomSnapshot { rooms: Vec<Room> },

    /// Current roster of one room, sent after membership changes.
    #[serde(rename = "people.snapshot")]
    PeopleSnapshot { room_id: Uuid, members: Vec<Uuid> },

    #[serde(rename = "favorites.snapshot")]
    FavoritesSnapshot { favorites: Vec<Favorite> },

    /// Generic error channel: plain message, no structured codes.
    #[serde(rename = "error.notice")]
    ErrorNotice { message: String },
}

impl ServerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Notification { .. } => "notification.new",
            Self::Update { .. } => "notification.update",
            Self::Delete { .. } => "notification.delete",
            Self::PresenceUpdate { .. } => "presence.update",
            Self::TypingStatus { .. } => "typing.status",
            Self::RoomSnapshot { .. } => "room.snapshot",
            Self::PeopleSnapshot { .. } => "people.snapshot",
            Self::FavoritesSnapshot { .. } => "favorites.snapshot",
            Self::ErrorNotice { .. } => "error.notice",
        }
    }

    /// Serializes the event for the wire with an emission timestamp folded
    /// into the flat top-level object.
    pub fn to_payload(&self, now: DateTime<Utc>) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "timestamp".to_string(),
                serde_json::Value::String(now.to_rfc3339()),
            );
        }
        serde_json::to_string(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Audience, SendOptions};

    #[test]
    fn server_event_payload_is_flat() {
        let now = Utc::now();
        let event = ServerEvent::TypingStatus {
            room_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            active: true,
        };
        let payload = event.to_payload(now).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["type"], "typing.status");
        assert_eq!(parsed["active"], true);
        assert!(parsed["timestamp"].is_string());
    }

    #[test]
    fn notification_event_round_trips() {
        let envelope = Envelope::new(
            Audience::users(vec![Uuid::new_v4()]),
            serde_json::json!({"body": "hello"}),
            &SendOptions::default(),
            Utc::now(),
        );
        let event = ServerEvent::Notification {
            envelope: envelope.clone(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        match back {
            ServerEvent::Notification { envelope: e } => assert_eq!(e.id, envelope.id),
            other => panic!("unexpected event: {:?}", other.event_type()),
        }
    }

    #[test]
    fn client_command_parses_tagged_type() {
        let raw = serde_json::json!({
            "type": "notification.ack",
            "envelope_id": Uuid::new_v4(),
            "kind": "read",
        });
        let cmd: ClientCommand = serde_json::from_value(raw).unwrap();
        match cmd {
            ClientCommand::Acknowledge { kind, .. } => assert_eq!(kind, AckKind::Read),
            _ => panic!("wrong command variant"),
        }
    }

    #[test]
    fn error_notice_is_message_only() {
        let event = ServerEvent::ErrorNotice {
            message: "room not found".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "error.notice");
        assert_eq!(value["message"], "room not found");
        assert_eq!(value.as_object().unwrap().len(), 2);
    }
}
