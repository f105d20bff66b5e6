pub mod delivery;
pub mod envelope;
pub mod presence;
pub mod room;

pub use delivery::{DeliveryLedger, DeliveryRecord, DeliveryState};
pub use envelope::{Audience, Envelope, Priority, SendOptions};
pub use presence::{PresenceRecord, PresenceStatus};
pub use room::{direct_room_id, Favorite, Room, RoomKind, TargetKind};
