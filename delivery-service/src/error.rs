use crate::models::delivery::DeliveryState;
use thiserror::Error;
use uuid::Uuid;

pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("configuration error: {0}")]
    Config(String),

    /// Registration attempted without a verified identity assertion, or the
    /// claimed user does not match the verified one. Fatal to that
    /// connection attempt.
    #[error("unauthenticated session for user {user_id}")]
    UnauthenticatedSession { user_id: Uuid },

    #[error("room not found: {0}")]
    RoomNotFound(Uuid),

    /// The fanout broker is unreachable or a publish timed out. Callers fall
    /// back to the delivery queue; this never surfaces to clients.
    #[error("fanout unavailable: {0}")]
    FanoutUnavailable(String),

    /// A queued job exhausted its retry budget. Surfaced on the operator
    /// failure channel, never to clients.
    #[error("queue job {job_id} failed after {attempts} attempts: {reason}")]
    QueueJobFailed {
        job_id: Uuid,
        attempts: u32,
        reason: String,
    },

    #[error("queue job not found: {0}")]
    JobNotFound(Uuid),

    #[error("invalid delivery state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: DeliveryState,
        to: DeliveryState,
    },

    #[error("delivery record not found for envelope {envelope_id} user {user_id}")]
    RecordNotFound { envelope_id: Uuid, user_id: Uuid },

    #[error("target not found: {0}")]
    TargetNotFound(Uuid),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Caller errors are reported back to the client over the generic error
    /// notice channel; everything else is handled internally.
    pub fn is_client_visible(&self) -> bool {
        matches!(
            self,
            DeliveryError::RoomNotFound(_)
                | DeliveryError::TargetNotFound(_)
                | DeliveryError::InvalidTransition { .. }
                | DeliveryError::UnauthenticatedSession { .. }
        )
    }
}
