use huddle_proto::ProtoError;
use thiserror::Error;

/// Failures while routing a single inbound frame. None of these are fatal to
/// the connection; the dispatcher logs them and moves on.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),
    #[error("connection is not authenticated")]
    Unauthenticated,
    #[error("connection is not a member of any room")]
    NotInRoom,
    #[error("{kind} requires a targetUserId")]
    MissingTarget { kind: String },
    #[error("target {target} is not connected to room {room_id}")]
    TargetUnavailable { target: String, room_id: String },
}

impl RouteError {
    /// Routing misses are routine (peers leave mid-negotiation) and are logged
    /// at debug; everything else indicates a misbehaving client.
    pub fn is_routine(&self) -> bool {
        matches!(self, RouteError::TargetUnavailable { .. })
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("stored room {room_id} has invalid room_type {value}")]
    InvalidRoomType { room_id: String, value: String },
    #[error("room store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token is empty")]
    EmptyToken,
    #[error("token missing subject")]
    MissingSubject,
}
