use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Response for an error
#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
}

/// Failures during the connection handshake. All of these are fatal to the
/// connection: the reason is sent to the client and the channel is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no credential supplied")]
    Missing,
    #[error("credential expired")]
    Expired,
    #[error("credential invalid")]
    Invalid,
}

impl AuthError {
    /// Machine-readable reason code sent over the wire.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Missing => "AUTH_MISSING",
            AuthError::Expired => "AUTH_EXPIRED",
            AuthError::Invalid => "AUTH_INVALID",
        }
    }
}

/// Failures on a room operation. Non-fatal: the connection stays open and
/// receives a single ROOM_ERROR event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("room does not exist")]
    NotFound,
    #[error("identity is not a member of the room")]
    NotAuthorized,
    #[error("connection has not joined the room")]
    NotInRoom,
}

impl RoomError {
    /// Machine-readable reason code sent over the wire.
    pub fn reason(&self) -> &'static str {
        match self {
            RoomError::NotFound => "NOT_FOUND",
            RoomError::NotAuthorized => "NOT_AUTHORIZED",
            RoomError::NotInRoom => "NOT_IN_ROOM",
        }
    }
}
