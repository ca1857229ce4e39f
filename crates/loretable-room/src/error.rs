//! Error types for the room layer.

use loretable_encounter::{CommandError, RoomId, UserId};

/// Errors that can occur during room operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// The room does not exist.
    #[error("room {0} not found")]
    NotFound(RoomId),

    /// The user is already in a room (one room at a time).
    #[error("{0} is already in room {1}")]
    AlreadyInRoom(UserId, RoomId),

    /// The user is not in any room.
    #[error("{0} is not in a room")]
    NotInRoom(UserId),

    /// The entity directory could not resolve a participant.
    #[error("directory lookup failed: {0}")]
    Directory(String),

    /// The room actor is gone or its channel is full.
    #[error("room {0} is unavailable")]
    Unavailable(RoomId),

    /// The command itself was rejected by the processor.
    #[error(transparent)]
    Command(#[from] CommandError),
}
