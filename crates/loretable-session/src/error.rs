//! Error types for the session layer.

use loretable_encounter::UserId;

/// Errors that can occur during session management.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The identity provider rejected the token.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// No session exists for the given user.
    #[error("session not found for {0}")]
    NotFound(UserId),

    /// The reconnection token doesn't match anything the server issued.
    #[error("invalid reconnection token")]
    InvalidToken,

    /// The reconnection grace period elapsed; the user must authenticate
    /// again.
    #[error("session expired for {0}")]
    SessionExpired(UserId),

    /// The user already has a live connection.
    #[error("{0} already has an active session")]
    AlreadyConnected(UserId),
}
