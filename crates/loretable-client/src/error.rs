//! Client-side error vocabulary.

use loretable_encounter::CommandError;

/// Why a client operation failed.
///
/// `Rejected` carries the server's typed rejection (inline validation
/// territory); the other variants are client-local conditions the server
/// never saw.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No active channel; commands fail fast rather than queue.
    #[error("not connected")]
    NotConnected,

    /// The local mirror is behind the room (a sequence gap was detected)
    /// and a resync is in flight; mutating commands are held back.
    #[error("local state is stale, resync in progress")]
    Stale,

    /// The server rejected the command.
    #[error(transparent)]
    Rejected(#[from] CommandError),

    /// The reply did not arrive within the delivery timeout. Unknown
    /// outcome: the optimistic mutation was reverted, but the server may
    /// still have applied the command — the next resync settles it.
    #[error("command timed out (outcome unknown)")]
    Timeout,

    /// The channel dropped while the command was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// The peer sent something indecipherable.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The agent has shut down.
    #[error("agent closed")]
    Closed,
}
