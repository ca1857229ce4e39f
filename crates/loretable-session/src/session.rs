//! Session types: the server's record of a connected user.

use std::time::Instant;

use loretable_encounter::UserId;

/// Configuration for session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a disconnected user has to reconnect before their session
    /// is permanently expired. 0 disables reconnection.
    pub reconnect_grace_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_grace_secs: 30,
        }
    }
}

/// Connection lifecycle of one user.
///
/// ```text
///   Connected ──(disconnect)──→ Disconnected ──(grace elapsed)──→ Expired
///       ↑                            │
///       └────────(reconnect)─────────┘
/// ```
///
/// `Instant` is monotonic — grace-period math is immune to wall-clock
/// adjustments.
#[derive(Debug, Clone)]
pub enum SessionState {
    Connected,
    Disconnected { since: Instant },
    Expired,
}

/// One user's session.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    pub state: SessionState,
    /// Secret presented to resume this session after a brief disconnect,
    /// instead of re-authenticating. 128 bits, hex-encoded.
    pub reconnect_token: String,
}
