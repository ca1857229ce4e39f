//! The identity boundary: who is this caller, and are they the DM here?
//!
//! The engine performs no credential logic itself. [`Identity`] is the
//! trait the surrounding application implements — against its own auth
//! provider — and the engine trusts its answers completely. Role is
//! resolved per room: the same user may run one campaign and play in
//! another.

use std::collections::HashMap;
use std::future::Future;

use loretable_encounter::{Role, RoomId, UserId};

use crate::SessionError;

/// Resolves callers to users, and users to per-room roles.
pub trait Identity: Send + Sync + 'static {
    /// Validates the token presented in the handshake.
    ///
    /// # Errors
    /// Returns [`SessionError::AuthFailed`] for invalid or expired tokens.
    fn authenticate(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<UserId, SessionError>> + Send;

    /// The caller's role in a specific room.
    fn role_in_room(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> impl Future<Output = Role> + Send;
}

/// A table-backed [`Identity`] for development, demos, and tests.
///
/// Tokens map straight to user ids; one user per room may be registered
/// as its DM. Production deployments implement [`Identity`] against the
/// campaign backend instead.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentity {
    tokens: HashMap<String, UserId>,
    dms: HashMap<RoomId, UserId>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a token for a user.
    pub fn with_user(mut self, token: impl Into<String>, user_id: UserId) -> Self {
        self.tokens.insert(token.into(), user_id);
        self
    }

    /// Registers a user as the DM of a room.
    pub fn with_dm(mut self, room_id: RoomId, user_id: UserId) -> Self {
        self.dms.insert(room_id, user_id);
        self
    }
}

impl Identity for StaticIdentity {
    async fn authenticate(&self, token: &str) -> Result<UserId, SessionError> {
        self.tokens
            .get(token)
            .copied()
            .ok_or_else(|| SessionError::AuthFailed(format!("unknown token {token:?}")))
    }

    async fn role_in_room(&self, user_id: UserId, room_id: RoomId) -> Role {
        if self.dms.get(&room_id) == Some(&user_id) {
            Role::DungeonMaster
        } else {
            Role::Player
        }
    }
}
