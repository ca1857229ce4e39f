//! The session registry: every user currently connected (or within their
//! reconnection grace period).
//!
//! Not thread-safe by itself — it is owned by the server and accessed
//! behind a higher-level mutex, which keeps this layer free of hidden
//! locking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use loretable_encounter::UserId;
use rand::Rng;

use crate::{Session, SessionConfig, SessionError, SessionState};

/// Tracks all live sessions and their reconnection tokens.
pub struct SessionManager {
    sessions: HashMap<UserId, Session>,
    /// Token → user index, kept in sync with `sessions`.
    tokens: HashMap<String, UserId>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            tokens: HashMap::new(),
            config,
        }
    }

    /// Creates a session after successful authentication.
    ///
    /// # Errors
    /// [`SessionError::AlreadyConnected`] if the user already has a live
    /// connection. A leftover disconnected/expired session is replaced.
    pub fn create(&mut self, user_id: UserId) -> Result<&Session, SessionError> {
        if let Some(existing) = self.sessions.get(&user_id) {
            if matches!(existing.state, SessionState::Connected) {
                return Err(SessionError::AlreadyConnected(user_id));
            }
            self.tokens.remove(&existing.reconnect_token);
        }

        let token = generate_token();
        let session = Session {
            user_id,
            state: SessionState::Connected,
            reconnect_token: token.clone(),
        };
        self.tokens.insert(token, user_id);
        self.sessions.insert(user_id, session);

        tracing::info!(%user_id, "session created");
        Ok(self.sessions.get(&user_id).expect("just inserted"))
    }

    /// Marks a user disconnected; the reconnection grace period starts.
    pub fn disconnect(&mut self, user_id: UserId) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&user_id)
            .ok_or(SessionError::NotFound(user_id))?;
        session.state = SessionState::Disconnected {
            since: Instant::now(),
        };
        tracing::info!(%user_id, "disconnected, grace period started");
        Ok(())
    }

    /// Resumes a session with its reconnection token.
    ///
    /// # Errors
    /// - [`SessionError::InvalidToken`] — token not recognized
    /// - [`SessionError::SessionExpired`] — grace period elapsed
    /// - [`SessionError::AlreadyConnected`] — the session never dropped
    pub fn reconnect(&mut self, token: &str) -> Result<&Session, SessionError> {
        let user_id = self
            .tokens
            .get(token)
            .copied()
            .ok_or(SessionError::InvalidToken)?;
        let session = self
            .sessions
            .get_mut(&user_id)
            .ok_or(SessionError::InvalidToken)?;

        match &session.state {
            SessionState::Disconnected { since } => {
                let grace = Duration::from_secs(self.config.reconnect_grace_secs);
                if since.elapsed() > grace {
                    session.state = SessionState::Expired;
                    return Err(SessionError::SessionExpired(user_id));
                }
                session.state = SessionState::Connected;
                tracing::info!(%user_id, "reconnected");
                Ok(self.sessions.get(&user_id).expect("just modified"))
            }
            SessionState::Connected => Err(SessionError::AlreadyConnected(user_id)),
            SessionState::Expired => Err(SessionError::SessionExpired(user_id)),
        }
    }

    /// Expires every disconnected session past its grace period; returns
    /// the affected users so callers can detach them from rooms before
    /// [`cleanup_expired`](Self::cleanup_expired) frees the records.
    pub fn expire_stale(&mut self) -> Vec<UserId> {
        let grace = Duration::from_secs(self.config.reconnect_grace_secs);
        let mut expired = Vec::new();
        for session in self.sessions.values_mut() {
            if let SessionState::Disconnected { since } = &session.state {
                if since.elapsed() > grace {
                    session.state = SessionState::Expired;
                    expired.push(session.user_id);
                    tracing::info!(user_id = %session.user_id, "session expired");
                }
            }
        }
        expired
    }

    /// Drops expired sessions and invalidates their tokens.
    pub fn cleanup_expired(&mut self) {
        self.sessions.retain(|_, session| {
            if matches!(session.state, SessionState::Expired) {
                self.tokens.remove(&session.reconnect_token);
                false
            } else {
                true
            }
        });
    }

    pub fn get(&self, user_id: &UserId) -> Option<&Session> {
        self.sessions.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// 128 bits of randomness, hex-encoded: infeasible to guess, cheap to
/// compare.
fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// =========================================================================
// Tests
// =========================================================================
