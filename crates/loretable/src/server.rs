//! `LoretableServer`: the accept loop tying every layer together.
//!
//! transport → protocol → session → room, the same stack on every
//! connection. The server is generic over the transport (WebSocket in
//! production, in-memory in tests and demos), the identity boundary, and
//! the entity directory — the two collaborator traits the campaign
//! backend implements.

use std::sync::Arc;
use std::time::Duration;

use loretable_encounter::RoomId;
use loretable_protocol::{Codec, JsonCodec};
use loretable_room::{EntityDirectory, RoomManager};
use loretable_session::{Identity, SessionConfig, SessionManager};
use loretable_transport::Transport;
use tokio::sync::Mutex;

use crate::handler::handle_connection;
use crate::LoretableError;

/// How often disconnected sessions are swept for expiry.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Shared server state handed to each connection task.
pub(crate) struct ServerState<I: Identity, D: EntityDirectory, C: Codec> {
    pub(crate) sessions: Mutex<SessionManager>,
    pub(crate) rooms: Mutex<RoomManager<D>>,
    pub(crate) identity: I,
    pub(crate) codec: C,
}

/// Builder for a [`LoretableServer`].
pub struct LoretableServerBuilder {
    session_config: SessionConfig,
    turn_budget: Duration,
}

impl LoretableServerBuilder {
    pub fn new() -> Self {
        Self {
            session_config: SessionConfig::default(),
            turn_budget: Duration::from_secs(90),
        }
    }

    /// Session behavior (reconnect grace).
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Per-turn time budget before forfeiture.
    pub fn turn_budget(mut self, budget: Duration) -> Self {
        self.turn_budget = budget;
        self
    }

    /// Assembles the server over a pre-bound transport with the given
    /// collaborators. Uses the JSON codec.
    pub fn build<T, I, D>(
        self,
        transport: T,
        identity: I,
        directory: D,
    ) -> LoretableServer<T, I, D, JsonCodec>
    where
        T: Transport,
        I: Identity,
        D: EntityDirectory,
    {
        let state = Arc::new(ServerState {
            sessions: Mutex::new(SessionManager::new(self.session_config)),
            rooms: Mutex::new(RoomManager::new(directory, self.turn_budget)),
            identity,
            codec: JsonCodec,
        });
        LoretableServer { transport, state }
    }
}

impl Default for LoretableServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running live-interaction server.
pub struct LoretableServer<T, I, D, C>
where
    T: Transport,
    I: Identity,
    D: EntityDirectory,
    C: Codec,
{
    transport: T,
    state: Arc<ServerState<I, D, C>>,
}

impl<T, I, D, C> LoretableServer<T, I, D, C>
where
    T: Transport,
    I: Identity,
    D: EntityDirectory,
    C: Codec + Clone,
{
    pub fn builder() -> LoretableServerBuilder {
        LoretableServerBuilder::new()
    }

    /// Opens a room under a backend-assigned id (idempotent).
    pub async fn open_room(&self, room_id: RoomId) -> bool {
        self.state.rooms.lock().await.open_room(room_id)
    }

    /// Opens a room under a generated id.
    pub async fn create_room(&self) -> RoomId {
        self.state.rooms.lock().await.create_room()
    }

    /// Runs the accept loop and the session expiry sweep. Runs until the
    /// transport fails permanently or the task is dropped.
    pub async fn run(mut self) -> Result<(), LoretableError> {
        tracing::info!("loretable live engine running");
        let mut sweep = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, state).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        return Err(LoretableError::Transport(e));
                    }
                },
                _ = sweep.tick() => {
                    self.sweep_sessions().await;
                }
            }
        }
    }

    /// Expires sessions past their reconnect grace and detaches them from
    /// their rooms before the records are freed.
    async fn sweep_sessions(&self) {
        let expired = {
            let mut sessions = self.state.sessions.lock().await;
            let expired = sessions.expire_stale();
            sessions.cleanup_expired();
            expired
        };
        if expired.is_empty() {
            return;
        }
        let mut rooms = self.state.rooms.lock().await;
        for user_id in expired {
            rooms.detach(user_id).await;
        }
    }
}
