//! The room state store: one room's authoritative `GameState`.
//!
//! Owned exclusively by the room actor task — that ownership, not a lock,
//! is what serializes writers. `apply` delegates validation to the
//! processor and swaps the successor state in only on success, so a failed
//! command leaves no trace.

use chrono::{DateTime, Utc};

use loretable_encounter::{
    processor, CheckpointAction, CheckpointLog, Command, CommandContext, CommandError,
    EncounterConfig, GameState, RoomEvent, RoomId,
};

/// Authoritative state plus the rollback checkpoints that shadow it.
pub struct RoomStore {
    state: GameState,
    checkpoints: CheckpointLog,
    config: EncounterConfig,
}

impl RoomStore {
    pub fn new(room_id: RoomId, now: DateTime<Utc>, config: EncounterConfig) -> Self {
        Self {
            state: GameState::new(room_id, now),
            checkpoints: CheckpointLog::new(),
            config,
        }
    }

    /// Read-only view of the current state.
    pub fn state(&self) -> &GameState {
        &self.state
    }

    /// A deep copy for replies and resyncs.
    pub fn snapshot(&self) -> GameState {
        self.state.clone()
    }

    pub fn config(&self) -> &EncounterConfig {
        &self.config
    }

    /// Validates and applies one command. On success the store now holds
    /// the successor state and the checkpoint log has been maintained; on
    /// failure nothing changed.
    pub fn apply(
        &mut self,
        ctx: &CommandContext,
        command: &Command,
        now: DateTime<Utc>,
    ) -> Result<(GameState, Vec<RoomEvent>), CommandError> {
        let applied = processor::apply(&self.state, &self.checkpoints, ctx, command, now, &self.config)?;

        match applied.checkpoint {
            CheckpointAction::Keep => {}
            CheckpointAction::Push => self.checkpoints.push(applied.state.participants.clone()),
            CheckpointAction::TruncateTo(len) => self.checkpoints.truncate(len),
        }
        self.state = applied.state.clone();
        Ok((applied.state, applied.events))
    }
}
