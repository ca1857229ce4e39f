//! Commands: the only way state mutates.
//!
//! Every mutation of a room — player actions, DM controls, scheduler
//! timeouts, joins and leaves — is expressed as a [`Command`] carrying a
//! [`CommandContext`], so one validation-and-apply path covers them all.

use serde::{Deserialize, Serialize};

use crate::action::TurnAction;
use crate::ids::{EntityId, UserId};
use crate::state::{ChatChannel, InitiativeEntry, ParticipantState};

/// The caller's role in the room, resolved by the identity collaborator.
/// The engine trusts this boundary completely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    DungeonMaster,
    Player,
}

impl Role {
    pub fn is_dm(&self) -> bool {
        matches!(self, Self::DungeonMaster)
    }
}

/// Where a command originated. Scheduler-synthesized skips travel the same
/// path as manual commands but carry their own authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Client,
    Scheduler,
}

/// Who is asking, and with what authority.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext {
    pub user_id: UserId,
    pub role: Role,
    pub source: CommandSource,
}

impl CommandContext {
    pub fn player(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Player,
            source: CommandSource::Client,
        }
    }

    pub fn dm(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::DungeonMaster,
            source: CommandSource::Client,
        }
    }

    /// The turn scheduler's context. Carries no real user — its authority
    /// comes from `CommandSource::Scheduler`.
    pub fn scheduler() -> Self {
        Self {
            user_id: UserId(0),
            role: Role::Player,
            source: CommandSource::Scheduler,
        }
    }
}

/// One room mutation. Validated and applied atomically by the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Admit an entity into the encounter (or re-announce a rejoin).
    /// The initiative entry and participant seed come from the entity
    /// directory, not from the client.
    Join {
        entry: InitiativeEntry,
        participant: ParticipantState,
    },

    /// Presence departure. Participants stay in the state — they may
    /// reconnect mid-encounter.
    Leave { entity_id: EntityId },

    /// DM starts the encounter: `Waiting → Active`, first turn begins.
    Start,

    /// The active participant takes their turn.
    TakeTurn { action: TurnAction },

    /// Forfeit the active turn (manually, or by scheduler timeout).
    SkipTurn { reason: String },

    /// Append a chat message.
    SendChat {
        content: String,
        channel: ChatChannel,
        recipients: Vec<UserId>,
        entity_id: Option<EntityId>,
    },

    /// DM pauses: the turn countdown is suspended, not discarded.
    Pause { reason: String },

    /// DM resumes: the suspended countdown continues where it stopped.
    Resume,

    /// DM rewinds the encounter to the end of an earlier turn.
    Rollback {
        turn_number: u32,
        round_number: u32,
    },

    /// DM replaces the initiative order; the turn pointer rewinds to the
    /// top without touching the round number.
    UpdateInitiative { order: Vec<InitiativeEntry> },

    /// DM ends the encounter: the state is archived, not deleted.
    End,
}

impl Command {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "Join",
            Self::Leave { .. } => "Leave",
            Self::Start => "Start",
            Self::TakeTurn { .. } => "TakeTurn",
            Self::SkipTurn { .. } => "SkipTurn",
            Self::SendChat { .. } => "SendChat",
            Self::Pause { .. } => "Pause",
            Self::Resume => "Resume",
            Self::Rollback { .. } => "Rollback",
            Self::UpdateInitiative { .. } => "UpdateInitiative",
            Self::End => "End",
        }
    }
}
