//! Encounter state machine for Loretable's live interaction engine.
//!
//! This crate is the shared core of the synchronization protocol: the
//! `GameState` aggregate, the command processor that is the sole mutation
//! authority, and the event vocabulary with its fold. Server and clients
//! both link it — that is what makes their replicas converge.
//!
//! # Key types
//!
//! - [`GameState`] — the root aggregate, one per room
//! - [`Command`] / [`CommandContext`] — every mutation, with its authority
//! - [`processor::apply`] — validate-then-apply, atomic per command
//! - [`RoomEvent`] / [`event::fold`] — typed transitions and their replay
//! - [`CommandError`] — the typed failure vocabulary

mod action;
mod command;
mod error;
mod ids;
pub mod event;
pub mod processor;
mod state;
pub mod testutil;

pub use action::{ActionKind, TurnAction};
pub use command::{Command, CommandContext, CommandSource, Role};
pub use error::CommandError;
pub use event::RoomEvent;
pub use ids::{EntityId, RoomId, UserId};
pub use processor::{Applied, CheckpointAction, CheckpointLog, EncounterConfig};
pub use state::{
    ChatChannel, ChatMessage, ChatMessageId, EntityType, GameState, InitiativeEntry,
    InteractionStatus, ItemRef, ParticipantState, Position, StatusEffect, TurnOutcome, TurnRecord,
    TurnStatus, sort_initiative, PROVISIONAL_ID_PREFIX,
};
