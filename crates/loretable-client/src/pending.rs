//! The in-flight mutation table.
//!
//! Every optimistic mutation is one record: a correlation id and the local
//! transform that predicted the server's effect. The agent keeps one
//! authoritative base state (the last server-confirmed state) and derives
//! the visible mirror by replaying the table over it, in issue order.
//! Apply, revert, and commit are then three small operations:
//!
//! - **apply**: push a record, extend the chain by one transform.
//! - **revert**: drop the record, rebuild the chain — later in-flight
//!   mutations are rebased and survive untouched.
//! - **commit**: the server result replaces (full state) or patches (chat
//!   ack) the base, the record drops, later mutations rebase on top.
//!
//! This replaces the scattered per-action-revert pattern: no transform
//! ever needs a hand-written undo.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use loretable_encounter::{
    processor, ChatMessage, ChatMessageId, Command, CommandContext, EncounterConfig, GameState,
    Role, UserId,
};
use loretable_protocol::CorrelationId;

/// The local prediction of a command's effect.
///
/// Turn-shaped transforms run the real command processor against the
/// mirror — the same validation and transition rules the server will use —
/// so the prediction diverges only when the mirror itself is behind.
#[derive(Debug, Clone)]
pub enum LocalTransform {
    /// Run `command` through the processor with the local user's context.
    /// If the local mirror rejects it, the transform is a no-op and the
    /// server's answer settles the matter.
    Command(Command),

    /// Append a provisional chat message (namespaced id, no counter bump —
    /// the server assigns the real id).
    ProvisionalChat(ChatMessage),

    /// No local effect (resyncs, DM commands whose outcome is not worth
    /// predicting, e.g. rollback).
    None,
}

/// What the table needs to know about the local caller to run transforms.
#[derive(Debug, Clone)]
pub struct LocalContext {
    pub user_id: UserId,
    pub config: EncounterConfig,
}

impl LocalContext {
    /// The command context this user would have on the server, derived
    /// from the mirror (DM if the room says so).
    fn command_context(&self, state: &GameState) -> CommandContext {
        let role = if state.dm_user_id == Some(self.user_id) {
            Role::DungeonMaster
        } else {
            Role::Player
        };
        CommandContext {
            user_id: self.user_id,
            role,
            source: loretable_encounter::CommandSource::Client,
        }
    }
}

impl LocalTransform {
    /// Applies this transform to a state, yielding the predicted successor.
    pub fn apply(&self, state: &GameState, ctx: &LocalContext, now: DateTime<Utc>) -> GameState {
        match self {
            Self::None => state.clone(),
            Self::ProvisionalChat(message) => {
                let mut next = state.clone();
                next.touch(message.timestamp);
                // Deliberately not `append_chat`: the id counter belongs
                // to the server; bumping it here would desync assignment.
                next.chat_log.push(message.clone());
                next
            }
            Self::Command(command) => {
                let cmd_ctx = ctx.command_context(state);
                match processor::apply(
                    state,
                    &loretable_encounter::CheckpointLog::new(),
                    &cmd_ctx,
                    command,
                    now,
                    &ctx.config,
                ) {
                    Ok(applied) => applied.state,
                    // The mirror rejects what the server may yet accept
                    // (or vice versa); predict nothing and let the reply
                    // decide.
                    Err(_) => state.clone(),
                }
            }
        }
    }
}

/// One optimistic mutation awaiting its server verdict.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub correlation_id: CorrelationId,
    pub transform: LocalTransform,
    pub issued_at: Instant,
}

/// Ordered table of in-flight mutations.
#[derive(Debug, Default)]
pub struct InFlightTable {
    entries: Vec<PendingMutation>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, correlation_id: CorrelationId) -> bool {
        self.entries
            .iter()
            .any(|e| e.correlation_id == correlation_id)
    }

    /// Records a new in-flight mutation (most recent last).
    pub fn push(&mut self, entry: PendingMutation) {
        self.entries.push(entry);
    }

    /// Removes one record, if present.
    pub fn remove(&mut self, correlation_id: CorrelationId) -> Option<PendingMutation> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.correlation_id == correlation_id)?;
        Some(self.entries.remove(idx))
    }

    /// Drops every record, returning them (used on disconnect and leave,
    /// where pending mutations are reverted, not silently lost).
    pub fn drain(&mut self) -> Vec<PendingMutation> {
        std::mem::take(&mut self.entries)
    }

    /// Records whose delivery timeout has elapsed.
    pub fn timed_out(&self, now: Instant, timeout: std::time::Duration) -> Vec<CorrelationId> {
        self.entries
            .iter()
            .filter(|e| now.duration_since(e.issued_at) >= timeout)
            .map(|e| e.correlation_id)
            .collect()
    }

    /// Rebuilds the mirror: the base (authoritative) state with every
    /// in-flight transform replayed over it in issue order.
    pub fn rebase(&self, base: &GameState, ctx: &LocalContext, now: DateTime<Utc>) -> GameState {
        let mut state = base.clone();
        for entry in &self.entries {
            state = entry.transform.apply(&state, ctx, now);
        }
        state
    }
}

/// Replaces a provisional chat entry with the server's authoritative
/// message, in place — the position in the ordered log is preserved.
pub fn reconcile_chat(state: &mut GameState, provisional_id: &ChatMessageId, message: ChatMessage) {
    // Already present: a broadcast fold beat the reply here (late reply
    // after a delivery timeout). Nothing to do.
    if state.chat_log.iter().any(|m| m.id == message.id) {
        return;
    }
    if let Some(slot) = state.chat_log.iter_mut().find(|m| m.id == *provisional_id) {
        *slot = message;
    } else {
        // Nothing provisional to replace (e.g. reconciling the base state,
        // which never saw the optimistic entry): append authoritatively.
        state.chat_log.push(message);
    }
    state.next_message_seq = state.next_message_seq.max(next_seq_after(state));
}

fn next_seq_after(state: &GameState) -> u64 {
    state
        .chat_log
        .iter()
        .filter_map(|m| m.id.0.strip_prefix("msg-"))
        .filter_map(|n| n.parse::<u64>().ok())
        .max()
        .map(|n| n + 1)
        .unwrap_or(1)
}

// =========================================================================
// Tests
// =========================================================================
