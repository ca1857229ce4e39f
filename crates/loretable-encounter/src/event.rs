//! Room events and the shared fold.
//!
//! [`RoomEvent`] is the closed vocabulary of everything that can happen in
//! a room. Matches over it are exhaustive everywhere — adding a variant is
//! a compile error at every consumer, which is the point: no event kind can
//! be silently ignored.
//!
//! [`fold`] applies an event to a `GameState` using the same transition
//! helpers the command processor uses. The engine guarantees (and the
//! processor tests assert) that folding a command's emitted events over the
//! pre-state reproduces the post-state exactly; this is what lets clients
//! converge by folding broadcasts instead of polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EntityId, UserId};
use crate::state::{
    ChatMessage, GameState, InitiativeEntry, InteractionStatus, ParticipantState, TurnRecord,
};

/// Everything the broadcaster can tell subscribers about a room.
///
/// Each variant carries the timestamp the mutation used (`at` or an
/// embedded record/message timestamp) so folding reproduces
/// `lastModifiedAt` exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RoomEvent {
    ParticipantJoined {
        entry: InitiativeEntry,
        participant: ParticipantState,
        /// The room's DM after this event (authoritative, may be unchanged).
        dm_user_id: Option<UserId>,
        at: DateTime<Utc>,
    },
    ParticipantLeft {
        entity_id: EntityId,
        at: DateTime<Utc>,
    },
    InteractionStarted {
        at: DateTime<Utc>,
    },
    TurnStarted {
        entity_id: EntityId,
        turn_index: usize,
        round_number: u32,
        /// Server-supplied forfeiture deadline; clients derive their
        /// countdown from this, never from an independent timer.
        deadline: Option<DateTime<Utc>>,
        started_at: DateTime<Utc>,
        /// Full authoritative state, populated only on the rollback path
        /// where incremental folding is not meaningful. Replaces the
        /// mirror wholesale.
        resync: Option<Box<GameState>>,
    },
    TurnCompleted {
        record: TurnRecord,
    },
    TurnSkipped {
        record: TurnRecord,
        reason: String,
    },
    ChatMessage {
        message: ChatMessage,
    },
    InitiativeUpdated {
        order: Vec<InitiativeEntry>,
        at: DateTime<Utc>,
    },
    InteractionPaused {
        reason: String,
        /// Turn time left when the pause landed; resume restores exactly
        /// this much.
        remaining_ms: u64,
        at: DateTime<Utc>,
    },
    InteractionResumed {
        deadline: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    InteractionCompleted {
        at: DateTime<Utc>,
    },
    /// Room-level fault surfaced to one or all subscribers (e.g. a replay
    /// request that fell off the buffer). Never mutates state.
    Error {
        code: u16,
        message: String,
    },
}

impl RoomEvent {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ParticipantJoined { .. } => "ParticipantJoined",
            Self::ParticipantLeft { .. } => "ParticipantLeft",
            Self::InteractionStarted { .. } => "InteractionStarted",
            Self::TurnStarted { .. } => "TurnStarted",
            Self::TurnCompleted { .. } => "TurnCompleted",
            Self::TurnSkipped { .. } => "TurnSkipped",
            Self::ChatMessage { .. } => "ChatMessage",
            Self::InitiativeUpdated { .. } => "InitiativeUpdated",
            Self::InteractionPaused { .. } => "InteractionPaused",
            Self::InteractionResumed { .. } => "InteractionResumed",
            Self::InteractionCompleted { .. } => "InteractionCompleted",
            Self::Error { .. } => "Error",
        }
    }
}

/// Applies one event to a state, producing the successor state.
///
/// This is the client's half of the synchronization contract: the same
/// transition rules as the command processor, driven by the event stream.
pub fn fold(state: &GameState, event: &RoomEvent) -> GameState {
    let mut next = state.clone();
    match event {
        RoomEvent::ParticipantJoined {
            entry,
            participant,
            dm_user_id,
            at,
        } => {
            next.admit_participant(entry.clone(), participant.clone(), *at);
            next.dm_user_id = *dm_user_id;
            next.touch(*at);
        }
        RoomEvent::ParticipantLeft { at, .. } => {
            // Presence only: the participant stays in the state so they can
            // reconnect mid-encounter.
            next.touch(*at);
        }
        RoomEvent::InteractionStarted { at } => {
            next.status = InteractionStatus::Active;
            next.touch(*at);
        }
        RoomEvent::TurnStarted {
            turn_index,
            round_number,
            deadline,
            started_at,
            resync,
            ..
        } => {
            if let Some(full) = resync {
                return (**full).clone();
            }
            next.begin_turn(*turn_index, *round_number, *deadline, *started_at);
        }
        RoomEvent::TurnCompleted { record } => {
            // Replay the recorded actions' structural effects before
            // appending, exactly as the processor applied them.
            for action in &record.actions {
                crate::processor::apply_action_effects(&mut next, action);
            }
            next.record_turn(record.clone());
        }
        RoomEvent::TurnSkipped { record, .. } => {
            next.record_turn(record.clone());
        }
        RoomEvent::ChatMessage { message } => {
            next.append_chat(message.clone());
        }
        RoomEvent::InitiativeUpdated { order, at } => {
            next.replace_initiative(order.clone(), *at);
        }
        RoomEvent::InteractionPaused {
            remaining_ms, at, ..
        } => {
            next.status = InteractionStatus::Paused;
            next.paused_remaining_ms = Some(*remaining_ms);
            next.turn_deadline = None;
            next.touch(*at);
        }
        RoomEvent::InteractionResumed { deadline, at } => {
            next.status = InteractionStatus::Active;
            next.turn_deadline = Some(*deadline);
            next.paused_remaining_ms = None;
            next.touch(*at);
        }
        RoomEvent::InteractionCompleted { at } => {
            next.status = InteractionStatus::Completed;
            next.turn_deadline = None;
            next.paused_remaining_ms = None;
            next.touch(*at);
        }
        RoomEvent::Error { .. } => {}
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RoomId;
    use crate::testutil::{entry, participant, ts};

    #[test]
    fn test_room_event_serializes_with_type_tag() {
        let event = RoomEvent::InteractionStarted { at: ts(5) };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "InteractionStarted");
    }

    #[test]
    fn test_fold_participant_joined_inserts_once() {
        let state = GameState::new(RoomId(1), ts(0));
        let event = RoomEvent::ParticipantJoined {
            entry: entry(1, 14, Some(UserId(7))),
            participant: participant(1, 20),
            dm_user_id: Some(UserId(9)),
            at: ts(1),
        };
        let once = fold(&state, &event);
        // At-least-once delivery: a duplicate join event must be harmless.
        let twice = fold(&once, &event);

        assert_eq!(once.participants.len(), 1);
        assert_eq!(once.dm_user_id, Some(UserId(9)));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_fold_turn_started_with_resync_replaces_wholesale() {
        let stale = GameState::new(RoomId(1), ts(0));
        let mut authoritative = GameState::new(RoomId(1), ts(50));
        authoritative.round_number = 4;
        let event = RoomEvent::TurnStarted {
            entity_id: EntityId(1),
            turn_index: 0,
            round_number: 4,
            deadline: None,
            started_at: ts(50),
            resync: Some(Box::new(authoritative.clone())),
        };

        assert_eq!(fold(&stale, &event), authoritative);
    }

    #[test]
    fn test_fold_pause_then_resume_restores_deadline() {
        let mut state = GameState::new(RoomId(1), ts(0));
        state.status = InteractionStatus::Active;
        state.turn_deadline = Some(ts(90));

        let paused = fold(
            &state,
            &RoomEvent::InteractionPaused {
                reason: "bio break".into(),
                remaining_ms: 60_000,
                at: ts(30),
            },
        );
        assert_eq!(paused.status, InteractionStatus::Paused);
        assert_eq!(paused.turn_deadline, None);
        assert_eq!(paused.paused_remaining_ms, Some(60_000));

        let resumed = fold(
            &paused,
            &RoomEvent::InteractionResumed {
                deadline: ts(160),
                at: ts(100),
            },
        );
        assert_eq!(resumed.status, InteractionStatus::Active);
        assert_eq!(resumed.turn_deadline, Some(ts(160)));
        assert_eq!(resumed.paused_remaining_ms, None);
    }

    #[test]
    fn test_fold_error_leaves_state_untouched() {
        let state = GameState::new(RoomId(1), ts(0));
        let folded = fold(
            &state,
            &RoomEvent::Error {
                code: 410,
                message: "replay window exceeded".into(),
            },
        );
        assert_eq!(state, folded);
    }
}
