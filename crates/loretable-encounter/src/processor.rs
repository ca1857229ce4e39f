//! The command processor: validate, then apply, atomically.
//!
//! `apply` is a pure function — it never writes the input state. On success
//! it returns the successor `GameState` plus the events that describe the
//! transition; on failure it returns a typed [`CommandError`] and the
//! caller's state is untouched. The room store swaps the successor in, so
//! no partial mutation is ever observable, even mid-command.
//!
//! Scheduler timeouts arrive here as ordinary `SkipTurn` commands — there
//! is no timeout special case at the mutation layer.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::action::{ActionKind, TurnAction};
use crate::command::{Command, CommandContext, CommandSource};
use crate::error::CommandError;
use crate::event::RoomEvent;
use crate::ids::EntityId;
use crate::state::{
    ChatChannel, ChatMessage, ChatMessageId, GameState, InteractionStatus, ParticipantState,
    TurnOutcome, TurnRecord,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for the encounter state machine.
#[derive(Debug, Clone)]
pub struct EncounterConfig {
    /// How long the active participant has before their turn is forfeited.
    pub turn_budget: Duration,
}

impl Default for EncounterConfig {
    fn default() -> Self {
        Self {
            turn_budget: Duration::from_secs(90),
        }
    }
}

impl EncounterConfig {
    /// The forfeiture deadline for a turn starting at `now`.
    pub fn deadline_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + TimeDelta::milliseconds(self.turn_budget.as_millis() as i64)
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Per-turn snapshots of the participant table, kept in lockstep with
/// `turnHistory` (snapshot `i` is the table right after record `i` was
/// appended). Rollback restores from here instead of replaying action
/// effects, because effect interpretation belongs to the rules engine,
/// not this one.
#[derive(Debug, Clone, Default)]
pub struct CheckpointLog {
    snapshots: Vec<BTreeMap<EntityId, ParticipantState>>,
}

impl CheckpointLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, snapshot: BTreeMap<EntityId, ParticipantState>) {
        self.snapshots.push(snapshot);
    }

    pub fn truncate(&mut self, len: usize) {
        self.snapshots.truncate(len);
    }

    pub fn at(&self, index: usize) -> Option<&BTreeMap<EntityId, ParticipantState>> {
        self.snapshots.get(index)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// What the store should do to its checkpoint log after a successful apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointAction {
    /// Nothing — the command did not finish a turn.
    Keep,
    /// Snapshot the new participant table (a turn was appended).
    Push,
    /// Drop snapshots past `len` (history was rolled back).
    TruncateTo(usize),
}

/// A successful command application.
#[derive(Debug, Clone)]
pub struct Applied {
    pub state: GameState,
    pub events: Vec<RoomEvent>,
    pub checkpoint: CheckpointAction,
}

// ---------------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------------

/// Validates and applies one command against `state`.
pub fn apply(
    state: &GameState,
    checkpoints: &CheckpointLog,
    ctx: &CommandContext,
    command: &Command,
    now: DateTime<Utc>,
    config: &EncounterConfig,
) -> Result<Applied, CommandError> {
    match command {
        Command::Join { entry, participant } => apply_join(state, ctx, entry, participant, now),
        Command::Leave { entity_id } => apply_leave(state, *entity_id, now),
        Command::Start => apply_start(state, ctx, now, config),
        Command::TakeTurn { action } => apply_take_turn(state, ctx, action, now, config),
        Command::SkipTurn { reason } => apply_skip_turn(state, ctx, reason, now, config),
        Command::SendChat {
            content,
            channel,
            recipients,
            entity_id,
        } => apply_send_chat(state, ctx, content, *channel, recipients, *entity_id, now),
        Command::Pause { reason } => apply_pause(state, ctx, reason, now, config),
        Command::Resume => apply_resume(state, ctx, now),
        Command::Rollback {
            turn_number,
            round_number,
        } => apply_rollback(state, checkpoints, ctx, *turn_number, *round_number, now, config),
        Command::UpdateInitiative { order } => {
            apply_update_initiative(state, ctx, order, now, config)
        }
        Command::End => apply_end(state, ctx, now),
    }
}

fn require_dm(ctx: &CommandContext, what: &str) -> Result<(), CommandError> {
    if ctx.role.is_dm() {
        Ok(())
    } else {
        Err(CommandError::forbidden(format!("{what} is DM-only")))
    }
}

fn apply_join(
    state: &GameState,
    ctx: &CommandContext,
    entry: &crate::state::InitiativeEntry,
    participant: &ParticipantState,
    now: DateTime<Utc>,
) -> Result<Applied, CommandError> {
    if state.status == InteractionStatus::Completed {
        return Err(CommandError::InvalidTransition {
            from: state.status,
            attempted: "join a completed encounter".into(),
        });
    }

    let mut next = state.clone();
    next.admit_participant(entry.clone(), participant.clone(), now);
    if ctx.role.is_dm() && next.dm_user_id.is_none() {
        next.dm_user_id = Some(ctx.user_id);
    }
    next.touch(now);

    let event = RoomEvent::ParticipantJoined {
        entry: entry.clone(),
        participant: next
            .participants
            .get(&entry.entity_id)
            .cloned()
            .unwrap_or_else(|| participant.clone()),
        dm_user_id: next.dm_user_id,
        at: now,
    };
    Ok(Applied {
        state: next,
        events: vec![event],
        checkpoint: CheckpointAction::Keep,
    })
}

fn apply_leave(
    state: &GameState,
    entity_id: EntityId,
    now: DateTime<Utc>,
) -> Result<Applied, CommandError> {
    if !state.participants.contains_key(&entity_id) {
        return Err(CommandError::not_found(format!("entity {entity_id}")));
    }
    // Presence only: the participant stays so they can reconnect.
    let mut next = state.clone();
    next.touch(now);
    Ok(Applied {
        state: next,
        events: vec![RoomEvent::ParticipantLeft { entity_id, at: now }],
        checkpoint: CheckpointAction::Keep,
    })
}

fn apply_start(
    state: &GameState,
    ctx: &CommandContext,
    now: DateTime<Utc>,
    config: &EncounterConfig,
) -> Result<Applied, CommandError> {
    require_dm(ctx, "starting the encounter")?;
    if state.status != InteractionStatus::Waiting {
        return Err(CommandError::InvalidTransition {
            from: state.status,
            attempted: "start".into(),
        });
    }
    if state.initiative_order.is_empty() {
        return Err(CommandError::invalid_action(
            "cannot start with an empty initiative order",
        ));
    }

    let mut next = state.clone();
    next.status = InteractionStatus::Active;
    let deadline = config.deadline_after(now);
    next.begin_turn(0, next.round_number, Some(deadline), now);

    let first = next
        .active_entry()
        .expect("initiative order is non-empty")
        .entity_id;
    Ok(Applied {
        state: next,
        events: vec![
            RoomEvent::InteractionStarted { at: now },
            RoomEvent::TurnStarted {
                entity_id: first,
                turn_index: 0,
                round_number: state.round_number,
                deadline: Some(deadline),
                started_at: now,
                resync: None,
            },
        ],
        checkpoint: CheckpointAction::Keep,
    })
}

/// Shared permission check for acting on the current turn: the entity must
/// be the active one, and the caller must be entitled to act for it.
fn check_turn_authority(
    state: &GameState,
    ctx: &CommandContext,
    actor: EntityId,
) -> Result<(), CommandError> {
    let active = state.active_entry();
    let expected = active.map(|e| e.entity_id);
    if expected != Some(actor) {
        return Err(CommandError::NotYourTurn { actor, expected });
    }
    if ctx.source == CommandSource::Scheduler || ctx.role.is_dm() {
        return Ok(());
    }
    let owner = active.and_then(|e| e.owner_user_id);
    if owner != Some(ctx.user_id) {
        return Err(CommandError::forbidden(format!(
            "{} does not act for {actor}",
            ctx.user_id
        )));
    }
    Ok(())
}

fn apply_take_turn(
    state: &GameState,
    ctx: &CommandContext,
    action: &TurnAction,
    now: DateTime<Utc>,
    config: &EncounterConfig,
) -> Result<Applied, CommandError> {
    if !state.status.accepts_turns() {
        return Err(CommandError::InvalidTransition {
            from: state.status,
            attempted: "take a turn".into(),
        });
    }
    check_turn_authority(state, ctx, action.actor_entity_id)?;

    let actor = state
        .participants
        .get(&action.actor_entity_id)
        .ok_or_else(|| CommandError::not_found(format!("entity {}", action.actor_entity_id)))?;

    if !actor.available_actions.contains(&action.kind) {
        return Err(CommandError::invalid_action(format!(
            "{} is not available to {}",
            action.kind, actor.name
        )));
    }
    if let Some(missing) = action.missing_operand() {
        return Err(CommandError::invalid_action(format!(
            "{} requires a {missing}",
            action.kind
        )));
    }
    if let Some(target) = action.target {
        if !state.participants.contains_key(&target) {
            return Err(CommandError::not_found(format!("target {target}")));
        }
    }
    if action.kind == ActionKind::UseItem {
        let item = action.item.as_ref().expect("checked by missing_operand");
        if !actor.inventory.contains(item) {
            return Err(CommandError::invalid_action(format!(
                "{} does not hold {}",
                actor.name, item.0
            )));
        }
    }

    // All validation passed — build the successor state.
    let mut next = state.clone();
    apply_action_effects(&mut next, action);

    let record = TurnRecord {
        actor_entity_id: action.actor_entity_id,
        turn_number: next.turn_history.len() as u32 + 1,
        round_number: next.round_number,
        actions: vec![action.clone()],
        started_at: next.turn_started_at.unwrap_or(now),
        ended_at: Some(now),
        outcome: TurnOutcome::Completed,
    };
    next.record_turn(record.clone());
    let started = advance_turn(&mut next, now, config);

    Ok(Applied {
        state: next,
        events: vec![RoomEvent::TurnCompleted { record }, started],
        checkpoint: CheckpointAction::Push,
    })
}

/// The minimal structural effect interpreter. A rules engine plugs in here;
/// the state machine around it does not change.
///
/// Also called by the event fold when replaying a `TurnCompleted` record,
/// so server and clients interpret recorded actions identically.
pub(crate) fn apply_action_effects(state: &mut GameState, action: &TurnAction) {
    match action.kind {
        ActionKind::Move => {
            if let (Some(pos), Some(actor)) = (
                action.position,
                state.participants.get_mut(&action.actor_entity_id),
            ) {
                actor.position = pos;
            }
        }
        ActionKind::UseItem => {
            if let Some(actor) = state.participants.get_mut(&action.actor_entity_id) {
                if let Some(item) = &action.item {
                    if let Some(idx) = actor.inventory.iter().position(|i| i == item) {
                        actor.inventory.remove(idx);
                    }
                }
            }
            let recipient = action.target.unwrap_or(action.actor_entity_id);
            apply_hp_params(state, action, recipient);
        }
        ActionKind::Attack | ActionKind::Cast => {
            if let Some(target) = action.target {
                apply_hp_params(state, action, target);
            }
        }
        ActionKind::Interact | ActionKind::End => {}
    }
}

fn apply_hp_params(state: &mut GameState, action: &TurnAction, recipient: EntityId) {
    let Some(p) = state.participants.get_mut(&recipient) else {
        return;
    };
    if let Some(damage) = action.effect_param("damage") {
        p.apply_damage(damage);
    }
    if let Some(heal) = action.effect_param("heal") {
        p.heal(heal);
    }
}

/// Advances to the next initiative slot and returns the `TurnStarted` event.
fn advance_turn(state: &mut GameState, now: DateTime<Utc>, config: &EncounterConfig) -> RoomEvent {
    let (next_index, next_round) = state.turn_after(state.current_turn_index);
    let deadline = config.deadline_after(now);
    state.begin_turn(next_index, next_round, Some(deadline), now);
    let entity_id = state
        .active_entry()
        .expect("advance only runs with a non-empty order")
        .entity_id;
    RoomEvent::TurnStarted {
        entity_id,
        turn_index: next_index,
        round_number: next_round,
        deadline: Some(deadline),
        started_at: now,
        resync: None,
    }
}

fn apply_skip_turn(
    state: &GameState,
    ctx: &CommandContext,
    reason: &str,
    now: DateTime<Utc>,
    config: &EncounterConfig,
) -> Result<Applied, CommandError> {
    if !state.status.accepts_turns() {
        return Err(CommandError::InvalidTransition {
            from: state.status,
            attempted: "skip a turn".into(),
        });
    }
    let active = state
        .active_entry()
        .ok_or_else(|| CommandError::not_found("active turn"))?
        .entity_id;
    check_turn_authority(state, ctx, active)?;

    let outcome = match ctx.source {
        CommandSource::Scheduler => TurnOutcome::TimedOut,
        CommandSource::Client => TurnOutcome::Skipped,
    };

    let mut next = state.clone();
    let record = TurnRecord {
        actor_entity_id: active,
        turn_number: next.turn_history.len() as u32 + 1,
        round_number: next.round_number,
        actions: Vec::new(),
        started_at: next.turn_started_at.unwrap_or(now),
        ended_at: Some(now),
        outcome,
    };
    next.record_turn(record.clone());
    let started = advance_turn(&mut next, now, config);

    Ok(Applied {
        state: next,
        events: vec![
            RoomEvent::TurnSkipped {
                record,
                reason: reason.to_string(),
            },
            started,
        ],
        checkpoint: CheckpointAction::Push,
    })
}

fn apply_send_chat(
    state: &GameState,
    ctx: &CommandContext,
    content: &str,
    channel: ChatChannel,
    recipients: &[crate::ids::UserId],
    entity_id: Option<EntityId>,
    now: DateTime<Utc>,
) -> Result<Applied, CommandError> {
    if state.status == InteractionStatus::Completed {
        return Err(CommandError::InvalidTransition {
            from: state.status,
            attempted: "chat in an archived encounter".into(),
        });
    }
    if content.trim().is_empty() {
        return Err(CommandError::invalid_action("empty chat message"));
    }
    match channel {
        ChatChannel::Private => {
            if recipients.is_empty() {
                return Err(CommandError::invalid_action(
                    "Private channel requires at least one recipient",
                ));
            }
        }
        ChatChannel::Dm => {
            // Sender or a recipient must be the DM; a player whispering to
            // the DM needs a DM to exist.
            let dm_involved = ctx.role.is_dm()
                || state
                    .dm_user_id
                    .is_some_and(|dm| dm == ctx.user_id || recipients.contains(&dm))
                || (recipients.is_empty() && state.dm_user_id.is_some());
            if !dm_involved {
                return Err(CommandError::invalid_action(
                    "DM channel requires the DM as sender or recipient",
                ));
            }
        }
        ChatChannel::System => {
            if ctx.source == CommandSource::Client && !ctx.role.is_dm() {
                return Err(CommandError::forbidden("System channel is engine-only"));
            }
        }
        ChatChannel::Party => {}
    }

    let mut next = state.clone();
    let message = ChatMessage {
        id: ChatMessageId::server(next.next_message_seq),
        sender_user_id: ctx.user_id,
        entity_id,
        content: content.to_string(),
        channel,
        recipients: recipients.to_vec(),
        timestamp: now,
    };
    next.append_chat(message.clone());

    Ok(Applied {
        state: next,
        events: vec![RoomEvent::ChatMessage { message }],
        checkpoint: CheckpointAction::Keep,
    })
}

fn apply_pause(
    state: &GameState,
    ctx: &CommandContext,
    reason: &str,
    now: DateTime<Utc>,
    config: &EncounterConfig,
) -> Result<Applied, CommandError> {
    require_dm(ctx, "pausing")?;
    if state.status != InteractionStatus::Active {
        return Err(CommandError::InvalidTransition {
            from: state.status,
            attempted: "pause".into(),
        });
    }

    // Capture the unspent turn time; resume restores exactly this much.
    let remaining_ms = state
        .turn_deadline
        .map(|d| (d - now).num_milliseconds().max(0) as u64)
        .unwrap_or(config.turn_budget.as_millis() as u64);

    let mut next = state.clone();
    next.status = InteractionStatus::Paused;
    next.paused_remaining_ms = Some(remaining_ms);
    next.turn_deadline = None;
    next.touch(now);

    Ok(Applied {
        state: next,
        events: vec![RoomEvent::InteractionPaused {
            reason: reason.to_string(),
            remaining_ms,
            at: now,
        }],
        checkpoint: CheckpointAction::Keep,
    })
}

fn apply_resume(
    state: &GameState,
    ctx: &CommandContext,
    now: DateTime<Utc>,
) -> Result<Applied, CommandError> {
    require_dm(ctx, "resuming")?;
    if state.status != InteractionStatus::Paused {
        return Err(CommandError::InvalidTransition {
            from: state.status,
            attempted: "resume".into(),
        });
    }

    let remaining_ms = state.paused_remaining_ms.unwrap_or(0);
    let deadline = now + TimeDelta::milliseconds(remaining_ms as i64);

    let mut next = state.clone();
    next.status = InteractionStatus::Active;
    next.turn_deadline = Some(deadline);
    next.paused_remaining_ms = None;
    next.touch(now);

    Ok(Applied {
        state: next,
        events: vec![RoomEvent::InteractionResumed { deadline, at: now }],
        checkpoint: CheckpointAction::Keep,
    })
}

fn apply_rollback(
    state: &GameState,
    checkpoints: &CheckpointLog,
    ctx: &CommandContext,
    turn_number: u32,
    round_number: u32,
    now: DateTime<Utc>,
    config: &EncounterConfig,
) -> Result<Applied, CommandError> {
    require_dm(ctx, "rollback")?;
    if !matches!(
        state.status,
        InteractionStatus::Active | InteractionStatus::Paused
    ) {
        return Err(CommandError::InvalidTransition {
            from: state.status,
            attempted: "rollback".into(),
        });
    }

    let index = state
        .turn_history
        .iter()
        .position(|r| r.turn_number == turn_number && r.round_number == round_number)
        .ok_or_else(|| {
            CommandError::not_found(format!("turn {turn_number} in round {round_number}"))
        })?;
    let snapshot = checkpoints.at(index).ok_or_else(|| {
        CommandError::not_found(format!("checkpoint for turn {turn_number}"))
    })?;

    tracing::info!(turn_number, round_number, "rolling back turn history");

    let mut next = state.clone();
    next.turn_history.truncate(index + 1);

    // Restore the participant table as it stood right after the target
    // turn. Entities that joined afterwards keep their current values —
    // there is nothing older to restore them to.
    let current = std::mem::take(&mut next.participants);
    next.participants = snapshot.clone();
    for (id, p) in current {
        next.participants.entry(id).or_insert(p);
    }

    // Recompute whose turn follows the retained log.
    let target_actor = next.turn_history[index].actor_entity_id;
    let target_round = next.turn_history[index].round_number;
    next.round_number = target_round;
    let (next_index, next_round) = match next.initiative_index_of(target_actor) {
        Some(idx) => next.turn_after(idx),
        // The actor fell out of the order (initiative was replaced since);
        // restart from the top of the following round.
        None => (0, target_round + 1),
    };
    next.status = InteractionStatus::Active;
    let deadline = config.deadline_after(now);
    next.begin_turn(next_index, next_round, Some(deadline), now);

    let entity_id = next
        .active_entry()
        .ok_or_else(|| CommandError::not_found("active turn after rollback"))?
        .entity_id;

    let event = RoomEvent::TurnStarted {
        entity_id,
        turn_index: next_index,
        round_number: next_round,
        deadline: Some(deadline),
        started_at: now,
        resync: Some(Box::new(next.clone())),
    };
    Ok(Applied {
        state: next,
        events: vec![event],
        checkpoint: CheckpointAction::TruncateTo(index + 1),
    })
}

fn apply_update_initiative(
    state: &GameState,
    ctx: &CommandContext,
    order: &[crate::state::InitiativeEntry],
    now: DateTime<Utc>,
    config: &EncounterConfig,
) -> Result<Applied, CommandError> {
    require_dm(ctx, "updating initiative")?;
    if state.status == InteractionStatus::Completed {
        return Err(CommandError::InvalidTransition {
            from: state.status,
            attempted: "update initiative".into(),
        });
    }
    if order.is_empty() {
        return Err(CommandError::invalid_action("initiative order cannot be empty"));
    }
    for entry in order {
        if !state.participants.contains_key(&entry.entity_id) {
            return Err(CommandError::not_found(format!(
                "entity {} in new initiative order",
                entry.entity_id
            )));
        }
    }

    let mut next = state.clone();
    next.replace_initiative(order.to_vec(), now);

    let mut events = vec![RoomEvent::InitiativeUpdated {
        order: next.initiative_order.clone(),
        at: now,
    }];

    if next.status == InteractionStatus::Active {
        // The turn pointer rewound to the top; the countdown restarts for
        // the new active entity.
        let deadline = config.deadline_after(now);
        next.begin_turn(0, next.round_number, Some(deadline), now);
        let entity_id = next
            .active_entry()
            .expect("order checked non-empty")
            .entity_id;
        events.push(RoomEvent::TurnStarted {
            entity_id,
            turn_index: 0,
            round_number: next.round_number,
            deadline: Some(deadline),
            started_at: now,
            resync: None,
        });
    }

    Ok(Applied {
        state: next,
        events,
        checkpoint: CheckpointAction::Keep,
    })
}

fn apply_end(
    state: &GameState,
    ctx: &CommandContext,
    now: DateTime<Utc>,
) -> Result<Applied, CommandError> {
    require_dm(ctx, "ending the encounter")?;
    if !matches!(
        state.status,
        InteractionStatus::Active | InteractionStatus::Paused
    ) {
        return Err(CommandError::InvalidTransition {
            from: state.status,
            attempted: "end".into(),
        });
    }

    let mut next = state.clone();
    next.status = InteractionStatus::Completed;
    next.turn_deadline = None;
    next.paused_remaining_ms = None;
    next.touch(now);

    Ok(Applied {
        state: next,
        events: vec![RoomEvent::InteractionCompleted { at: now }],
        checkpoint: CheckpointAction::Keep,
    })
}

// =========================================================================
// Tests
// =========================================================================
