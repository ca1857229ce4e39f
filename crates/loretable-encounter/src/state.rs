//! The `GameState` aggregate: everything one room synchronizes.
//!
//! `GameState` is an immutable-by-convention value. The command processor
//! computes a successor from a clone and the room store swaps it in only on
//! success, so no half-applied state is ever observable. The transition
//! helpers on `GameState` are shared by three callers that must agree
//! exactly: the server-side processor, the client-side event fold, and the
//! client's optimistic transforms. Keeping them in one place is what makes
//! every replica converge.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::{ActionKind, TurnAction};
use crate::ids::{EntityId, RoomId, UserId};

/// Prefix that namespaces client-generated provisional chat ids so they can
/// never be confused with server-assigned ids during reconciliation.
pub const PROVISIONAL_ID_PREFIX: &str = "pending-";

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of the whole encounter.
///
/// ```text
/// Waiting ──(DM start)──→ Active ⇄ Paused
///                            │        │
///                            └──(DM end)──→ Completed
/// ```
///
/// `Completed` states are archived, never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionStatus {
    Waiting,
    Active,
    Paused,
    Completed,
}

impl InteractionStatus {
    /// Whether turn-taking commands are accepted in this status.
    pub fn accepts_turns(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for InteractionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "Waiting"),
            Self::Active => write!(f, "Active"),
            Self::Paused => write!(f, "Paused"),
            Self::Completed => write!(f, "Completed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Initiative
// ---------------------------------------------------------------------------

/// What kind of entity occupies an initiative slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityType {
    PlayerCharacter,
    Npc,
    Monster,
}

/// One slot in the initiative order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiativeEntry {
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub initiative_score: i32,
    /// The user who acts for this entity. `None` for DM-driven NPCs and
    /// monsters (the DM acts for them).
    pub owner_user_id: Option<UserId>,
}

/// Sorts initiative entries into turn order: descending score, ties broken
/// by insertion order (the sort is stable, so earlier-inserted entries win).
///
/// Every replica — server and all clients — must reproduce this order
/// identically, which is why it lives here and nowhere else.
pub fn sort_initiative(entries: &mut [InitiativeEntry]) {
    entries.sort_by(|a, b| b.initiative_score.cmp(&a.initiative_score));
}

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

/// A grid position. Map semantics (terrain, pathfinding) are out of scope;
/// the engine only synchronizes the coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

/// A condition on a participant (e.g. "poisoned"). Opaque to the engine —
/// the rules content that grants or interprets conditions lives elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusEffect(pub String);

/// A reference to an inventory item, by backend identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemRef(pub String);

/// Where a participant stands in the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnStatus {
    Waiting,
    Active,
    Completed,
    Skipped,
}

/// Mutable per-entity state, owned by the room store and mutated only
/// through the command processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub entity_id: EntityId,
    pub name: String,
    pub current_hp: i32,
    pub max_hp: i32,
    pub position: Position,
    pub active_conditions: BTreeSet<StatusEffect>,
    pub inventory: Vec<ItemRef>,
    pub available_actions: BTreeSet<ActionKind>,
    pub turn_status: TurnStatus,
}

impl ParticipantState {
    /// Sets HP, clamped to `[0, max_hp]`. Every HP mutation funnels through
    /// here — the clamping invariant has no other enforcement point.
    pub fn set_hp(&mut self, hp: i32) {
        self.current_hp = hp.clamp(0, self.max_hp);
    }

    /// Applies `amount` damage (clamped at 0).
    pub fn apply_damage(&mut self, amount: i32) {
        self.set_hp(self.current_hp.saturating_sub(amount));
    }

    /// Heals `amount` (clamped at `max_hp`).
    pub fn heal(&mut self, amount: i32) {
        self.set_hp(self.current_hp.saturating_add(amount));
    }
}

// ---------------------------------------------------------------------------
// Turn history
// ---------------------------------------------------------------------------

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnOutcome {
    Completed,
    Skipped,
    TimedOut,
}

/// An immutable log entry: one finished turn. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub actor_entity_id: EntityId,
    /// Global turn counter since room creation, starting at 1.
    pub turn_number: u32,
    pub round_number: u32,
    pub actions: Vec<TurnAction>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: TurnOutcome,
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A chat message id. Server-assigned ids look like `msg-42`; provisional
/// client ids carry [`PROVISIONAL_ID_PREFIX`] until reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatMessageId(pub String);

impl ChatMessageId {
    /// The authoritative id for the `n`th message of a room.
    pub fn server(n: u64) -> Self {
        Self(format!("msg-{n}"))
    }

    /// Whether this id is a client-generated provisional id awaiting
    /// reconciliation.
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_ID_PREFIX)
    }
}

impl std::fmt::Display for ChatMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who a chat message is visible to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatChannel {
    /// Everyone in the room.
    Party,
    /// Sender plus the DM.
    Dm,
    /// Sender plus an explicit recipient list.
    Private,
    /// Engine-generated notices (joins, pauses, timeouts).
    System,
}

/// One chat log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: ChatMessageId,
    pub sender_user_id: UserId,
    /// The in-world speaker, when the sender speaks as a character.
    pub entity_id: Option<EntityId>,
    pub content: String,
    pub channel: ChatChannel,
    /// Non-empty exactly when `channel` is `Private`.
    pub recipients: Vec<UserId>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// GameState
// ---------------------------------------------------------------------------

/// The root aggregate: everything one room synchronizes.
///
/// Maps are `BTreeMap` so that serialization and deep-equality comparisons
/// are deterministic across replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub room_id: RoomId,
    pub status: InteractionStatus,
    /// The DM for this room, learned when a DM-role user joins. Used for
    /// DM-channel chat validation and privileged-command checks.
    pub dm_user_id: Option<UserId>,
    pub initiative_order: Vec<InitiativeEntry>,
    pub current_turn_index: usize,
    pub round_number: u32,
    pub participants: BTreeMap<EntityId, ParticipantState>,
    pub turn_history: Vec<TurnRecord>,
    pub chat_log: Vec<ChatMessage>,
    /// Counter backing server-assigned chat ids. Carried in the state so
    /// that event folding reproduces id assignment on every replica.
    pub next_message_seq: u64,
    /// When the active turn forfeits, while `status` is `Active`.
    pub turn_deadline: Option<DateTime<Utc>>,
    /// Remaining turn time captured by a pause, while `status` is `Paused`.
    pub paused_remaining_ms: Option<u64>,
    /// When the active turn began.
    pub turn_started_at: Option<DateTime<Utc>>,
    /// Monotonically non-decreasing; staleness checks compare against it.
    pub last_modified_at: DateTime<Utc>,
}

impl GameState {
    /// A fresh room in `Waiting`, with nothing rolled yet.
    pub fn new(room_id: RoomId, now: DateTime<Utc>) -> Self {
        Self {
            room_id,
            status: InteractionStatus::Waiting,
            dm_user_id: None,
            initiative_order: Vec::new(),
            current_turn_index: 0,
            round_number: 1,
            participants: BTreeMap::new(),
            turn_history: Vec::new(),
            chat_log: Vec::new(),
            next_message_seq: 1,
            turn_deadline: None,
            paused_remaining_ms: None,
            turn_started_at: None,
            last_modified_at: now,
        }
    }

    /// The initiative entry whose turn it is.
    pub fn active_entry(&self) -> Option<&InitiativeEntry> {
        self.initiative_order.get(self.current_turn_index)
    }

    /// The participant whose turn it is.
    pub fn active_participant(&self) -> Option<&ParticipantState> {
        let entry = self.active_entry()?;
        self.participants.get(&entry.entity_id)
    }

    /// Position of an entity in the initiative order.
    pub fn initiative_index_of(&self, entity_id: EntityId) -> Option<usize> {
        self.initiative_order
            .iter()
            .position(|e| e.entity_id == entity_id)
    }

    /// The slot after `index`, with the round it lands in. Wrapping from the
    /// last slot to the first increments the round.
    pub fn turn_after(&self, index: usize) -> (usize, u32) {
        let len = self.initiative_order.len().max(1);
        let next = (index + 1) % len;
        if next == 0 {
            (0, self.round_number + 1)
        } else {
            (next, self.round_number)
        }
    }

    /// Advances `last_modified_at`, never backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_modified_at {
            self.last_modified_at = now;
        }
    }

    // -- Shared transitions -------------------------------------------------
    //
    // Called by the command processor, the event fold, and the client's
    // optimistic transforms. Divergence here is divergence everywhere.

    /// Makes the entry at `index` the active turn.
    ///
    /// Entering a new round resets every non-active participant to
    /// `Waiting` first, so the at-most-one-active invariant holds across
    /// the wrap.
    pub fn begin_turn(
        &mut self,
        index: usize,
        round: u32,
        deadline: Option<DateTime<Utc>>,
        started_at: DateTime<Utc>,
    ) {
        if round > self.round_number {
            for p in self.participants.values_mut() {
                p.turn_status = TurnStatus::Waiting;
            }
        } else {
            // Turn moved without a round wrap (initiative replaced, turn
            // rolled back): demote whoever was active so at most one
            // participant ever holds `Active`.
            for p in self.participants.values_mut() {
                if p.turn_status == TurnStatus::Active {
                    p.turn_status = TurnStatus::Waiting;
                }
            }
        }
        self.current_turn_index = index;
        self.round_number = round;
        if let Some(entry) = self.initiative_order.get(index) {
            let id = entry.entity_id;
            if let Some(p) = self.participants.get_mut(&id) {
                p.turn_status = TurnStatus::Active;
            }
        }
        self.turn_deadline = deadline;
        self.paused_remaining_ms = None;
        self.turn_started_at = Some(started_at);
        self.touch(started_at);
    }

    /// Appends a finished turn to the immutable log and marks the actor.
    pub fn record_turn(&mut self, record: TurnRecord) {
        if let Some(p) = self.participants.get_mut(&record.actor_entity_id) {
            p.turn_status = match record.outcome {
                TurnOutcome::Completed => TurnStatus::Completed,
                TurnOutcome::Skipped | TurnOutcome::TimedOut => TurnStatus::Skipped,
            };
        }
        if let Some(at) = record.ended_at {
            self.touch(at);
        }
        self.turn_history.push(record);
    }

    /// Appends a chat message with a server-assigned id and advances the id
    /// counter so every replica assigns the next id identically.
    pub fn append_chat(&mut self, message: ChatMessage) {
        self.touch(message.timestamp);
        self.next_message_seq += 1;
        self.chat_log.push(message);
    }

    /// Inserts (or re-announces) a participant and their initiative slot.
    ///
    /// Idempotent: a rejoin changes nothing, so at-least-once delivery of
    /// join events is harmless. Re-sorting preserves whichever entity was
    /// active by recomputing the index afterwards.
    pub fn admit_participant(
        &mut self,
        entry: InitiativeEntry,
        participant: ParticipantState,
        now: DateTime<Utc>,
    ) {
        if self.participants.contains_key(&entry.entity_id) {
            return;
        }
        let active = self.active_entry().map(|e| e.entity_id);
        self.participants.insert(entry.entity_id, participant);
        self.initiative_order.push(entry);
        sort_initiative(&mut self.initiative_order);
        if let Some(active_id) = active {
            if let Some(idx) = self.initiative_index_of(active_id) {
                self.current_turn_index = idx;
            }
        }
        self.touch(now);
    }

    /// Replaces the initiative order wholesale and rewinds the turn pointer
    /// to the top. The round number is untouched.
    pub fn replace_initiative(&mut self, mut order: Vec<InitiativeEntry>, now: DateTime<Utc>) {
        sort_initiative(&mut order);
        self.initiative_order = order;
        self.current_turn_index = 0;
        self.touch(now);
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{entry, participant, ts};

    #[test]
    fn test_sort_initiative_orders_by_descending_score() {
        let mut entries = vec![entry(1, 12, None), entry(2, 18, None), entry(3, 3, None)];
        sort_initiative(&mut entries);
        let ids: Vec<u64> = entries.iter().map(|e| e.entity_id.0).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn test_sort_initiative_ties_keep_insertion_order() {
        // Stable sort: first inserted wins the tie. Every client must
        // reproduce this order, so it cannot depend on anything but the
        // input sequence.
        let mut entries = vec![entry(5, 10, None), entry(9, 10, None), entry(1, 10, None)];
        sort_initiative(&mut entries);
        let ids: Vec<u64> = entries.iter().map(|e| e.entity_id.0).collect();
        assert_eq!(ids, vec![5, 9, 1]);
    }

    #[test]
    fn test_set_hp_clamps_to_bounds() {
        let mut p = participant(1, 20);
        p.set_hp(999);
        assert_eq!(p.current_hp, 20);
        p.set_hp(-5);
        assert_eq!(p.current_hp, 0);
    }

    #[test]
    fn test_apply_damage_never_goes_below_zero() {
        let mut p = participant(1, 20);
        p.apply_damage(12);
        assert_eq!(p.current_hp, 8);
        p.apply_damage(100);
        assert_eq!(p.current_hp, 0);
    }

    #[test]
    fn test_heal_never_exceeds_max() {
        let mut p = participant(1, 20);
        p.apply_damage(15);
        p.heal(100);
        assert_eq!(p.current_hp, 20);
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut state = GameState::new(RoomId(1), ts(100));
        state.touch(ts(50));
        assert_eq!(state.last_modified_at, ts(100));
        state.touch(ts(200));
        assert_eq!(state.last_modified_at, ts(200));
    }

    #[test]
    fn test_turn_after_wraps_and_increments_round() {
        let mut state = GameState::new(RoomId(1), ts(0));
        state.initiative_order = vec![entry(1, 18, None), entry(2, 12, None)];
        assert_eq!(state.turn_after(0), (1, 1));
        assert_eq!(state.turn_after(1), (0, 2));
    }

    #[test]
    fn test_begin_turn_new_round_resets_statuses() {
        let mut state = GameState::new(RoomId(1), ts(0));
        state.initiative_order = vec![entry(1, 18, None), entry(2, 12, None)];
        state.participants.insert(EntityId(1), participant(1, 10));
        state.participants.insert(EntityId(2), participant(2, 10));
        state.participants.get_mut(&EntityId(1)).unwrap().turn_status = TurnStatus::Completed;
        state.participants.get_mut(&EntityId(2)).unwrap().turn_status = TurnStatus::Skipped;

        state.begin_turn(0, 2, None, ts(10));

        assert_eq!(
            state.participants[&EntityId(1)].turn_status,
            TurnStatus::Active
        );
        assert_eq!(
            state.participants[&EntityId(2)].turn_status,
            TurnStatus::Waiting
        );
        assert_eq!(state.round_number, 2);
    }

    #[test]
    fn test_admit_participant_is_idempotent() {
        let mut state = GameState::new(RoomId(1), ts(0));
        let mut p = participant(1, 10);
        state.admit_participant(entry(1, 15, None), p.clone(), ts(1));
        // A second admit with different stats must not overwrite the live
        // participant — rejoin is presence, not reset.
        p.current_hp = 1;
        state.admit_participant(entry(1, 99, None), p, ts(2));

        assert_eq!(state.initiative_order.len(), 1);
        assert_eq!(state.participants[&EntityId(1)].current_hp, 10);
        assert_eq!(state.initiative_order[0].initiative_score, 15);
    }

    #[test]
    fn test_admit_participant_preserves_active_entity_across_resort() {
        let mut state = GameState::new(RoomId(1), ts(0));
        state.admit_participant(entry(1, 10, None), participant(1, 10), ts(1));
        state.status = InteractionStatus::Active;
        state.begin_turn(0, 1, None, ts(2));

        // A higher-initiative latecomer sorts ahead of the active entity;
        // the turn pointer must follow the entity, not the slot.
        state.admit_participant(entry(2, 20, None), participant(2, 10), ts(3));

        assert_eq!(state.current_turn_index, 1);
        assert_eq!(state.active_entry().unwrap().entity_id, EntityId(1));
    }

    #[test]
    fn test_append_chat_advances_id_counter() {
        let mut state = GameState::new(RoomId(1), ts(0));
        let msg = ChatMessage {
            id: ChatMessageId::server(1),
            sender_user_id: UserId(1),
            entity_id: None,
            content: "hail".into(),
            channel: ChatChannel::Party,
            recipients: Vec::new(),
            timestamp: ts(5),
        };
        state.append_chat(msg);
        assert_eq!(state.next_message_seq, 2);
        assert_eq!(state.chat_log.len(), 1);
    }

    #[test]
    fn test_chat_message_id_provisional_detection() {
        assert!(ChatMessageId(format!("{PROVISIONAL_ID_PREFIX}abc")).is_provisional());
        assert!(!ChatMessageId::server(42).is_provisional());
        assert_eq!(ChatMessageId::server(42).0, "msg-42");
    }
}

#[cfg(test)]
mod dbg_roundtrip {
    use super::*;
    #[test]
    fn dbg_participants_roundtrip() {
        let mut m: BTreeMap<EntityId, i32> = BTreeMap::new();
        m.insert(EntityId(1), 7);
        let s = serde_json::to_string(&m).unwrap();
        println!("MAP ser={s}");
        let d: Result<BTreeMap<EntityId,i32>,_> = serde_json::from_str(&s);
        println!("MAP de={:?}", d.map_err(|e|e.to_string()));

        let mut gs = GameState::new(RoomId(1), chrono::DateTime::from_timestamp(0,0).unwrap());
        gs.participants.insert(EntityId(1), ParticipantState{entity_id:EntityId(1),name:"x".into(),current_hp:1,max_hp:1,position:Position{x:0,y:0},active_conditions:Default::default(),inventory:vec![],available_actions:Default::default(),turn_status:TurnStatus::Waiting});
        let s = serde_json::to_string(&gs).unwrap();
        let d: Result<GameState,_> = serde_json::from_str(&s);
        println!("GS de={:?}", d.map(|_|"ok").map_err(|e|e.to_string()));
    }
}
