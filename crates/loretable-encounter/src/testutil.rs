//! Shared fixtures for the workspace's test suites.
//!
//! Not part of the public API contract — exported so the room, client, and
//! server crates can build encounter states in their own tests without
//! repeating fixture code.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::action::ActionKind;
use crate::ids::{EntityId, UserId};
use crate::state::{EntityType, InitiativeEntry, ParticipantState, Position, TurnStatus};

/// A deterministic timestamp `secs` seconds after the epoch.
pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).expect("valid test timestamp")
}

/// An initiative entry. Entries with an owner are player characters;
/// ownerless ones are monsters (the DM acts for them).
pub fn entry(entity: u64, score: i32, owner: Option<UserId>) -> InitiativeEntry {
    InitiativeEntry {
        entity_id: EntityId(entity),
        entity_type: if owner.is_some() {
            EntityType::PlayerCharacter
        } else {
            EntityType::Monster
        },
        initiative_score: score,
        owner_user_id: owner,
    }
}

/// A participant at full health with every action available.
pub fn participant(entity: u64, max_hp: i32) -> ParticipantState {
    ParticipantState {
        entity_id: EntityId(entity),
        name: format!("E{entity}"),
        current_hp: max_hp,
        max_hp,
        position: Position { x: 0, y: 0 },
        active_conditions: BTreeSet::new(),
        inventory: Vec::new(),
        available_actions: BTreeSet::from(ActionKind::ALL),
        turn_status: TurnStatus::Waiting,
    }
}
