//! The entity directory: the persistence boundary, as a trait.
//!
//! Campaign entities (characters, NPCs, monsters) live in the campaign
//! backend; the engine only needs a seed of combat-relevant fields when an
//! entity enters an encounter. Implement [`EntityDirectory`] against the
//! real backend; [`StaticDirectory`] serves tests and demos.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;

use loretable_encounter::{
    ActionKind, EntityId, EntityType, InitiativeEntry, ItemRef, ParticipantState, Position,
    TurnStatus, UserId,
};

use crate::RoomError;

/// The seed for a participant entering an encounter.
#[derive(Debug, Clone)]
pub struct EntityProfile {
    pub name: String,
    pub max_hp: i32,
    pub position: Position,
    pub initiative_score: i32,
    pub available_actions: BTreeSet<ActionKind>,
    pub inventory: Vec<ItemRef>,
}

impl EntityProfile {
    /// A full-strength participant built from this profile.
    pub fn into_participant(self, entity_id: EntityId) -> ParticipantState {
        ParticipantState {
            entity_id,
            name: self.name,
            current_hp: self.max_hp,
            max_hp: self.max_hp,
            position: self.position,
            active_conditions: BTreeSet::new(),
            inventory: self.inventory,
            available_actions: self.available_actions,
            turn_status: TurnStatus::Waiting,
        }
    }

    /// The initiative slot for this profile. Player characters carry their
    /// owner; NPCs and monsters are DM-driven.
    pub fn initiative_entry(
        &self,
        entity_id: EntityId,
        entity_type: EntityType,
        owner: UserId,
    ) -> InitiativeEntry {
        InitiativeEntry {
            entity_id,
            entity_type,
            initiative_score: self.initiative_score,
            owner_user_id: match entity_type {
                EntityType::PlayerCharacter => Some(owner),
                EntityType::Npc | EntityType::Monster => None,
            },
        }
    }
}

/// Resolves entity ids to participant seeds.
pub trait EntityDirectory: Send + Sync + 'static {
    /// Looks up the combat-relevant fields of an entity.
    ///
    /// # Errors
    /// Returns [`RoomError::Directory`] when the entity is unknown or the
    /// backend is unreachable.
    fn lookup(
        &self,
        entity_id: EntityId,
    ) -> impl Future<Output = Result<EntityProfile, RoomError>> + Send;
}

/// A table-backed [`EntityDirectory`] for tests and demos.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    entities: HashMap<EntityId, EntityProfile>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity with the given profile.
    pub fn with_entity(mut self, entity_id: EntityId, profile: EntityProfile) -> Self {
        self.entities.insert(entity_id, profile);
        self
    }

    /// Registers a basic combatant: named, full action set, no inventory.
    pub fn with_combatant(
        self,
        entity_id: EntityId,
        name: impl Into<String>,
        max_hp: i32,
        initiative_score: i32,
    ) -> Self {
        self.with_entity(
            entity_id,
            EntityProfile {
                name: name.into(),
                max_hp,
                position: Position { x: 0, y: 0 },
                initiative_score,
                available_actions: BTreeSet::from(ActionKind::ALL),
                inventory: Vec::new(),
            },
        )
    }
}

impl EntityDirectory for StaticDirectory {
    async fn lookup(&self, entity_id: EntityId) -> Result<EntityProfile, RoomError> {
        self.entities
            .get(&entity_id)
            .cloned()
            .ok_or_else(|| RoomError::Directory(format!("unknown entity {entity_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_directory_resolves_registered_entity() {
        let dir = StaticDirectory::new().with_combatant(EntityId(1), "Brynn", 24, 17);
        let profile = dir.lookup(EntityId(1)).await.unwrap();
        assert_eq!(profile.name, "Brynn");
        assert_eq!(profile.max_hp, 24);
    }

    #[tokio::test]
    async fn test_static_directory_unknown_entity_errors() {
        let dir = StaticDirectory::new();
        assert!(matches!(
            dir.lookup(EntityId(9)).await,
            Err(RoomError::Directory(_))
        ));
    }

    #[test]
    fn test_initiative_entry_owner_only_for_player_characters() {
        let dir_profile = EntityProfile {
            name: "Wolf".into(),
            max_hp: 11,
            position: Position { x: 0, y: 0 },
            initiative_score: 14,
            available_actions: BTreeSet::from(ActionKind::ALL),
            inventory: Vec::new(),
        };
        let as_pc =
            dir_profile.initiative_entry(EntityId(1), EntityType::PlayerCharacter, UserId(5));
        assert_eq!(as_pc.owner_user_id, Some(UserId(5)));

        let as_monster = dir_profile.initiative_entry(EntityId(1), EntityType::Monster, UserId(5));
        assert_eq!(as_monster.owner_user_id, None);
    }
}
