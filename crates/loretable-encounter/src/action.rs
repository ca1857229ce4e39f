//! Turn actions: what a participant submits on their turn.
//!
//! Actions are inputs, not log entries — the processor validates them
//! against the acting participant and records them inside a `TurnRecord`.
//! Rules content (damage formulas, spell effects) is carried opaquely in
//! `parameters`; the engine interprets only the structural minimum needed
//! to keep state consistent (movement, clamped HP deltas, item consumption).

use serde::{Deserialize, Serialize};

use crate::ids::EntityId;
use crate::state::{ItemRef, Position};

/// The closed set of action kinds a turn can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Move,
    Attack,
    UseItem,
    Cast,
    Interact,
    End,
}

impl ActionKind {
    /// Every kind, for seeding a default `availableActions` set.
    pub const ALL: [ActionKind; 6] = [
        ActionKind::Move,
        ActionKind::Attack,
        ActionKind::UseItem,
        ActionKind::Cast,
        ActionKind::Interact,
        ActionKind::End,
    ];

    /// Whether this kind requires a `target` to be present.
    pub fn requires_target(&self) -> bool {
        matches!(self, Self::Attack | Self::Cast)
    }

    /// Whether this kind requires a `position` to be present.
    pub fn requires_position(&self) -> bool {
        matches!(self, Self::Move)
    }

    /// Whether this kind requires an `item` to be present.
    pub fn requires_item(&self) -> bool {
        matches!(self, Self::UseItem)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Move => "Move",
            Self::Attack => "Attack",
            Self::UseItem => "UseItem",
            Self::Cast => "Cast",
            Self::Interact => "Interact",
            Self::End => "End",
        };
        write!(f, "{name}")
    }
}

/// A single action within a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnAction {
    pub kind: ActionKind,
    pub actor_entity_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<ItemRef>,
    /// Opaque rules-engine payload. The processor reads only the structural
    /// keys `damage` and `heal`; everything else passes through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl TurnAction {
    /// A bare action of the given kind with no operands.
    pub fn of(kind: ActionKind, actor_entity_id: EntityId) -> Self {
        Self {
            kind,
            actor_entity_id,
            target: None,
            position: None,
            item: None,
            parameters: None,
        }
    }

    /// The name of the first required operand that is missing, if any.
    pub fn missing_operand(&self) -> Option<&'static str> {
        if self.kind.requires_target() && self.target.is_none() {
            return Some("target");
        }
        if self.kind.requires_position() && self.position.is_none() {
            return Some("position");
        }
        if self.kind.requires_item() && self.item.is_none() {
            return Some("item");
        }
        None
    }

    /// Reads an integer effect parameter (`damage`, `heal`).
    pub fn effect_param(&self, key: &str) -> Option<i32> {
        self.parameters
            .as_ref()?
            .get(key)?
            .as_i64()
            .map(|v| v as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_operand_attack_without_target() {
        let action = TurnAction::of(ActionKind::Attack, EntityId(1));
        assert_eq!(action.missing_operand(), Some("target"));
    }

    #[test]
    fn test_missing_operand_move_without_position() {
        let action = TurnAction::of(ActionKind::Move, EntityId(1));
        assert_eq!(action.missing_operand(), Some("position"));
    }

    #[test]
    fn test_missing_operand_use_item_without_item() {
        let action = TurnAction::of(ActionKind::UseItem, EntityId(1));
        assert_eq!(action.missing_operand(), Some("item"));
    }

    #[test]
    fn test_missing_operand_end_requires_nothing() {
        let action = TurnAction::of(ActionKind::End, EntityId(1));
        assert_eq!(action.missing_operand(), None);
    }

    #[test]
    fn test_effect_param_reads_integer_keys() {
        let mut action = TurnAction::of(ActionKind::Attack, EntityId(1));
        action.target = Some(EntityId(2));
        action.parameters = Some(serde_json::json!({ "damage": 7, "flavor": "slash" }));
        assert_eq!(action.effect_param("damage"), Some(7));
        assert_eq!(action.effect_param("heal"), None);
    }
}
