//! The typed error vocabulary of the command processor.
//!
//! Every failed command maps to exactly one of these; they serialize across
//! the wire inside replies so clients can surface them distinctly (inline
//! validation vs. permissions message vs. connectivity banner).

use serde::{Deserialize, Serialize};

use crate::ids::EntityId;
use crate::state::InteractionStatus;

/// Why a command was rejected. The store is untouched whenever one of
/// these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind")]
pub enum CommandError {
    /// The referenced room or entity does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// The acting entity is not the one at `currentTurnIndex`.
    #[error("not your turn: {actor} acted, {expected:?} is active")]
    NotYourTurn {
        actor: EntityId,
        expected: Option<EntityId>,
    },

    /// The action kind is unavailable to the actor, or a required operand
    /// is missing.
    #[error("invalid action: {reason}")]
    InvalidAction { reason: String },

    /// The requested status change is not permitted from the current status.
    #[error("invalid transition from {from}: {attempted}")]
    InvalidTransition {
        from: InteractionStatus,
        attempted: String,
    },

    /// A DM-only command issued by a non-DM caller.
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },
}

impl CommandError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn invalid_action(reason: impl Into<String>) -> Self {
        Self::InvalidAction {
            reason: reason.into(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_serializes_with_kind_tag() {
        let err = CommandError::Forbidden {
            reason: "rollback is DM-only".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "Forbidden");
        assert_eq!(json["reason"], "rollback is DM-only");
    }

    #[test]
    fn test_command_error_round_trips() {
        let err = CommandError::NotYourTurn {
            actor: EntityId(2),
            expected: Some(EntityId(1)),
        };
        let bytes = serde_json::to_vec(&err).unwrap();
        let decoded: CommandError = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(err, decoded);
    }

    #[test]
    fn test_command_error_display_is_descriptive() {
        let err = CommandError::invalid_action("Attack requires a target");
        assert!(err.to_string().contains("Attack requires a target"));
    }
}
