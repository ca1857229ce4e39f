//! Identifier newtypes shared across the engine.
//!
//! Rooms, users, and entities are all identified by `u64` values assigned
//! by the campaign backend. Wrapping them keeps the signatures honest —
//! a `UserId` cannot be passed where an `EntityId` is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one live interaction room. One `GameState` per room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub u64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R-{}", self.0)
    }
}

/// Identifies an authenticated user (a player or the DM).
///
/// Resolved by the identity collaborator; the engine never inspects
/// credentials itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U-{}", self.0)
    }
}

/// Identifies a campaign entity participating in an encounter
/// (player character, NPC, or monster).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_numbers() {
        // `#[serde(transparent)]` — the backend and the TypeScript client
        // both expect bare numbers, not `{"0": 42}` wrappers.
        assert_eq!(serde_json::to_string(&RoomId(7)).unwrap(), "7");
        assert_eq!(serde_json::to_string(&UserId(7)).unwrap(), "7");
        assert_eq!(serde_json::to_string(&EntityId(7)).unwrap(), "7");
    }

    #[test]
    fn test_ids_display_with_prefix() {
        assert_eq!(RoomId(3).to_string(), "R-3");
        assert_eq!(UserId(3).to_string(), "U-3");
        assert_eq!(EntityId(3).to_string(), "E-3");
    }

    #[test]
    fn test_ids_roundtrip_from_plain_numbers() {
        let id: EntityId = serde_json::from_str("42").unwrap();
        assert_eq!(id, EntityId(42));
    }
}
