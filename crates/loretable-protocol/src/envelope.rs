//! Wire envelopes: everything that travels between client and server.
//!
//! Two directions, two enums. `ClientEnvelope` carries the handshake,
//! commands (each tagged with a correlation id for reconciliation), replay
//! requests, and heartbeats. `ServerEnvelope` carries the handshake ack,
//! per-command replies, and the sequenced event stream.
//!
//! The JSON shapes here are a contract with the web client — the serde
//! attributes are load-bearing, and the tests at the bottom pin them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use loretable_encounter::{
    ChatChannel, ChatMessage, CommandError, EntityId, EntityType, GameState, InitiativeEntry,
    RoomEvent, RoomId, TurnAction, UserId,
};

/// Protocol version carried in `Hello`; mismatched clients are refused.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Correlation ids
// ---------------------------------------------------------------------------

/// Ties a command to its reply and to the broadcast events it produced.
///
/// Generated client-side, one per in-flight command; the client's
/// optimistic-mutation table is keyed by these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

/// The command surface of the room RPC channel (spec §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    JoinRoom {
        room_id: RoomId,
        entity_id: EntityId,
        entity_type: EntityType,
    },
    LeaveRoom,
    TakeTurn {
        action: TurnAction,
    },
    SkipTurn {
        reason: String,
    },
    SendChatMessage {
        content: String,
        channel: ChatChannel,
        #[serde(default)]
        recipients: Vec<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<EntityId>,
    },
    PauseInteraction {
        reason: String,
    },
    ResumeInteraction,
    RollbackTurn {
        turn_number: u32,
        round_number: u32,
    },
    UpdateInitiative {
        order: Vec<InitiativeEntry>,
    },
    StartEncounter,
    EndEncounter,
    /// Full resync, used after reconnect or a detected sequence gap.
    GetRoomState,
}

impl ClientCommand {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "JoinRoom",
            Self::LeaveRoom => "LeaveRoom",
            Self::TakeTurn { .. } => "TakeTurn",
            Self::SkipTurn { .. } => "SkipTurn",
            Self::SendChatMessage { .. } => "SendChatMessage",
            Self::PauseInteraction { .. } => "PauseInteraction",
            Self::ResumeInteraction => "ResumeInteraction",
            Self::RollbackTurn { .. } => "RollbackTurn",
            Self::UpdateInitiative { .. } => "UpdateInitiative",
            Self::StartEncounter => "StartEncounter",
            Self::EndEncounter => "EndEncounter",
            Self::GetRoomState => "GetRoomState",
        }
    }
}

/// Everything a client can put on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEnvelope {
    /// First message on every connection. `token` is opaque to the engine
    /// and resolved by the identity collaborator.
    Hello { version: u32, token: String },

    /// A command with its correlation id.
    Command {
        correlation_id: CorrelationId,
        command: ClientCommand,
    },

    /// Ask the broadcaster to re-deliver buffered events from `seq`
    /// onwards (gap recovery).
    ReplayFrom { seq: u64 },

    /// Keep-alive; `client_time` is echoed for RTT measurement.
    Heartbeat { client_time: u64 },

    /// Clean close.
    Goodbye { reason: String },
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

/// A broadcast event with its room-scoped sequence number.
///
/// `seq` increases monotonically per room; a subscriber that sees a gap
/// requests replay or falls back to a full resync. `origin` names the
/// command that produced the event so its issuer can recognize its own
/// effects during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<CorrelationId>,
    pub event: RoomEvent,
}

/// The successful half of a command reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CommandReply {
    /// Full authoritative state. Replaces the client mirror unconditionally
    /// (server wins, no merge). `as_of_seq` is the broadcast sequence this
    /// state already reflects — events at or below it must not be folded
    /// again.
    State {
        game_state: Box<GameState>,
        as_of_seq: u64,
    },

    /// Partial result for chat: the message with its final server id. The
    /// client replaces its provisional entry in place, preserving log
    /// order.
    Chat {
        message: ChatMessage,
        as_of_seq: u64,
    },

    /// Acknowledgement with no payload (LeaveRoom).
    Left,
}

/// Reply outcome: success payload or typed command error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body")]
pub enum ReplyBody {
    Ok(CommandReply),
    Err(CommandError),
}

impl ReplyBody {
    pub fn into_result(self) -> Result<CommandReply, CommandError> {
        match self {
            Self::Ok(reply) => Ok(reply),
            Self::Err(err) => Err(err),
        }
    }
}

impl From<Result<CommandReply, CommandError>> for ReplyBody {
    fn from(result: Result<CommandReply, CommandError>) -> Self {
        match result {
            Ok(reply) => Self::Ok(reply),
            Err(err) => Self::Err(err),
        }
    }
}

/// Everything the server can put on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEnvelope {
    /// Handshake ack: who the identity provider says you are.
    Welcome {
        user_id: UserId,
        server_time: DateTime<Utc>,
    },

    /// The response to exactly one `Command`.
    Reply {
        correlation_id: CorrelationId,
        body: ReplyBody,
    },

    /// One broadcast event from the subscribed room.
    Event { event: SequencedEvent },

    /// Keep-alive echo.
    HeartbeatAck { client_time: u64, server_time: u64 },

    /// Server-initiated close.
    Goodbye { reason: String },
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    //! JSON shape tests. The web client parses these exact shapes; a serde
    //! attribute change that alters them is a breaking protocol change and
    //! should fail here first.

    use super::*;

    #[test]
    fn test_correlation_id_serializes_transparently() {
        let id = CorrelationId::new();
        let json = serde_json::to_string(&id).unwrap();
        // A bare JSON string (the UUID), not an object.
        assert!(json.starts_with('"') && json.ends_with('"'));
        let back: CorrelationId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_hello_json_format() {
        let msg = ClientEnvelope::Hello {
            version: PROTOCOL_VERSION,
            token: "session-abc".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Hello");
        assert_eq!(json["version"], 1);
        assert_eq!(json["token"], "session-abc");
    }

    #[test]
    fn test_command_envelope_round_trip() {
        let msg = ClientEnvelope::Command {
            correlation_id: CorrelationId::new(),
            command: ClientCommand::SkipTurn {
                reason: "afk".into(),
            },
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let decoded: ClientEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_client_command_internally_tagged() {
        let cmd = ClientCommand::RollbackTurn {
            turn_number: 4,
            round_number: 2,
        };
        let json: serde_json::Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "RollbackTurn");
        assert_eq!(json["turn_number"], 4);
        assert_eq!(json["round_number"], 2);
    }

    #[test]
    fn test_send_chat_recipients_default_to_empty() {
        // Old clients omit `recipients` for party chat.
        let json = r#"{ "type": "SendChatMessage", "content": "hi", "channel": "Party" }"#;
        let cmd: ClientCommand = serde_json::from_str(json).unwrap();
        let ClientCommand::SendChatMessage { recipients, entity_id, .. } = cmd else {
            panic!("expected SendChatMessage");
        };
        assert!(recipients.is_empty());
        assert!(entity_id.is_none());
    }

    #[test]
    fn test_reply_body_status_tagged() {
        let body = ReplyBody::Err(CommandError::forbidden("rollback is DM-only"));
        let json: serde_json::Value = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], "Err");
        assert_eq!(json["body"]["kind"], "Forbidden");
    }

    #[test]
    fn test_reply_body_into_result() {
        let ok = ReplyBody::Ok(CommandReply::Left);
        assert!(ok.into_result().is_ok());
        let err = ReplyBody::Err(CommandError::not_found("room"));
        assert!(err.into_result().is_err());
    }

    #[test]
    fn test_sequenced_event_omits_absent_origin() {
        use loretable_encounter::testutil::ts;
        let event = SequencedEvent {
            seq: 9,
            origin: None,
            event: RoomEvent::InteractionStarted { at: ts(1) },
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["seq"], 9);
        assert!(json.get("origin").is_none());
        assert_eq!(json["event"]["type"], "InteractionStarted");
    }

    #[test]
    fn test_server_envelope_event_round_trip() {
        use loretable_encounter::testutil::ts;
        let msg = ServerEnvelope::Event {
            event: SequencedEvent {
                seq: 3,
                origin: Some(CorrelationId::new()),
                event: RoomEvent::InteractionPaused {
                    reason: "pizza".into(),
                    remaining_ms: 42_000,
                    at: ts(10),
                },
            },
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let decoded: ServerEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_decode_garbage_returns_error() {
        let garbage = b"not json at all";
        let result: Result<ClientEnvelope, _> = serde_json::from_slice(garbage);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_unknown_command_type_returns_error() {
        let unknown = r#"{"type": "SummonDragon", "size": "large"}"#;
        let result: Result<ClientCommand, _> = serde_json::from_str(unknown);
        assert!(result.is_err());
    }
}

#[cfg(test)]
mod dbg_env {
    use super::*;
    #[test]
    fn dbg_decode_env() {
        let s = include_str!("/tmp/env.json");
        let r: Result<ServerEnvelope,_> = serde_json::from_str(s);
        let ok=r.is_ok(); println!("ENVDE={:?}", r.map(|_|"ok").map_err(|e|e.to_string())); assert!(ok);
    }
}
