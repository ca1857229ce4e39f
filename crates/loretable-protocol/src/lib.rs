//! Wire protocol for Loretable's live interaction engine.
//!
//! Defines the language client and server speak:
//!
//! - **Envelopes** ([`ClientEnvelope`], [`ServerEnvelope`]) — handshake,
//!   correlated commands and replies, and the sequenced event stream.
//! - **Codec** ([`Codec`], [`JsonCodec`]) — how envelopes become bytes.
//! - **Errors** ([`ProtocolError`]) — what can go wrong in between.
//!
//! The protocol layer sits between transport (raw bytes) and the session
//! layer (user identity). It knows nothing about rooms or connections.

mod codec;
mod envelope;
mod error;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use envelope::{
    ClientCommand, ClientEnvelope, CommandReply, CorrelationId, ReplyBody, SequencedEvent,
    ServerEnvelope, PROTOCOL_VERSION,
};
pub use error::ProtocolError;
