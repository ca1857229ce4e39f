//! Room layer for Loretable's live engine.
//!
//! Each room is an isolated Tokio task (actor) owning the authoritative
//! `GameState` for one encounter — the single logical writer the
//! synchronization protocol requires. Around it:
//!
//! - [`RoomStore`] — swap-on-success state plus rollback checkpoints
//! - [`Broadcaster`] — sequenced at-least-once fan-out with a replay window
//! - [`RoomHandle`] / [`RoomManager`] — directing commands to actors
//! - [`EntityDirectory`] — the persistence collaborator that seeds
//!   participants

mod broadcast;
mod directory;
mod error;
mod manager;
mod room;
mod store;

pub use broadcast::{Broadcaster, EventSender, DEFAULT_REPLAY_WINDOW};
pub use directory::{EntityDirectory, EntityProfile, StaticDirectory};
pub use error::RoomError;
pub use manager::RoomManager;
pub use room::{JoinOutcome, RoomHandle};
pub use store::RoomStore;
