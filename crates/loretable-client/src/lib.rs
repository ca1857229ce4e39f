//! Client synchronization agent for Loretable's live engine.
//!
//! Each connected client runs one [`SyncAgent`]: a local mirror of the
//! room's `GameState` that hides latency with optimistic mutations,
//! reconciles them against authoritative replies, folds other clients'
//! broadcast events with the server's own transition rules, and recovers
//! from gaps and disconnects. UI code reads derived views
//! ([`ClientView::is_my_turn`], [`ClientView::turn_time_remaining`])
//! through a watch channel.

mod agent;
mod error;
mod pending;
mod view;

pub use agent::{ClientConfig, CommandOutcome, SyncAgent};
pub use error::ClientError;
pub use pending::{reconcile_chat, InFlightTable, LocalContext, LocalTransform, PendingMutation};
pub use view::{ClientView, ConnectionStatus};
