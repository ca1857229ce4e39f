//! # Loretable live engine
//!
//! The synchronization engine behind Loretable's live encounters: one
//! authoritative `GameState` per room, mutated only through the command
//! processor, fanned out as a sequenced event stream, and mirrored
//! client-side with optimistic reconciliation.
//!
//! This crate is the server glue; the interesting machinery lives in the
//! layer crates (`loretable-encounter`, `loretable-room`,
//! `loretable-scheduler`, `loretable-session`, `loretable-client`).
//!
//! ```rust,no_run
//! use loretable::LoretableServerBuilder;
//! use loretable_encounter::RoomId;
//! use loretable_room::StaticDirectory;
//! use loretable_session::StaticIdentity;
//! use loretable_transport::WebSocketTransport;
//!
//! # async fn run() -> Result<(), loretable::LoretableError> {
//! let transport = WebSocketTransport::bind("0.0.0.0:8080").await?;
//! let server = LoretableServerBuilder::new().build(
//!     transport,
//!     StaticIdentity::new(),
//!     StaticDirectory::new(),
//! );
//! server.open_room(RoomId(1)).await;
//! server.run().await
//! # }
//! ```

mod error;
mod handler;
mod server;

pub use error::LoretableError;
pub use server::{LoretableServer, LoretableServerBuilder};

/// Installs the default tracing subscriber (`RUST_LOG`-filtered). For
/// binaries and demos; tests and libraries leave the subscriber alone.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
