//! User session management for Loretable's live engine.
//!
//! 1. **Identity** — the [`Identity`] trait is the trusted boundary to the
//!    application's auth provider: token → user, user → per-room role.
//! 2. **Session tracking** — [`SessionManager`] knows who is connected.
//! 3. **Reconnection** — brief disconnects resume via a secret token
//!    within a configurable grace period, instead of re-authenticating.

#![allow(async_fn_in_trait)]

mod error;
mod identity;
mod manager;
mod session;

pub use error::SessionError;
pub use identity::{Identity, StaticIdentity};
pub use manager::SessionManager;
pub use session::{Session, SessionConfig, SessionState};
