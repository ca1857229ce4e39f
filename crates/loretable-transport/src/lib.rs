//! Transport abstraction for Loretable's live engine.
//!
//! The synchronization protocol assumes a bidirectional, reliable, ordered
//! byte channel and nothing more. This crate defines that interface
//! ([`Transport`] to accept, [`Connector`] to dial, [`Connection`] to talk)
//! and ships two implementations:
//!
//! - `websocket` (default feature) — `tokio-tungstenite`, the channel the
//!   campaign web app actually uses.
//! - [`memory`] — an in-process duplex pair for tests and demos; no
//!   sockets, deterministic, fast.

#![allow(async_fn_in_trait)]

mod error;
pub mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use memory::{memory_endpoint, MemoryConnection, MemoryConnector, MemoryListener};
#[cfg(feature = "websocket")]
pub use websocket::{
    ClientWsConnection, ServerWsConnection, WebSocketConnection, WebSocketConnector,
    WebSocketTransport,
};

use std::fmt;
use std::future::Future;

/// Opaque identifier for a connection, for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Server side: accepts incoming connections.
pub trait Transport: Send + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;

    /// Waits for and accepts the next incoming connection.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// Client side: dials the remote endpoint.
///
/// The client agent holds a `Connector` (not a `Connection`) so it can
/// re-dial after a channel loss without caller involvement.
pub trait Connector: Send + Sync + 'static {
    /// The connection type produced by this connector.
    type Connection: Connection;

    /// Establishes a fresh connection.
    fn connect(
        &self,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// One established bidirectional channel.
///
/// Implementations are cheaply cloneable handles: one task may sit in
/// `recv` while another `send`s — the two directions never block each
/// other.
pub trait Connection: Clone + Send + Sync + 'static {
    /// Sends one frame to the peer.
    fn send(&self, data: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next frame. `Ok(None)` means the peer closed cleanly.
    fn recv(&self) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Closes the connection.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// The unique identifier of this connection.
    fn id(&self) -> ConnectionId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
    }

    #[test]
    fn test_connection_id_round_trips_inner() {
        assert_eq!(ConnectionId::new(42).into_inner(), 42);
    }
}
