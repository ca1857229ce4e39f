//! In-process duplex transport for tests and demos.
//!
//! [`memory_endpoint`] returns a listener/connector pair wired together by
//! a channel: each `connect` call manufactures a fresh duplex connection
//! and hands the server half to the listener. No sockets involved, so
//! tests stay deterministic and fast.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::{Connection, ConnectionId, Connector, Transport, TransportError};

/// Counter for generating unique in-memory connection ids.
static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

/// A frame on the in-memory wire. `Close` lets either side signal a clean
/// shutdown even while clones of the sender keep the channel alive.
#[derive(Debug)]
enum Frame {
    Data(Vec<u8>),
    Close,
}

/// One end of an in-process duplex connection.
#[derive(Clone)]
pub struct MemoryConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Frame>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Frame>>>,
}

/// Creates a connected pair of memory connections (two ends of one pipe).
pub fn duplex_pair() -> (MemoryConnection, MemoryConnection) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let id = ConnectionId::new(NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed));
    let a = MemoryConnection {
        id,
        tx: a_tx,
        rx: Arc::new(Mutex::new(b_rx)),
    };
    let b = MemoryConnection {
        id,
        tx: b_tx,
        rx: Arc::new(Mutex::new(a_rx)),
    };
    (a, b)
}

impl Connection for MemoryConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(Frame::Data(data.to_vec()))
            .map_err(|_| TransportError::ConnectionClosed("peer dropped".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(Frame::Data(data)) => Ok(Some(data)),
            Some(Frame::Close) | None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Best-effort: the peer may already be gone.
        let _ = self.tx.send(Frame::Close);
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

/// Server half of a memory endpoint: yields one connection per `connect`.
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryConnection>,
}

impl Transport for MemoryListener {
    type Connection = MemoryConnection;

    async fn accept(&mut self) -> Result<MemoryConnection, TransportError> {
        self.incoming.recv().await.ok_or_else(|| {
            TransportError::AcceptFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "memory endpoint dropped",
            ))
        })
    }
}

/// Client half of a memory endpoint. Cloneable; every clone dials the same
/// listener.
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryConnection>,
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, TransportError> {
        let (client_end, server_end) = duplex_pair();
        self.accept_tx
            .send(server_end)
            .map_err(|_| TransportError::ConnectFailed("listener dropped".into()))?;
        Ok(client_end)
    }
}

/// Creates a wired listener/connector pair.
pub fn memory_endpoint() -> (MemoryListener, MemoryConnector) {
    let (accept_tx, incoming) = mpsc::unbounded_channel();
    (MemoryListener { incoming }, MemoryConnector { accept_tx })
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_pair_delivers_both_directions() {
        let (a, b) = duplex_pair();
        a.send(b"ping").await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(b"ping".to_vec()));
        b.send(b"pong").await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Some(b"pong".to_vec()));
    }

    #[tokio::test]
    async fn test_close_yields_none_on_peer() {
        let (a, b) = duplex_pair();
        a.close().await.unwrap();
        assert_eq!(b.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recv_returns_none_when_peer_dropped() {
        let (a, b) = duplex_pair();
        drop(a);
        assert_eq!(b.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_endpoint_accepts_each_dial() {
        let (mut listener, connector) = memory_endpoint();
        let client = connector.connect().await.unwrap();
        let server = listener.accept().await.unwrap();

        client.send(b"hello").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_send_after_peer_drop_errors() {
        let (a, b) = duplex_pair();
        drop(b);
        assert!(a.send(b"x").await.is_err());
    }
}
