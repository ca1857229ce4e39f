//! WebSocket transport via `tokio-tungstenite`.
//!
//! The stream is split into reader and writer halves, each behind its own
//! lock: the server's event fan-out writes from one task while the request
//! loop blocks in `recv` on another, and the two must never contend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::{Connection, ConnectionId, Connector, Transport, TransportError};

/// Counter for generating unique connection ids.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A WebSocket connection over any async byte stream.
///
/// Clones share the underlying halves, so one clone can live in the
/// receive loop while another sends.
pub struct WebSocketConnection<S> {
    id: ConnectionId,
    writer: Arc<Mutex<SplitSink<WebSocketStream<S>, Message>>>,
    reader: Arc<Mutex<SplitStream<WebSocketStream<S>>>>,
}

/// The server-side connection type (plain TCP; TLS terminates upstream).
pub type ServerWsConnection = WebSocketConnection<TcpStream>;
/// The client-side connection type (ws:// or wss://).
pub type ClientWsConnection = WebSocketConnection<MaybeTlsStream<TcpStream>>;

impl<S> Clone for WebSocketConnection<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            writer: Arc::clone(&self.writer),
            reader: Arc::clone(&self.reader),
        }
    }
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn new(ws: WebSocketStream<S>) -> Self {
        let (writer, reader) = ws.split();
        Self {
            id: ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
        }
    }
}

impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let msg = Message::Binary(data.to_vec().into());
        self.writer
            .lock()
            .await
            .send(msg)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            let msg = self.reader.lock().await.next().await;
            match msg {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data.into())),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/raw frames
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.writer
            .lock()
            .await
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

/// Listens for incoming WebSocket connections.
pub struct WebSocketTransport {
    listener: TcpListener,
}

impl WebSocketTransport {
    /// Binds to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "WebSocket transport listening");
        Ok(Self { listener })
    }

    /// The locally bound address (useful when binding to port 0 in tests).
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

impl Transport for WebSocketTransport {
    type Connection = ServerWsConnection;

    async fn accept(&mut self) -> Result<ServerWsConnection, TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let conn = WebSocketConnection::new(ws);
        tracing::debug!(id = %conn.id(), %addr, "accepted WebSocket connection");
        Ok(conn)
    }
}

/// Dials a WebSocket endpoint. The client agent re-dials through this on
/// every reconnect attempt.
#[derive(Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// A connector for `ws://…` or `wss://…`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WebSocketConnector {
    type Connection = ClientWsConnection;

    async fn connect(&self) -> Result<ClientWsConnection, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let conn = WebSocketConnection::new(ws);
        tracing::debug!(id = %conn.id(), url = %self.url, "WebSocket connected");
        Ok(conn)
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Full loop over real sockets: bind, dial, exchange frames both ways.
    #[tokio::test]
    async fn test_websocket_round_trip_over_loopback() {
        let mut transport = WebSocketTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap();
        let connector = WebSocketConnector::new(format!("ws://{addr}"));

        let server_task = tokio::spawn(async move { transport.accept().await.unwrap() });
        let client = connector.connect().await.unwrap();
        let server = server_task.await.unwrap();

        client.send(b"roll for initiative").await.unwrap();
        assert_eq!(
            server.recv().await.unwrap(),
            Some(b"roll for initiative".to_vec())
        );

        server.send(b"nat 20").await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Some(b"nat 20".to_vec()));
    }

    #[tokio::test]
    async fn test_websocket_close_yields_none() {
        let mut transport = WebSocketTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap();
        let connector = WebSocketConnector::new(format!("ws://{addr}"));

        let server_task = tokio::spawn(async move { transport.accept().await.unwrap() });
        let client = connector.connect().await.unwrap();
        let server = server_task.await.unwrap();

        client.close().await.unwrap();
        assert_eq!(server.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_connect_to_unbound_port_errors() {
        // Port 1 is never listening on loopback.
        let connector = WebSocketConnector::new("ws://127.0.0.1:1");
        assert!(connector.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_send_and_recv_do_not_contend() {
        // A clone may send while the original blocks in recv — the split
        // halves must not share a lock.
        let mut transport = WebSocketTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap();
        let connector = WebSocketConnector::new(format!("ws://{addr}"));

        let server_task = tokio::spawn(async move { transport.accept().await.unwrap() });
        let client = connector.connect().await.unwrap();
        let server = server_task.await.unwrap();

        let receiver = client.clone();
        let recv_task = tokio::spawn(async move { receiver.recv().await });

        // While the client blocks in recv, it can still send.
        client.send(b"question").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Some(b"question".to_vec()));

        server.send(b"answer").await.unwrap();
        assert_eq!(
            recv_task.await.unwrap().unwrap(),
            Some(b"answer".to_vec())
        );
    }
}
