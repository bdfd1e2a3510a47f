//! Transport layer for MCP communication
//!
//! The protocol engine is transport-agnostic: anything that can carry
//! JSON-RPC frames in order, both directions, can implement [`Transport`].
//! This module defines that contract and ships the in-memory pair used for
//! testing and same-process wiring. Network transports (stdio pipes, HTTP
//! streaming) live outside this crate and plug into the same trait.

use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::JsonRpcMessage;
use crate::{Error, Result};

/// Transport trait for MCP communication.
///
/// Implementations must preserve send ordering from a given sender and
/// surface a terminal error from `receive` once the channel is gone.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying channel. Idempotent; the default is a no-op for
    /// transports that are live on construction.
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Deliver a single JSON-RPC frame to the peer.
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<()>;

    /// Receive the next JSON-RPC frame from the peer.
    async fn receive(&mut self) -> Result<JsonRpcMessage>;

    /// Terminate the channel. Must tolerate repeated calls.
    async fn close(&mut self) -> Result<()>;

    /// A marker identifying a pre-existing conversation. When present at
    /// connect time the initialization handshake is skipped.
    fn session_id(&self) -> Option<String> {
        None
    }

    /// Post-handshake hint for transports that tag frames with the
    /// negotiated protocol version (for example in HTTP headers).
    fn set_protocol_version(&mut self, _version: &str) {}
}

/// In-memory transport for testing and local communication
pub struct InMemoryTransport {
    sender: mpsc::UnboundedSender<JsonRpcMessage>,
    receiver: mpsc::UnboundedReceiver<JsonRpcMessage>,
    session_id: Option<String>,
    is_closed: bool,
}

impl InMemoryTransport {
    /// Create a pair of connected in-memory transports
    pub fn pair() -> (Self, Self) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        (
            Self {
                sender: tx1,
                receiver: rx2,
                session_id: None,
                is_closed: false,
            },
            Self {
                sender: tx2,
                receiver: rx1,
                session_id: None,
                is_closed: false,
            },
        )
    }

    /// Attach a session id, marking this end as a resumed conversation
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[async_trait::async_trait]
impl Transport for InMemoryTransport {
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<()> {
        if self.is_closed {
            return Err(Error::Transport(
                "In-memory transport is closed".to_string(),
            ));
        }

        self.sender.send(message.clone()).map_err(|_| {
            Error::Transport("Failed to send message through in-memory transport".to_string())
        })?;

        Ok(())
    }

    async fn receive(&mut self) -> Result<JsonRpcMessage> {
        if self.is_closed {
            return Err(Error::ConnectionClosed(
                "In-memory transport is closed".to_string(),
            ));
        }

        self.receiver.recv().await.ok_or_else(|| {
            self.is_closed = true;
            Error::ConnectionClosed("In-memory transport connection closed".to_string())
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.is_closed = true;
        debug!("In-memory transport closed");
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }
}

/// Transport factory for creating different transport types
pub struct TransportFactory;

impl TransportFactory {
    /// Create an in-memory transport pair for testing
    pub fn in_memory_pair() -> (Box<dyn Transport>, Box<dyn Transport>) {
        let (transport1, transport2) = InMemoryTransport::pair();
        (Box::new(transport1), Box::new(transport2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcNotification, JsonRpcMessage};

    fn note(method: &str) -> JsonRpcMessage {
        JsonRpcMessage::Notification(JsonRpcNotification::new(method, None))
    }

    #[tokio::test]
    async fn test_in_memory_transport() {
        let (mut transport1, mut transport2) = InMemoryTransport::pair();

        transport1.send(&note("a")).await.unwrap();
        let received = transport2.receive().await.unwrap();
        assert!(matches!(
            received,
            JsonRpcMessage::Notification(ref n) if n.method == "a"
        ));

        transport2.send(&note("b")).await.unwrap();
        let received = transport1.receive().await.unwrap();
        assert!(matches!(
            received,
            JsonRpcMessage::Notification(ref n) if n.method == "b"
        ));

        transport1.close().await.unwrap();
        assert!(transport1.send(&note("c")).await.is_err());
    }

    #[tokio::test]
    async fn test_receive_fails_when_peer_drops() {
        let (transport1, mut transport2) = InMemoryTransport::pair();
        drop(transport1);

        let err = transport2.receive().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_ordering_is_preserved() {
        let (mut transport1, mut transport2) = InMemoryTransport::pair();

        for method in ["one", "two", "three"] {
            transport1.send(&note(method)).await.unwrap();
        }
        for expected in ["one", "two", "three"] {
            let received = transport2.receive().await.unwrap();
            assert!(matches!(
                received,
                JsonRpcMessage::Notification(ref n) if n.method == expected
            ));
        }
    }

    #[test]
    fn test_session_id_marker() {
        let (transport1, _transport2) = InMemoryTransport::pair();
        assert!(transport1.session_id().is_none());

        let resumed = InMemoryTransport::pair().0.with_session_id("sess-42");
        assert_eq!(resumed.session_id().as_deref(), Some("sess-42"));
    }
}
