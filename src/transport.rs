//! Abstract Transport: the host-provided channel the Reconciler exchanges
//! [`Message`]s over for one session. Per §5, connections are not shared
//! across sessions to the same peer, so implementations are expected to be
//! cheap, session-scoped values rather than a shared connection pool.
//!
//! This generalizes the teacher's `RemoteDataSource` trait — which crosses
//! the wire via plain async function calls on SeaORM-shaped data — into an
//! explicit message-passing interface, because §6 specifies an actual wire
//! format the two peers must agree on byte-for-byte, not just a Rust trait
//! boundary.

use async_trait::async_trait;

use crate::error::{Result, SyncError};
use crate::wire::{self, Message};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, msg: Message) -> Result<()>;

    /// Waits for and returns the next message. Returns
    /// `Err(SyncError::TransportClosed)` if the peer disconnects before a
    /// message arrives.
    async fn recv(&self) -> Result<Message>;
}

/// An in-memory, byte-framed duplex pair of `Transport`s, used by this
/// crate's own tests in place of a real socket — encoding and decoding every
/// message through [`wire`] so the framing and codec are exercised even
/// though no bytes actually cross a network.
pub struct InMemoryTransport {
    tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl InMemoryTransport {
    /// Creates a connected pair: messages sent on one side arrive, in order,
    /// on the other.
    pub fn duplex() -> (InMemoryTransport, InMemoryTransport) {
        let (tx_a, rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, rx_b) = tokio::sync::mpsc::unbounded_channel();
        (
            InMemoryTransport {
                tx: tx_a,
                rx: tokio::sync::Mutex::new(rx_b),
            },
            InMemoryTransport {
                tx: tx_b,
                rx: tokio::sync::Mutex::new(rx_a),
            },
        )
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, msg: Message) -> Result<()> {
        let frame = wire::encode_message(&msg);
        self.tx
            .send(frame)
            .map_err(|_| SyncError::TransportClosed)
    }

    async fn recv(&self) -> Result<Message> {
        let frame = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(SyncError::TransportClosed)?;
        let (msg, consumed) = wire::try_decode_message(&frame)
            .map_err(|e| SyncError::ProtocolViolation(e.to_string()))?
            .ok_or_else(|| {
                SyncError::ProtocolViolation("incomplete frame from in-memory transport".into())
            })?;
        if consumed != frame.len() {
            return Err(SyncError::ProtocolViolation(
                "trailing bytes after a single in-memory frame".into(),
            ));
        }
        Ok(msg)
    }
}

/// Applies a per-message timeout (§5, `transport.message_timeout_ms`) around
/// any `Transport::recv`/`send` future, converting an elapsed timer into
/// `SyncError::TransportTimeout`.
pub async fn with_timeout<T>(
    timeout_ms: u64,
    expected: &'static str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::TransportTimeout { expected }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn duplex_delivers_messages_in_order() {
        let (a, b) = InMemoryTransport::duplex();
        a.send(Message::TimeQuery).await.unwrap();
        a.send(Message::CommitAck).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Message::TimeQuery);
        assert_eq!(b.recv().await.unwrap(), Message::CommitAck);
    }

    #[tokio::test]
    async fn recv_fails_after_sender_dropped() {
        let (a, b) = InMemoryTransport::duplex();
        drop(a);
        assert!(matches!(b.recv().await, Err(SyncError::TransportClosed)));
    }

    #[tokio::test]
    async fn with_timeout_surfaces_transport_timeout_on_elapsed() {
        let (_a, b) = InMemoryTransport::duplex();
        let result = with_timeout(10, "test message", b.recv()).await;
        assert!(matches!(result, Err(SyncError::TransportTimeout { .. })));
    }

    #[tokio::test]
    async fn round_trips_every_message_shape_through_duplex() {
        let (a, b) = InMemoryTransport::duplex();
        let hello = Message::Hello {
            node_id: Uuid::from_bytes([1u8; 16]),
            protocol_version: crate::wire::PROTOCOL_VERSION,
            table: "tracks".to_string(),
            last_sync_time: crate::hlc::Hlc::MIN,
            session_id: Uuid::from_bytes([2u8; 16]),
        };
        a.send(hello.clone()).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), hello);
    }
}
