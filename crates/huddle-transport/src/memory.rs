//! In-process connection.
//!
//! [`MemoryConnection::pair`] returns a server-side [`Connection`] and the
//! [`MemoryPeer`] that plays the client. Useful for tests and benchmarks that
//! exercise sessions without a network.

use async_trait::async_trait;
use huddle_protocol::Message;
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, ConnectionReader, ConnectionWriter, TransportError};

type Inbound = Result<Message, String>;

/// Server side of an in-memory connection.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<Message>,
}

/// Client side of an in-memory connection.
pub struct MemoryPeer {
    inbound: Option<mpsc::Sender<Inbound>>,
    outbound: mpsc::Receiver<Message>,
}

impl MemoryConnection {
    /// Create a connected pair.
    ///
    /// `capacity` bounds both directions. A peer that stops reading will
    /// eventually stall the server's writer.
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, MemoryPeer) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);

        let conn = Self {
            id: ConnectionId::generate(),
            inbound: in_rx,
            outbound: out_tx,
        };
        let peer = MemoryPeer {
            inbound: Some(in_tx),
            outbound: out_rx,
        };
        (conn, peer)
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn ConnectionReader>, Box<dyn ConnectionWriter>) {
        let this = *self;
        (
            Box::new(MemoryReader { rx: this.inbound }),
            Box::new(MemoryWriter {
                tx: Some(this.outbound),
            }),
        )
    }
}

struct MemoryReader {
    rx: mpsc::Receiver<Inbound>,
}

#[async_trait]
impl ConnectionReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(reason)) => Err(TransportError::ReceiveFailed(reason)),
            None => Ok(None),
        }
    }
}

struct MemoryWriter {
    tx: Option<mpsc::Sender<Message>>,
}

#[async_trait]
impl ConnectionWriter for MemoryWriter {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(message.clone())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

impl MemoryPeer {
    /// Send a message to the server side.
    ///
    /// # Errors
    ///
    /// Returns an error if either side has closed.
    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        let tx = self
            .inbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        tx.send(Ok(message))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Make the server's next read fail.
    pub async fn fail(&self, reason: impl Into<String>) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Err(reason.into())).await;
        }
    }

    /// Receive the next message the server wrote.
    ///
    /// Returns `None` once the server side has closed and drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.outbound.recv().await
    }

    /// Receive a message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.outbound.try_recv().ok()
    }

    /// Close the client side. The server reads a clean end of stream.
    pub fn close(&mut self) {
        self.inbound = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_both_directions() {
        let (conn, mut peer) = MemoryConnection::pair(8);
        let (mut reader, mut writer) = Box::new(conn).split();

        peer.send(Message::text("lobby", b"up".to_vec())).await.unwrap();
        let received = reader.recv().await.unwrap().unwrap();
        assert_eq!(received.data, b"up");

        writer
            .send(&Message::text("lobby", b"down".to_vec()))
            .await
            .unwrap();
        assert_eq!(peer.recv().await.unwrap().data, b"down");
    }

    #[tokio::test]
    async fn test_peer_close_is_clean_eof() {
        let (conn, mut peer) = MemoryConnection::pair(8);
        let (mut reader, _writer) = Box::new(conn).split();

        peer.close();
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peer_fail_is_read_error() {
        let (conn, peer) = MemoryConnection::pair(8);
        let (mut reader, _writer) = Box::new(conn).split();

        peer.fail("reset by peer").await;
        assert!(matches!(
            reader.recv().await,
            Err(TransportError::ReceiveFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_writer_close() {
        let (conn, mut peer) = MemoryConnection::pair(8);
        let (_reader, mut writer) = Box::new(conn).split();

        writer.close().await.unwrap();
        assert!(writer
            .send(&Message::history_complete("lobby"))
            .await
            .is_err());
        assert!(peer.recv().await.is_none());
    }
}
