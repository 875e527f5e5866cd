//! Transport abstraction traits for Huddle.
//!
//! A [`Connection`] is split into a reader and a writer half so that a session can
//! read from and write to the same peer from two independent tasks.

use async_trait::async_trait;
use huddle_protocol::Message;
use std::fmt;
use thiserror::Error;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Peer sent a frame larger than allowed.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Received size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] huddle_protocol::ProtocolError),
}

/// An active connection to a single peer.
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independently owned read and write halves.
    fn split(self: Box<Self>) -> (Box<dyn ConnectionReader>, Box<dyn ConnectionWriter>);
}

/// Read half of a connection.
#[async_trait]
pub trait ConnectionReader: Send {
    /// Receive the next message from the peer.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Message>, TransportError>;
}

/// Write half of a connection.
#[async_trait]
pub trait ConnectionWriter: Send {
    /// Send a message to the peer.
    async fn send(&mut self, message: &Message) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}
