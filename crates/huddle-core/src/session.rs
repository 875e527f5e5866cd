//! Participant sessions.
//!
//! A session adapts one connection to a room. It runs two tasks:
//!
//! - **reader** - hands every incoming message to the [`SessionHandler`]
//! - **writer** - drains the bounded outbound queue into the connection
//!
//! Both tasks share a cancellation token that is a child of the room's token.
//! When the reader ends, for whatever reason, the handler's `on_leave` runs
//! exactly once.

use async_trait::async_trait;
use huddle_protocol::Message;
use huddle_transport::{Connection, ConnectionId, ConnectionReader, ConnectionWriter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The outbound path has been torn down.
    #[error("Session closed")]
    Closed,

    /// The outbound queue is full.
    #[error("Outbound queue full")]
    Full,

    /// `start` was called twice.
    #[error("Session already started")]
    AlreadyStarted,
}

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The user behind a session. The same user may hold several sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Stable user identifier.
    pub user_id: String,
    /// Display name.
    pub user_name: String,
}

impl User {
    /// Create a user.
    #[must_use]
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

/// Callbacks a session makes into its room.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// A message arrived from the session's connection.
    async fn on_message(&self, session: &Arc<Session>, message: Message);

    /// The session's connection is gone. Called exactly once per session.
    async fn on_leave(&self, session: Arc<Session>);
}

struct Pending {
    connection: Box<dyn Connection>,
    outbound_rx: mpsc::Receiver<Message>,
    handler: Arc<dyn SessionHandler>,
}

/// One connected participant in a room.
pub struct Session {
    id: SessionId,
    user: User,
    connection_id: ConnectionId,
    token: CancellationToken,
    outbound: mpsc::Sender<Message>,
    pending: Mutex<Option<Pending>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("connection_id", &self.connection_id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Session {
    /// Create a session. Nothing runs until [`Session::start`].
    ///
    /// `token` should be a child of the owning room's token.
    #[must_use]
    pub fn new(
        connection: Box<dyn Connection>,
        user: User,
        token: CancellationToken,
        outbound_capacity: usize,
        handler: Arc<dyn SessionHandler>,
    ) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::channel(outbound_capacity.max(1));
        Arc::new(Self {
            id: SessionId::generate(),
            user,
            connection_id: connection.id().clone(),
            token,
            outbound,
            pending: Mutex::new(Some(Pending {
                connection,
                outbound_rx,
                handler,
            })),
        })
    }

    /// Get the session ID.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Get the user behind this session.
    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }

    /// Get the underlying connection ID.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Whether the session has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the session is stopped.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }

    /// Spawn the reader and writer tasks.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyStarted`] on a second call.
    pub fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        let pending = self
            .pending
            .lock()
            .map_err(|_| SessionError::AlreadyStarted)?
            .take()
            .ok_or(SessionError::AlreadyStarted)?;

        let (reader, writer) = pending.connection.split();

        tokio::spawn(run_writer(self.clone(), writer, pending.outbound_rx));
        tokio::spawn(run_reader(self.clone(), reader, pending.handler));

        debug!(session = %self.id, user = %self.user.user_id, "Session started");
        Ok(())
    }

    /// Queue a message for delivery without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] once the session is torn down and
    /// [`SessionError::Full`] if the outbound queue has no room.
    pub fn send(&self, message: Message) -> Result<(), SessionError> {
        if self.token.is_cancelled() {
            return Err(SessionError::Closed);
        }
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::Full,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    /// Queue a message for delivery, waiting for queue space.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session is torn down first.
    pub async fn send_wait(&self, message: Message) -> Result<(), SessionError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(SessionError::Closed),
            result = self.outbound.send(message) => result.map_err(|_| SessionError::Closed),
        }
    }

    /// Cancel the session. Both tasks unwind and the room is told once.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

async fn run_reader(
    session: Arc<Session>,
    mut reader: Box<dyn ConnectionReader>,
    handler: Arc<dyn SessionHandler>,
) {
    let reason = loop {
        tokio::select! {
            biased;
            _ = session.token.cancelled() => break "cancelled",
            result = reader.recv() => match result {
                Ok(Some(message)) => {
                    trace!(session = %session.id, kind = %message.kind, "Message received");
                    handler.on_message(&session, message).await;
                }
                Ok(None) => break "closed by peer",
                Err(e) => {
                    debug!(session = %session.id, error = %e, "Read failed");
                    break "read error";
                }
            },
        }
    };

    debug!(session = %session.id, user = %session.user.user_id, reason, "Session ending");

    // Cancel before notifying so a join still queued behind this leave sees
    // a stopped session and skips it.
    session.token.cancel();
    handler.on_leave(session).await;
}

async fn run_writer(
    session: Arc<Session>,
    mut writer: Box<dyn ConnectionWriter>,
    mut outbound_rx: mpsc::Receiver<Message>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = session.token.cancelled() => break,
            next = outbound_rx.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        let sent = tokio::select! {
            biased;
            _ = session.token.cancelled() => break,
            result = writer.send(&message) => result,
        };
        if let Err(e) = sent {
            debug!(session = %session.id, error = %e, "Write failed");
            break;
        }
    }

    outbound_rx.close();
    session.token.cancel();
    if let Err(e) = writer.close().await {
        trace!(session = %session.id, error = %e, "Close failed");
    }
}
