//! The room hub.
//!
//! Each room runs one control loop task that owns the member set. Joins, leaves
//! and broadcasts share a single mailbox and are handled one at a time in arrival
//! order, so every member sees the same message order and the member set needs
//! no lock.
//!
//! ```text
//!  Session ──join──┐                                ┌─▶ Session
//!  Session ──leave─┼─▶ mailbox ─▶ control loop ─────┼─▶ Session
//!  Session ──bcast─┘                                └─▶ RoomStore
//! ```
//!
//! Two reads skip the loop: [`Room::member_count`] and the history snapshot taken
//! by [`Room::send_history`]. Both may trail an in-flight event.

use async_trait::async_trait;
use huddle_protocol::{Message, RoomSummary};
use huddle_transport::Connection;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{HubConfig, SlowConsumerPolicy};
use crate::session::{Session, SessionError, SessionHandler, SessionId, User};
use crate::store::RoomStore;

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 128;

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// The room's control loop has exited.
    #[error("Room stopped: {0}")]
    Stopped(String),

    /// A session could not be started.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Validate a room name.
///
/// Room names double as storage keys, so path-like names are refused.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('.') {
        return Err("Room names starting with '.' are reserved");
    }
    if name.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// Work handed to the control loop.
enum Request {
    Join(Arc<Session>),
    Leave(Arc<Session>),
    Broadcast(Message),
}

struct RoomInner {
    name: String,
    requests: mpsc::Sender<Request>,
    token: CancellationToken,
    history: Arc<RwLock<Vec<Message>>>,
    members: Arc<AtomicUsize>,
    config: HubConfig,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RoomInner {
    fn drop(&mut self) {
        // Last handle gone: nothing can reach the loop any more.
        self.token.cancel();
    }
}

/// Handle to a running room. Cheap to clone.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.inner.name)
            .field("members", &self.member_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Room {
    /// Start a room and its control loop.
    ///
    /// `history` seeds the room, typically from the store.
    #[must_use]
    pub fn spawn(
        name: impl Into<String>,
        history: Vec<Message>,
        store: Arc<dyn RoomStore>,
        config: HubConfig,
    ) -> Self {
        let name = name.into();
        let capacity = config.mailbox_capacity.max(1);
        let (requests, requests_rx) = mpsc::channel(capacity);

        let token = CancellationToken::new();
        let history = Arc::new(RwLock::new(history));
        let members = Arc::new(AtomicUsize::new(0));

        let control = ControlLoop {
            name: name.clone(),
            requests: requests_rx,
            token: token.clone(),
            sessions: HashMap::new(),
            history: history.clone(),
            members: members.clone(),
            store,
            slow_consumer: config.slow_consumer,
        };

        info!(room = %name, "Room started");
        let handle = tokio::spawn(control.run());

        Self {
            inner: Arc::new(RoomInner {
                name,
                requests,
                token,
                history,
                members,
                config,
                handle: Mutex::new(Some(handle)),
            }),
        }
    }

    /// Get the room name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of registered sessions.
    ///
    /// Read without going through the control loop.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.inner.members.load(Ordering::Acquire)
    }

    /// Room name and member count.
    #[must_use]
    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_name: self.inner.name.clone(),
            user_count: self.member_count(),
        }
    }

    /// Number of messages in history.
    pub async fn history_len(&self) -> usize {
        self.inner.history.read().await.len()
    }

    /// Copy of the full history, oldest first.
    pub async fn history(&self) -> Vec<Message> {
        self.inner.history.read().await.clone()
    }

    /// Whether [`Room::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    fn stopped_error(&self) -> RoomError {
        RoomError::Stopped(self.inner.name.clone())
    }

    /// Create, start and register a session for a new connection.
    ///
    /// The caller usually follows up with [`Room::send_history`].
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Stopped`] if the room has been stopped.
    pub async fn admit(
        &self,
        connection: Box<dyn Connection>,
        user: User,
    ) -> Result<Arc<Session>, RoomError> {
        if self.is_stopped() {
            return Err(self.stopped_error());
        }

        let session = Session::new(
            connection,
            user,
            self.inner.token.child_token(),
            self.inner.config.outbound_capacity,
            Arc::new(self.clone()),
        );
        session.start()?;

        info!(
            room = %self.inner.name,
            session = %session.id(),
            user = %session.user().user_id,
            user_name = %session.user().user_name,
            "User joining"
        );
        self.join(session.clone()).await?;
        Ok(session)
    }

    /// Ask the loop to register a session.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Stopped`] if the loop has exited. The request is dropped.
    pub async fn join(&self, session: Arc<Session>) -> Result<(), RoomError> {
        self.request(Request::Join(session)).await
    }

    /// Ask the loop to unregister a session.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Stopped`] if the loop has exited.
    pub async fn leave(&self, session: Arc<Session>) -> Result<(), RoomError> {
        self.request(Request::Leave(session)).await
    }

    /// Hand a message to the loop for history and fan-out.
    ///
    /// Waits until the loop's mailbox accepts it.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Stopped`] if the loop has exited.
    pub async fn broadcast(&self, message: Message) -> Result<(), RoomError> {
        self.request(Request::Broadcast(message)).await
    }

    async fn request(&self, request: Request) -> Result<(), RoomError> {
        self.inner
            .requests
            .send(request)
            .await
            .map_err(|_| self.stopped_error())
    }

    /// Replay recent history to one session, then send the `over` marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is torn down mid-replay.
    pub async fn send_history(&self, session: &Session) -> Result<(), SessionError> {
        let replay = {
            let history = self.inner.history.read().await;
            let start = history
                .len()
                .saturating_sub(self.inner.config.history_replay_limit);
            history[start..].to_vec()
        };

        debug!(
            room = %self.inner.name,
            session = %session.id(),
            messages = replay.len(),
            "Replaying history"
        );

        for message in replay {
            session.send_wait(message).await?;
        }
        session
            .send_wait(Message::history_complete(self.inner.name.clone()))
            .await
    }

    /// Stop the control loop. Every session in the room is cancelled.
    pub fn stop(&self) {
        if !self.inner.token.is_cancelled() {
            info!(room = %self.inner.name, "Stopping room");
        }
        self.inner.token.cancel();
    }

    /// Wait for the control loop to exit.
    pub async fn stopped(&self) {
        let handle = self
            .inner
            .handle
            .lock()
            .ok()
            .and_then(|mut handle| handle.take());

        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(room = %self.inner.name, error = %e, "Room loop panicked");
                }
            }
            None => self.inner.token.cancelled().await,
        }
    }
}

#[async_trait]
impl SessionHandler for Room {
    async fn on_message(&self, session: &Arc<Session>, message: Message) {
        if let Err(e) = self.broadcast(message).await {
            debug!(session = %session.id(), error = %e, "Dropping message");
        }
    }

    async fn on_leave(&self, session: Arc<Session>) {
        info!(
            room = %self.inner.name,
            session = %session.id(),
            user = %session.user().user_id,
            user_name = %session.user().user_name,
            "User leaving"
        );
        if let Err(e) = self.leave(session).await {
            debug!(error = %e, "Leave after room stop");
        }
    }
}

struct ControlLoop {
    name: String,
    requests: mpsc::Receiver<Request>,
    token: CancellationToken,
    sessions: HashMap<SessionId, Arc<Session>>,
    history: Arc<RwLock<Vec<Message>>>,
    members: Arc<AtomicUsize>,
    store: Arc<dyn RoomStore>,
    slow_consumer: SlowConsumerPolicy,
}

impl ControlLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    self.requests.close();
                    info!(room = %self.name, members = self.sessions.len(), "Room stopped");
                    return;
                }

                Some(request) = self.requests.recv() => match request {
                    Request::Join(session) => self.handle_join(session),
                    Request::Leave(session) => self.handle_leave(session),
                    Request::Broadcast(message) => self.handle_broadcast(message).await,
                },
            }
        }
    }

    fn update_count(&self) {
        self.members.store(self.sessions.len(), Ordering::Release);
    }

    fn handle_join(&mut self, session: Arc<Session>) {
        // Its connection closed before we got here; the leave already passed.
        if session.is_stopped() {
            debug!(room = %self.name, session = %session.id(), "Skipping stopped session");
            return;
        }

        self.sessions.insert(session.id(), session.clone());
        self.update_count();
        debug!(
            room = %self.name,
            session = %session.id(),
            user = %session.user().user_id,
            members = self.sessions.len(),
            "Session registered"
        );

        self.broadcast_user_count();
    }

    fn handle_leave(&mut self, session: Arc<Session>) {
        if self.sessions.remove(&session.id()).is_none() {
            trace!(room = %self.name, session = %session.id(), "Leave for unknown session");
            return;
        }

        session.stop();
        self.update_count();
        debug!(
            room = %self.name,
            session = %session.id(),
            members = self.sessions.len(),
            "Session unregistered"
        );

        self.broadcast_user_count();
    }

    fn broadcast_user_count(&self) {
        let count = self.sessions.len();
        if count == 0 {
            debug!(room = %self.name, "Room empty, no count to send");
            return;
        }
        self.deliver(&Message::user_count(self.name.clone(), count));
    }

    async fn handle_broadcast(&mut self, message: Message) {
        if message.is_persistable() {
            let mut history = self.history.write().await;
            history.push(message.clone());
            let history = history.downgrade();

            if let Err(e) = self.store.save(&self.name, &history).await {
                error!(room = %self.name, error = %e, "Failed to persist room");
            }
        }

        self.deliver(&message);
    }

    fn deliver(&self, message: &Message) {
        trace!(
            room = %self.name,
            kind = %message.kind,
            recipients = self.sessions.len(),
            "Delivering"
        );

        for session in self.sessions.values() {
            match session.send(message.clone()) {
                Ok(()) => {}
                Err(SessionError::Full) => match self.slow_consumer {
                    SlowConsumerPolicy::Disconnect => {
                        warn!(room = %self.name, session = %session.id(), "Slow consumer, disconnecting");
                        session.stop();
                    }
                    SlowConsumerPolicy::Drop => {
                        warn!(room = %self.name, session = %session.id(), "Slow consumer, message dropped");
                    }
                },
                // Already leaving; its leave request is on the way.
                Err(_) => {}
            }
        }
    }
}
