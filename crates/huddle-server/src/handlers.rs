//! HTTP and WebSocket handlers for the Huddle server.
//!
//! A WebSocket connection joins exactly one room, named in the query string.
//! After admission the user receives the room's recent history, the `over`
//! marker and a `roomList` of every room.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, MeteredConnection};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, ConnectInfo, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use huddle_core::{
    DirectoryError, JsonFileStore, MemoryStore, Room, RoomDirectory, RoomStore, User,
};
use huddle_transport::{AxumConnection, Connection};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Room joined when the query names none.
pub const DEFAULT_ROOM: &str = "lobby";

/// Shared server state.
pub struct AppState {
    /// Every room in the process.
    pub directory: RoomDirectory,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state with the store the configuration asks for.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let store: Arc<dyn RoomStore> = if config.storage.enabled {
            let dir = config.storage.path();
            info!(dir = %dir.display(), "Persisting rooms to disk");
            Arc::new(JsonFileStore::new(dir))
        } else {
            info!("Room persistence disabled");
            Arc::new(MemoryStore::new())
        };

        Self {
            directory: RoomDirectory::with_config(store, config.hub.directory_config()),
            config,
        }
    }
}

/// Query parameters of the WebSocket endpoint.
#[derive(Debug, Deserialize)]
pub struct JoinParams {
    /// Room to join.
    #[serde(default = "default_room")]
    pub room: String,
    /// Stable user id. Generated when absent.
    pub user_id: Option<String>,
    /// Display name. Defaults to the user id.
    pub user_name: Option<String>,
}

fn default_room() -> String {
    DEFAULT_ROOM.to_string()
}

impl JoinParams {
    fn into_user(self) -> User {
        let user_id = self
            .user_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("user_{}", uuid::Uuid::new_v4().simple()));
        let user_name = self
            .user_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| user_id.clone());
        User::new(user_id, user_name)
    }
}

/// Build the HTTP router.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so the
/// WebSocket handler can see peer addresses.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/rooms", get(rooms_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if stored rooms cannot be loaded or the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    let restored = state
        .directory
        .restore()
        .await
        .context("Failed to restore rooms")?;
    metrics::set_active_rooms(state.directory.len());
    info!(rooms = restored, "Loaded stored rooms");

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Huddle server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let shutdown_state = state.clone();
    axum::serve(
        listener,
        app(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open sockets only close once their rooms stop.
            shutdown_state.directory.shutdown().await;
        })
        .await?;

    // Rooms created while the listener was draining.
    state.directory.shutdown().await;
    info!("Huddle server stopped");

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rooms": state.directory.len(),
    }))
}

/// Room listing handler.
async fn rooms_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.directory.list())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<JoinParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let room = match state.directory.get_or_create(&params.room) {
        Ok(room) => room,
        Err(e) => {
            warn!(room = %params.room, error = %e, "Rejecting connection");
            metrics::record_error("room");
            let status = match e {
                DirectoryError::InvalidRoomName(_) => StatusCode::BAD_REQUEST,
                DirectoryError::MaxRoomsReached | DirectoryError::Store(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            };
            return (status, e.to_string()).into_response();
        }
    };
    metrics::set_active_rooms(state.directory.len());

    let user = params.into_user();
    let max_message_size = state.config.transport.max_message_size;

    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, remote, room, user, state))
        .into_response()
}

/// Handle an upgraded WebSocket for its whole life.
async fn handle_websocket(
    socket: WebSocket,
    remote: SocketAddr,
    room: Room,
    user: User,
    state: Arc<AppState>,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection = MeteredConnection::new(
        AxumConnection::new(socket, state.config.transport.max_message_size)
            .with_remote_addr(remote.to_string()),
    );
    let connection_id = connection.id().clone();
    debug!(
        connection = %connection_id,
        remote = ?connection.remote_addr(),
        room = %room.name(),
        user = %user.user_id,
        "WebSocket connected"
    );

    let session = match room.admit(Box::new(connection), user).await {
        Ok(session) => session,
        Err(e) => {
            warn!(connection = %connection_id, room = %room.name(), error = %e, "Admission failed");
            metrics::record_error("admit");
            return;
        }
    };

    let start = Instant::now();
    if let Err(e) = room.send_history(&session).await {
        debug!(session = %session.id(), error = %e, "History replay interrupted");
        return;
    }
    metrics::record_replay(start.elapsed().as_secs_f64());

    if let Err(e) = session.send_wait(state.directory.room_list_message()).await {
        debug!(session = %session.id(), error = %e, "Room list not delivered");
        return;
    }

    session.stopped().await;
    debug!(connection = %session.connection_id(), session = %session.id(), %remote, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_params_defaults() {
        let params: JoinParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.room, DEFAULT_ROOM);

        let user = params.into_user();
        assert!(user.user_id.starts_with("user_"));
        assert_eq!(user.user_name, user.user_id);
    }

    #[test]
    fn test_join_params_explicit_user() {
        let params = JoinParams {
            room: "attic".into(),
            user_id: Some("u1".into()),
            user_name: Some("Alice".into()),
        };
        let user = params.into_user();
        assert_eq!(user, User::new("u1", "Alice"));
    }

    #[test]
    fn test_empty_user_id_is_replaced() {
        let params = JoinParams {
            room: DEFAULT_ROOM.into(),
            user_id: Some(String::new()),
            user_name: None,
        };
        assert!(params.into_user().user_id.starts_with("user_"));
    }

    #[tokio::test]
    async fn test_state_without_storage() {
        let mut config = Config::default();
        config.storage.enabled = false;
        let state = AppState::new(config);
        assert_eq!(state.directory.restore().await.unwrap(), 0);
    }
}
