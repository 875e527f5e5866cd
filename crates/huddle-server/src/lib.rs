//! # huddle-server
//!
//! The Huddle chat server: configuration, HTTP routes and metrics. The `huddle`
//! binary is a thin wrapper around [`handlers::run_server`].
//!
//! ## Routes
//!
//! - `GET /ws?room=<name>&user_id=<id>&user_name=<name>` - join a room over WebSocket
//! - `GET /rooms` - every room with its member count
//! - `GET /health` - liveness probe

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{app, run_server, AppState};
