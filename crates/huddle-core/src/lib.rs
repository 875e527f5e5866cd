//! # huddle-core
//!
//! Rooms, sessions and the room directory for the Huddle chat hub.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Room** - Per-room hub that serializes joins, leaves and broadcasts
//! - **Session** - One connected participant with its reader and writer tasks
//! - **RoomDirectory** - Name to room registry, created lazily
//! - **RoomStore** - Durable room history
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Session   │────▶│    Room     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                           │       │
//!                            ┌──────────────┘       ▼
//!                            ▼               ┌─────────────┐
//!                     ┌─────────────┐        │  RoomStore  │
//!                     │RoomDirectory│        └─────────────┘
//!                     └─────────────┘
//! ```

pub mod config;
pub mod directory;
pub mod room;
pub mod session;
pub mod store;

pub use config::{DirectoryConfig, HubConfig, SlowConsumerPolicy};
pub use directory::{DirectoryError, RoomDirectory};
pub use room::{validate_room_name, Room, RoomError, MAX_ROOM_NAME_LENGTH};
pub use session::{Session, SessionError, SessionHandler, SessionId, User};
pub use store::{JsonFileStore, MemoryStore, RoomRecord, RoomStore, StoreError};
