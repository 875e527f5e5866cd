//! # huddle-transport
//!
//! Connection abstraction layer for the Huddle chat server.
//!
//! - **WebSocket** - axum upgrade, JSON text frames or MessagePack binary frames
//! - **Memory** - in-process duplex for tests and benchmarks
//!
//! ## Connection Abstraction
//!
//! Every transport implements [`Connection`], which splits into a
//! [`ConnectionReader`] and a [`ConnectionWriter`] so reading and writing can run
//! on separate tasks.
//!
//! ```rust,ignore
//! use huddle_transport::Connection;
//!
//! async fn echo(conn: Box<dyn Connection>) {
//!     let (mut reader, mut writer) = conn.split();
//!     while let Ok(Some(message)) = reader.recv().await {
//!         let _ = writer.send(&message).await;
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "axum")]
pub mod websocket;

pub use memory::{MemoryConnection, MemoryPeer};
pub use traits::{Connection, ConnectionId, ConnectionReader, ConnectionWriter, TransportError};

#[cfg(feature = "axum")]
pub use websocket::AxumConnection;
