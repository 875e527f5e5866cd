//! # huddle-protocol
//!
//! Wire definitions for the Huddle chat server.
//!
//! Every exchange between a client and a room is a [`Message`]: a type tag, the
//! originating room, an opaque payload and, for directory listings, a list of rooms.
//!
//! ## Message Types
//!
//! - `text` / `image` / `file` - Chat content, kept in room history
//! - `userCount` - Member count of a room
//! - `over` - End of a history replay
//! - `roomList` - Directory of all rooms
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, Message};
//!
//! let message = Message::text("lobby", b"Hello, world!".to_vec());
//!
//! let json = codec::encode_json(&message).unwrap();
//! let decoded = codec::decode_json(&json).unwrap();
//! assert_eq!(message, decoded);
//! ```

pub mod codec;
pub mod message;

pub use codec::{decode, decode_json, encode, encode_json, ProtocolError};
pub use message::{Message, MessageKind, RoomSummary, UserCount};
