//! Message types for the Huddle protocol.
//!
//! A [`Message`] is the single unit exchanged with clients, fanned out inside a room
//! and written to the room store. The JSON form is:
//!
//! ```json
//! {"type": "text", "roomName": "lobby", "data": "aGk=", "chatRoomList": null}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message type tags.
///
/// Only [`MessageKind::Text`], [`MessageKind::Image`] and [`MessageKind::File`] are
/// kept in room history. Everything else is signalling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Plain chat text.
    Text,
    /// Image payload.
    Image,
    /// File payload.
    File,
    /// End of a history replay.
    Over,
    /// Directory listing of all rooms.
    RoomList,
    /// Number of members in a room.
    UserCount,
    /// Any tag this version does not know about. Passed through untouched.
    Other(String),
}

impl MessageKind {
    /// Get the wire tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::Over => "over",
            MessageKind::RoomList => "roomList",
            MessageKind::UserCount => "userCount",
            MessageKind::Other(tag) => tag,
        }
    }

    /// Whether messages of this kind are appended to history and persisted.
    #[must_use]
    pub fn is_persistable(&self) -> bool {
        matches!(
            self,
            MessageKind::Text | MessageKind::Image | MessageKind::File
        )
    }
}

impl From<String> for MessageKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "text" => MessageKind::Text,
            "image" => MessageKind::Image,
            "file" => MessageKind::File,
            "over" => MessageKind::Over,
            "roomList" => MessageKind::RoomList,
            "userCount" => MessageKind::UserCount,
            _ => MessageKind::Other(tag),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> String {
        match kind {
            MessageKind::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one room, as carried in a `roomList` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    /// Room name.
    pub room_name: String,
    /// Sessions currently registered in the room.
    pub user_count: usize,
}

/// Payload of a `userCount` message.
///
/// Written as `{"UserCount":n,"RoomName":".."}`, the shape existing clients read.
/// The camelCase spelling is accepted on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserCount {
    /// Number of registered sessions.
    #[serde(alias = "userCount")]
    pub user_count: usize,
    /// Room the count belongs to.
    #[serde(alias = "roomName")]
    pub room_name: String,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Type tag.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Room the message originated in.
    #[serde(rename = "roomName", default)]
    pub room_name: String,
    /// Opaque payload.
    #[serde(default, with = "data")]
    pub data: Vec<u8>,
    /// Room directory listing, only set on `roomList` messages.
    #[serde(
        rename = "chatRoomList",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub chat_room_list: Option<Vec<RoomSummary>>,
}

impl Message {
    /// Create a message of any kind.
    #[must_use]
    pub fn new(kind: MessageKind, room_name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            room_name: room_name.into(),
            data: data.into(),
            chat_room_list: None,
        }
    }

    /// Create a text message.
    #[must_use]
    pub fn text(room_name: impl Into<String>, text: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Text, room_name, text)
    }

    /// Create an image message.
    #[must_use]
    pub fn image(room_name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Image, room_name, data)
    }

    /// Create a file message.
    #[must_use]
    pub fn file(room_name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::File, room_name, data)
    }

    /// Create the marker that terminates a history replay.
    #[must_use]
    pub fn history_complete(room_name: impl Into<String>) -> Self {
        Self::new(MessageKind::Over, room_name, Vec::new())
    }

    /// Create a member count notification.
    ///
    /// The count is carried as JSON in `data`.
    #[must_use]
    pub fn user_count(room_name: impl Into<String>, count: usize) -> Self {
        let room_name = room_name.into();
        let payload = UserCount {
            user_count: count,
            room_name: room_name.clone(),
        };
        // Serializing a struct of a usize and a String cannot fail.
        let data = serde_json::to_vec(&payload).unwrap_or_default();
        Self::new(MessageKind::UserCount, room_name, data)
    }

    /// Create a room directory listing.
    #[must_use]
    pub fn room_list(rooms: Vec<RoomSummary>) -> Self {
        Self {
            kind: MessageKind::RoomList,
            room_name: String::new(),
            data: Vec::new(),
            chat_room_list: Some(rooms),
        }
    }

    /// Whether this message belongs in room history.
    #[must_use]
    pub fn is_persistable(&self) -> bool {
        self.kind.is_persistable()
    }

    /// Decode the payload of a `userCount` message.
    ///
    /// Returns `None` for other kinds or a malformed payload.
    #[must_use]
    pub fn as_user_count(&self) -> Option<UserCount> {
        if self.kind != MessageKind::UserCount {
            return None;
        }
        serde_json::from_slice(&self.data).ok()
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.data.len()
    }
}

/// `data` is base64 text in human-readable formats and raw bytes otherwise.
mod data {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&STANDARD.encode(data))
        } else {
            serde_bytes::serialize(data, serializer)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let encoded = Option::<String>::deserialize(deserializer)?;
            match encoded {
                Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
                None => Ok(Vec::new()),
            }
        } else {
            serde_bytes::deserialize(deserializer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(MessageKind::from("text".to_string()), MessageKind::Text);
        assert_eq!(MessageKind::from("roomList".to_string()), MessageKind::RoomList);
        assert_eq!(
            MessageKind::from("typing".to_string()),
            MessageKind::Other("typing".to_string())
        );
        assert_eq!(String::from(MessageKind::UserCount), "userCount");
        assert_eq!(MessageKind::Over.to_string(), "over");
    }

    #[test]
    fn test_persistable_kinds() {
        assert!(MessageKind::Text.is_persistable());
        assert!(MessageKind::Image.is_persistable());
        assert!(MessageKind::File.is_persistable());
        assert!(!MessageKind::Over.is_persistable());
        assert!(!MessageKind::UserCount.is_persistable());
        assert!(!MessageKind::RoomList.is_persistable());
        assert!(!MessageKind::Other("typing".into()).is_persistable());
    }

    #[test]
    fn test_json_shape() {
        let msg = Message::text("lobby", b"hi".to_vec());
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "text");
        assert_eq!(json["roomName"], "lobby");
        assert_eq!(json["data"], "aGk=");
        assert!(json.get("chatRoomList").is_none());
    }

    #[test]
    fn test_missing_fields_default() {
        let msg: Message = serde_json::from_str(r#"{"type":"over"}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Over);
        assert!(msg.room_name.is_empty());
        assert!(msg.data.is_empty());

        let msg: Message = serde_json::from_str(r#"{"type":"text","data":null}"#).unwrap();
        assert!(msg.data.is_empty());
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let result = serde_json::from_str::<Message>(r#"{"type":"text","data":"!!"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_user_count_payload() {
        let msg = Message::user_count("lobby", 2);
        assert_eq!(msg.kind, MessageKind::UserCount);

        let count = msg.as_user_count().unwrap();
        assert_eq!(count.user_count, 2);
        assert_eq!(count.room_name, "lobby");

        let json: serde_json::Value = serde_json::from_slice(&msg.data).unwrap();
        assert_eq!(json["UserCount"], 2);
        assert_eq!(json["RoomName"], "lobby");
        assert!(json.get("userCount").is_none());

        assert!(Message::text("lobby", b"2".to_vec()).as_user_count().is_none());
    }

    #[test]
    fn test_user_count_accepts_camel_case() {
        let msg = Message::new(
            MessageKind::UserCount,
            "lobby",
            br#"{"userCount":4,"roomName":"lobby"}"#.to_vec(),
        );
        let count = msg.as_user_count().unwrap();
        assert_eq!(count.user_count, 4);
        assert_eq!(count.room_name, "lobby");
    }

    #[test]
    fn test_room_list() {
        let msg = Message::room_list(vec![RoomSummary {
            room_name: "lobby".into(),
            user_count: 3,
        }]);
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "roomList");
        assert_eq!(json["chatRoomList"][0]["roomName"], "lobby");
        assert_eq!(json["chatRoomList"][0]["userCount"], 3);
    }
}
