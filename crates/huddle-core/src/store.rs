//! Room persistence.
//!
//! A room writes its full state after every persistable message. The hub treats
//! the store as best effort: a failed save is logged and the room carries on.

use async_trait::async_trait;
use dashmap::DashMap;
use huddle_protocol::Message;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

use crate::room::validate_room_name;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Room name cannot be used as a storage key.
    #[error("Invalid room name: {0}")]
    InvalidRoomName(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The persisted state of one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    /// Room name.
    pub room_name: String,
    /// Full message history, oldest first.
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomRecordRef<'a> {
    room_name: &'a str,
    messages: &'a [Message],
}

/// Backing storage for room history.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Durably write a room's full state, replacing what was there.
    async fn save(&self, room_name: &str, messages: &[Message]) -> Result<(), StoreError>;

    /// Load every stored room.
    async fn load_all(&self) -> Result<Vec<RoomRecord>, StoreError>;
}

/// One JSON file per room in a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `dir`. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Get the storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, room_name: &str) -> Result<PathBuf, StoreError> {
        validate_room_name(room_name).map_err(StoreError::InvalidRoomName)?;
        Ok(self.dir.join(format!("{room_name}.json")))
    }
}

#[async_trait]
impl RoomStore for JsonFileStore {
    async fn save(&self, room_name: &str, messages: &[Message]) -> Result<(), StoreError> {
        let path = self.path_for(room_name)?;
        let data = serde_json::to_vec(&RoomRecordRef {
            room_name,
            messages,
        })?;

        tokio::fs::create_dir_all(&self.dir).await?;

        // Write then rename so a crash never leaves a half-written file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(room = %room_name, messages = messages.len(), "Room saved");
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<RoomRecord>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let data = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<RoomRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable room file");
                }
            }
        }

        records.sort_by(|a, b| a.room_name.cmp(&b.room_name));
        Ok(records)
    }
}

/// Keeps room state in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: DashMap<String, Vec<Message>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with records.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = RoomRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.rooms.insert(record.room_name, record.messages);
        }
        store
    }

    /// Get the stored history of a room.
    #[must_use]
    pub fn get(&self, room_name: &str) -> Option<Vec<Message>> {
        self.rooms.get(room_name).map(|m| m.value().clone())
    }

    /// Number of successful saves since creation.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn save(&self, room_name: &str, messages: &[Message]) -> Result<(), StoreError> {
        self.rooms.insert(room_name.to_string(), messages.to_vec());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<RoomRecord>, StoreError> {
        let mut records: Vec<RoomRecord> = self
            .rooms
            .iter()
            .map(|e| RoomRecord {
                room_name: e.key().clone(),
                messages: e.value().clone(),
            })
            .collect();
        records.sort_by(|a, b| a.room_name.cmp(&b.room_name));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_json_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("rooms"));

        let messages = vec![
            Message::text("lobby", b"hi".to_vec()),
            Message::image("lobby", vec![0x89, 0x50, 0x4e, 0x47]),
        ];
        store.save("lobby", &messages).await.unwrap();
        store.save("attic", &[]).await.unwrap();

        let records = store.load_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].room_name, "attic");
        assert!(records[0].messages.is_empty());
        assert_eq!(records[1].room_name, "lobby");
        assert_eq!(records[1].messages, messages);
    }

    #[tokio::test]
    async fn test_json_store_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        store
            .save("lobby", &[Message::text("lobby", b"one".to_vec())])
            .await
            .unwrap();
        store
            .save(
                "lobby",
                &[
                    Message::text("lobby", b"one".to_vec()),
                    Message::text("lobby", b"two".to_vec()),
                ],
            )
            .await
            .unwrap();

        let records = store.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].messages.len(), 2);
        assert!(!dir.path().join("lobby.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_json_store_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store
            .save("lobby", &[Message::text("lobby", b"hi".to_vec())])
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("lobby.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["roomName"], "lobby");
        assert_eq!(json["messages"][0]["type"], "text");
        assert_eq!(json["messages"][0]["data"], "aGk=");
    }

    #[tokio::test]
    async fn test_json_store_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        assert!(matches!(
            store.save("../escape", &[]).await,
            Err(StoreError::InvalidRoomName(_))
        ));
    }

    #[tokio::test]
    async fn test_json_store_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("never-created"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_store_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let store = JsonFileStore::new(dir.path());
        store.save("lobby", &[]).await.unwrap();

        let records = store.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].room_name, "lobby");
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::with_records([RoomRecord {
            room_name: "lobby".into(),
            messages: vec![Message::text("lobby", b"old".to_vec())],
        }]);
        assert_eq!(store.get("lobby").unwrap().len(), 1);

        store.save("attic", &[]).await.unwrap();
        assert_eq!(store.save_count(), 1);

        let records = store.load_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].room_name, "attic");
    }
}
