//! Process-wide room registry.
//!
//! The directory maps room names to running [`Room`] handles. Rooms are created
//! lazily on first use and live until removed or until shutdown; an empty room is
//! kept.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use huddle_protocol::{Message, RoomSummary};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DirectoryConfig;
use crate::room::{validate_room_name, Room};
use crate::store::{RoomStore, StoreError};

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoomName(&'static str),

    /// Maximum rooms reached.
    #[error("Maximum rooms reached")]
    MaxRoomsReached,

    /// Store failure while restoring rooms.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Registry of all rooms in the process.
pub struct RoomDirectory {
    rooms: DashMap<String, Room>,
    /// Rooms in the map plus slots reserved by creations in flight.
    count: AtomicUsize,
    store: Arc<dyn RoomStore>,
    config: DirectoryConfig,
}

impl RoomDirectory {
    /// Create a directory with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn RoomStore>) -> Self {
        Self::with_config(store, DirectoryConfig::default())
    }

    /// Create a directory with custom configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn RoomStore>, config: DirectoryConfig) -> Self {
        info!("Creating room directory with config: {:?}", config);
        Self {
            rooms: DashMap::new(),
            count: AtomicUsize::new(0),
            store,
            config,
        }
    }

    /// Start a room for every record in the store.
    ///
    /// Returns the number of rooms restored. Rooms that already exist are left
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn restore(&self) -> Result<usize, DirectoryError> {
        let records = self.store.load_all().await?;
        let mut restored = 0;

        for record in records {
            if let Err(reason) = validate_room_name(&record.room_name) {
                warn!(room = %record.room_name, reason, "Skipping stored room");
                continue;
            }

            if let Entry::Vacant(entry) = self.rooms.entry(record.room_name.clone()) {
                debug!(room = %record.room_name, messages = record.messages.len(), "Restoring room");
                entry.insert(Room::spawn(
                    record.room_name,
                    record.messages,
                    self.store.clone(),
                    self.config.hub.clone(),
                ));
                self.count.fetch_add(1, Ordering::SeqCst);
                restored += 1;
            }
        }

        info!(rooms = restored, "Rooms restored");
        Ok(restored)
    }

    /// Get a room by name, creating it if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the room limit is reached.
    pub fn get_or_create(&self, name: &str) -> Result<Room, DirectoryError> {
        validate_room_name(name).map_err(DirectoryError::InvalidRoomName)?;

        if let Some(room) = self.rooms.get(name) {
            return Ok(room.clone());
        }

        match self.rooms.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                // The entry holds a shard lock, so the limit is checked against
                // the counter rather than the map.
                let max = self.config.max_rooms;
                self.count
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < max).then_some(n + 1)
                    })
                    .map_err(|_| DirectoryError::MaxRoomsReached)?;
                debug!(room = %name, "Creating new room");
                let room = Room::spawn(
                    name,
                    Vec::new(),
                    self.store.clone(),
                    self.config.hub.clone(),
                );
                entry.insert(room.clone());
                Ok(room)
            }
        }
    }

    /// Get a room by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Room> {
        self.rooms.get(name).map(|r| r.value().clone())
    }

    /// Check if a room exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.rooms.contains_key(name)
    }

    /// Number of rooms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Whether there are no rooms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// All rooms with their member counts, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self.rooms.iter().map(|e| e.value().summary()).collect();
        rooms.sort_by(|a, b| a.room_name.cmp(&b.room_name));
        rooms
    }

    /// A `roomList` message describing every room.
    #[must_use]
    pub fn room_list_message(&self) -> Message {
        Message::room_list(self.list())
    }

    /// Remove a room and stop it.
    pub fn remove(&self, name: &str) -> Option<Room> {
        let (_, room) = self.rooms.remove(name)?;
        self.count.fetch_sub(1, Ordering::SeqCst);
        room.stop();
        info!(room = %name, "Room removed");
        Some(room)
    }

    /// Stop every room and wait for their loops to finish.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.rooms.iter().map(|e| e.key().clone()).collect();
        let rooms: Vec<Room> = names
            .iter()
            .filter_map(|name| self.rooms.remove(name))
            .map(|(_, room)| room)
            .collect();
        self.count.fetch_sub(rooms.len(), Ordering::SeqCst);

        for room in &rooms {
            room.stop();
        }
        for room in &rooms {
            room.stopped().await;
        }
        info!(rooms = rooms.len(), "Room directory shut down");
    }
}
