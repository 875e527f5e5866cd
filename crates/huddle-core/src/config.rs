//! Tuning knobs for rooms and the room directory.

use serde::{Deserialize, Serialize};

/// Number of messages replayed to a session that just joined.
pub const DEFAULT_HISTORY_REPLAY_LIMIT: usize = 100;

/// Default per-session outbound queue length.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// What a room does when a session's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlowConsumerPolicy {
    /// Stop the session. It leaves the room through the normal leave path.
    #[default]
    Disconnect,
    /// Skip this message for that session only.
    Drop,
}

/// Per-room configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Most recent messages replayed by `send_history`.
    pub history_replay_limit: usize,
    /// Outbound queue length of each session.
    pub outbound_capacity: usize,
    /// Policy applied when a session's outbound queue is full.
    pub slow_consumer: SlowConsumerPolicy,
    /// Capacity of the room's request mailbox.
    pub mailbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            history_replay_limit: DEFAULT_HISTORY_REPLAY_LIMIT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            slow_consumer: SlowConsumerPolicy::default(),
            mailbox_capacity: 1,
        }
    }
}

/// Room directory configuration.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Maximum number of rooms.
    pub max_rooms: usize,
    /// Configuration handed to every room.
    pub hub: HubConfig,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            max_rooms: 10_000,
            hub: HubConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.history_replay_limit, 100);
        assert_eq!(config.mailbox_capacity, 1);
        assert_eq!(config.slow_consumer, SlowConsumerPolicy::Disconnect);
    }

    #[test]
    fn test_policy_names() {
        let policy: SlowConsumerPolicy = serde_json::from_str(r#""drop""#).unwrap();
        assert_eq!(policy, SlowConsumerPolicy::Drop);
        assert_eq!(
            serde_json::to_string(&SlowConsumerPolicy::Disconnect).unwrap(),
            r#""disconnect""#
        );
    }
}
