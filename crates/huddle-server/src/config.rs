//! Server configuration.
//!
//! Configuration can be loaded from:
//! - The file named by `HUDDLE_CONFIG`
//! - A TOML file at one of the default paths
//! - Environment variables (`HUDDLE_HOST`, `HUDDLE_PORT`)

use anyhow::{bail, Context, Result};
use huddle_core::{DirectoryConfig, HubConfig, SlowConsumerPolicy};
use huddle_transport::websocket::DEFAULT_MAX_MESSAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "HUDDLE_CONFIG";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Room behaviour.
    #[serde(default)]
    pub hub: HubSettings,

    /// Room persistence.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Room behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Messages replayed to a joining user.
    #[serde(default = "default_history_replay_limit")]
    pub history_replay_limit: usize,

    /// Outbound queue length per session.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// What to do with a session that cannot keep up.
    #[serde(default)]
    pub slow_consumer: SlowConsumerPolicy,

    /// Maximum number of rooms.
    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,
}

/// Room persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Persist rooms to disk. When off, history lives in memory only.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory holding one JSON file per room. `~` is expanded.
    #[serde(default = "default_storage_dir")]
    pub dir: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("HUDDLE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("HUDDLE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_history_replay_limit() -> usize {
    huddle_core::config::DEFAULT_HISTORY_REPLAY_LIMIT
}

fn default_outbound_capacity() -> usize {
    huddle_core::config::DEFAULT_OUTBOUND_CAPACITY
}

fn default_max_rooms() -> usize {
    DirectoryConfig::default().max_rooms
}

fn default_storage_dir() -> String {
    "data/rooms".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            hub: HubSettings::default(),
            storage: StorageConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            history_replay_limit: default_history_replay_limit(),
            outbound_capacity: default_outbound_capacity(),
            slow_consumer: SlowConsumerPolicy::default(),
            max_rooms: default_max_rooms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_storage_dir(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl HubSettings {
    /// Directory configuration for these settings.
    #[must_use]
    pub fn directory_config(&self) -> DirectoryConfig {
        DirectoryConfig {
            max_rooms: self.max_rooms,
            hub: HubConfig {
                history_replay_limit: self.history_replay_limit,
                outbound_capacity: self.outbound_capacity,
                slow_consumer: self.slow_consumer,
                ..HubConfig::default()
            },
        }
    }
}

impl StorageConfig {
    /// Storage directory with `~` expanded.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.dir).as_ref())
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if `HUDDLE_CONFIG` names a missing file, or if the
    /// config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let expanded = shellexpand::tilde(&path);
            if !Path::new(expanded.as_ref()).exists() {
                bail!("{} points to a missing file: {}", CONFIG_ENV, path);
            }
            return Self::from_file(expanded.as_ref());
        }

        let config_paths = [
            "huddle.toml",
            "/etc/huddle/huddle.toml",
            "~/.config/huddle/huddle.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.hub.history_replay_limit, 100);
        assert_eq!(config.hub.slow_consumer, SlowConsumerPolicy::Disconnect);
        assert!(config.storage.enabled);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 8080,
            ..Config::default()
        };
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [hub]
            history_replay_limit = 20
            slow_consumer = "drop"

            [storage]
            enabled = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.hub.history_replay_limit, 20);
        assert_eq!(config.hub.outbound_capacity, 256);
        assert!(!config.storage.enabled);

        let directory = config.hub.directory_config();
        assert_eq!(directory.hub.history_replay_limit, 20);
        assert_eq!(directory.hub.slow_consumer, SlowConsumerPolicy::Drop);
        assert_eq!(directory.hub.mailbox_capacity, 1);
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huddle.toml");
        std::fs::write(
            &path,
            "port = 7000\n[transport]\nwebsocket_path = \"/chat\"\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.transport.websocket_path, "/chat");

        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_storage_path() {
        assert_eq!(StorageConfig::default().path(), PathBuf::from("data/rooms"));

        if let Ok(home) = std::env::var("HOME") {
            let storage = StorageConfig {
                enabled: true,
                dir: "~/huddle".into(),
            };
            assert_eq!(storage.path(), Path::new(&home).join("huddle"));
        }
    }
}
