//! Configuration management for the capture server.
//!
//! This module handles loading, validation, and conversion of server
//! configuration from TOML files.

use anyhow::{Context, Result};
use capture_server::game::{GridSize, MAX_PLAYERS, MAX_ROOM_TTL, MIN_PLAYERS};
use capture_server::{RoomDefaults, ServerConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener and dispatch settings
    pub server: ServerSettings,
    /// Defaults for newly created rooms
    #[serde(default)]
    pub rooms: RoomSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Network address for the game listener (e.g., "127.0.0.1:8080")
    pub bind_address: String,
    /// Optional address for the JSON introspection endpoints
    #[serde(default)]
    pub admin_address: Option<String>,
    /// Maximum number of concurrent WebSocket connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds a client may take to send its upgrade request
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Upper bound on one multiplexer wait, in milliseconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    /// Readiness events handled per wait
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Seconds between room sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_max_connections() -> usize {
    1000
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_poll_timeout() -> u64 {
    100
}

fn default_max_events() -> usize {
    100
}

fn default_sweep_interval() -> u64 {
    30
}

/// Room defaults, used when the upgrade URL leaves a parameter out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSettings {
    pub default_players: usize,
    pub default_grid: GridSize,
    pub ttl_minutes: u64,
    pub update_buffer: usize,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            default_players: 2,
            default_grid: GridSize::Small,
            ttl_minutes: 25,
            update_buffer: 64,
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_address: "127.0.0.1:8080".to_string(),
                admin_address: None,
                max_connections: default_max_connections(),
                handshake_timeout_secs: default_handshake_timeout(),
                poll_timeout_ms: default_poll_timeout(),
                max_events: default_max_events(),
                sweep_interval_secs: default_sweep_interval(),
            },
            rooms: RoomSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration to `path`
    /// and returns it.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Converts the file configuration into the server's runtime configuration.
    pub fn to_server_config(&self) -> Result<ServerConfig> {
        let bind_address: SocketAddr = self
            .server
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind_address))?;
        let admin_address = self
            .server
            .admin_address
            .as_deref()
            .filter(|address| !address.is_empty())
            .map(|address| {
                address
                    .parse::<SocketAddr>()
                    .with_context(|| format!("Invalid admin address: {address}"))
            })
            .transpose()?;

        Ok(ServerConfig {
            bind_address,
            admin_address,
            max_connections: self.server.max_connections,
            handshake_timeout: Duration::from_secs(self.server.handshake_timeout_secs),
            poll_timeout: Duration::from_millis(self.server.poll_timeout_ms),
            max_events: self.server.max_events,
            sweep_interval: Duration::from_secs(self.server.sweep_interval_secs),
            rooms: RoomDefaults {
                capacity: self.rooms.default_players,
                grid: self.rooms.default_grid,
                ttl: Duration::from_secs(self.rooms.ttl_minutes.saturating_mul(60)),
                update_buffer: self.rooms.update_buffer,
            },
        })
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", &self.server.bind_address));
        }
        if let Some(admin) = self.server.admin_address.as_deref().filter(|a| !a.is_empty()) {
            if admin.parse::<SocketAddr>().is_err() {
                return Err(format!("Invalid admin address: {admin}"));
            }
        }

        if self.server.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }
        if self.server.poll_timeout_ms == 0 {
            return Err("poll_timeout_ms must be greater than 0".to_string());
        }
        if self.server.max_events == 0 {
            return Err("max_events must be greater than 0".to_string());
        }
        if self.server.sweep_interval_secs == 0 {
            return Err("sweep_interval_secs must be greater than 0".to_string());
        }

        if !(MIN_PLAYERS..=MAX_PLAYERS).contains(&self.rooms.default_players) {
            return Err(format!(
                "default_players must be between {MIN_PLAYERS} and {MAX_PLAYERS}"
            ));
        }
        if self.rooms.ttl_minutes == 0 {
            return Err("ttl_minutes must be greater than 0".to_string());
        }
        let max_ttl_minutes = MAX_ROOM_TTL.as_secs() / 60;
        if self.rooms.ttl_minutes > max_ttl_minutes {
            return Err(format!("ttl_minutes must be at most {max_ttl_minutes}"));
        }
        if self.rooms.update_buffer == 0 {
            return Err("update_buffer must be greater than 0".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.validate(), Ok(()));

        let server = config.to_server_config().unwrap();
        assert_eq!(server.bind_address, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(server.admin_address, None);
        assert_eq!(server.poll_timeout, Duration::from_millis(100));
        assert_eq!(server.max_events, 100);
        assert_eq!(server.rooms.ttl, Duration::from_secs(25 * 60));
        assert_eq!(server.rooms.capacity, 2);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.server.bind_address = "nowhere".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rooms.default_players = 9;
        assert!(config.validate().unwrap_err().contains("default_players"));

        let mut config = AppConfig::default();
        config.server.admin_address = Some("bad".to_string());
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rooms.ttl_minutes = u64::MAX;
        assert!(config.validate().unwrap_err().contains("ttl_minutes"));
        let server = config.to_server_config().unwrap();
        assert_eq!(server.rooms.ttl, Duration::from_secs(u64::MAX));

        let mut config = AppConfig::default();
        config.rooms.ttl_minutes = 7 * 24 * 60;
        assert_eq!(config.validate(), Ok(()));

        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().unwrap_err().contains("Invalid log level"));
    }

    #[tokio::test]
    async fn test_load_creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn test_load_from_existing_file() {
        let toml_content = r#"
[server]
bind_address = "0.0.0.0:3000"
admin_address = "127.0.0.1:3001"
max_connections = 50

[rooms]
default_players = 4
default_grid = "large"
ttl_minutes = 10
update_buffer = 16

[logging]
level = "debug"
json_format = true
"#;
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), toml_content).await.unwrap();

        let config = AppConfig::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(config.server.max_connections, 50);
        assert_eq!(config.server.poll_timeout_ms, 100);
        assert_eq!(config.rooms.default_grid, GridSize::Large);
        assert!(config.logging.json_format);
        assert_eq!(config.validate(), Ok(()));

        let server = config.to_server_config().unwrap();
        assert_eq!(server.admin_address, Some("127.0.0.1:3001".parse().unwrap()));
        assert_eq!(server.rooms.capacity, 4);
        assert_eq!(server.rooms.ttl, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_load_rejects_malformed_file() {
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), "[server\nbind_address = ").await.unwrap();

        assert!(AppConfig::load_from_file(temp_file.path()).await.is_err());
    }
}
