//! Configuration system for PageLink
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/pagelink/config.toml
//! - Linux: ~/.config/pagelink/config.toml
//! - Windows: %APPDATA%/pagelink/config.toml

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{DEFAULT_MAX_MESSAGE_SIZE, HIGH_WATERMARK_CHUNKS, HIGH_WATERMARK_FLOOR, PREVIEW_SIZE};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Request correlation settings
    pub session: SessionConfig,
    /// Chunking and flow control
    pub transfer: TransferConfig,
    /// Network settings
    pub network: NetworkConfig,
}

/// Request correlation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a requester waits for its reply
    pub request_timeout_secs: u64,
    /// How long the host waits for a channel named by a request to appear
    pub channel_wait_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            channel_wait_secs: 5,
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn channel_wait(&self) -> Duration {
        Duration::from_secs(self.channel_wait_secs)
    }
}

/// Chunking and flow control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Largest single channel message, used as the chunk size
    pub max_message_size: usize,
    /// Minimum high watermark for the sender's buffered amount
    pub high_watermark_floor: usize,
    /// Leading bytes per file in a preview payload
    pub preview_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            high_watermark_floor: HIGH_WATERMARK_FLOOR,
            preview_size: PREVIEW_SIZE,
        }
    }
}

impl TransferConfig {
    /// Watermarks for a given chunk size: (low, high)
    ///
    /// Low is a single chunk; high is eight chunks or the floor, whichever
    /// is larger.
    pub fn watermarks(&self, chunk_size: usize) -> (usize, usize) {
        let low = chunk_size;
        let high = std::cmp::max(
            chunk_size.saturating_mul(HIGH_WATERMARK_CHUNKS),
            self.high_watermark_floor,
        );
        (low, high)
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bind address for the offering peer
    pub bind: IpAddr,
    /// UDP port for the offering peer (0 picks a free port)
    pub port: u16,
    /// Keep-alive interval in seconds
    pub keepalive_secs: u64,
    /// Idle timeout in seconds
    pub idle_timeout_secs: u64,
    /// Connection attempt timeout per candidate address
    pub connect_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 4433,
            keepalive_secs: 25,
            idle_timeout_secs: 120,
            connect_timeout_secs: 10,
        }
    }
}

impl NetworkConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "pagelink", "pagelink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
}
