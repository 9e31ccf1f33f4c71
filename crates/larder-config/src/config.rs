//! Configuration structs with defaults and RON persistence.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use larder_session::{RoomSettings, WorldSettings};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name inside the config directory.
pub const CONFIG_FILE: &str = "config.ron";

/// `<platform config dir>/larder`, or `./larder` when the platform has none.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("larder")
}

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener, framing and timeout settings.
    pub network: NetworkConfig,
    /// Room sizing and disposal timing.
    pub room: RoomSettings,
    /// World bounds and seeding.
    pub world: WorldSettings,
    /// Logging settings.
    pub debug: DebugConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface to listen on.
    pub bind_address: String,
    /// Listening port.
    pub port: u16,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Idle connections are dropped after this many seconds.
    pub timeout_seconds: u32,
    /// Largest accepted frame payload.
    pub max_frame_bytes: u32,
    /// Payloads at least this large are LZ4-compressed.
    pub compression_threshold: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 2567,
            max_connections: 256,
            timeout_seconds: 30,
            max_frame_bytes: 1_048_576,
            compression_threshold: 512,
        }
    }
}

impl NetworkConfig {
    /// Listening socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_seconds))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log filter (e.g. "debug", "info,larder_net=trace").
    pub log_level: String,
    /// Directory for JSON log files in debug builds.
    pub log_dir: PathBuf,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
        }
    }
}

// --- Load / Save ---

impl Config {
    /// Loads `config.ron` from `config_dir`, writing defaults first if absent.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Writes this config to `config_dir/config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(4)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        ron::from_str(&contents).map_err(ConfigError::ParseError)
    }
}
