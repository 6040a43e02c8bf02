//! Configuration management for CrossClip
//!
//! This module handles loading, validating, and saving the TOML
//! configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{TransportConfig, DEFAULT_MAX_FRAME_SIZE};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "CROSSCLIP_CONFIG";

const MIN_FRAME_SIZE: usize = 1024;
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Room left in a frame for the JSON envelope around the clipboard text
const ENVELOPE_RESERVE: usize = 4 * 1024;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML rendering error
    #[error("Failed to render TOML: {0}")]
    Render(#[from] toml::ser::Error),

    /// Validation error
    #[error("Config validation failed: {0}")]
    Validation(String),

    /// No platform config directory
    #[error("Could not determine the configuration directory")]
    NoConfigDir,

    /// Refusing to clobber an existing file
    #[error("Config file {0} already exists. Use --force to overwrite.")]
    AlreadyExists(PathBuf),
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Fixed device id; a fresh `<hostname>-<nonce>` is generated per run if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// TCP port to accept peers on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Connection tuning
    #[serde(default)]
    pub network: NetworkConfig,

    /// Propagation settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Peer discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Largest frame body in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Per-peer outbound queue capacity
    #[serde(default = "default_queue")]
    pub outbound_queue: usize,

    /// Per-peer inbound queue capacity
    #[serde(default = "default_queue")]
    pub inbound_queue: usize,

    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u64,
}

/// Sync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Window after a clipboard write during which local changes are not broadcast
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Period of the liveness sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Largest clipboard text sent or accepted, in bytes
    #[serde(default = "default_max_content_size")]
    pub max_content_size: usize,

    /// How often the system clipboard is polled for changes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Announce and browse over mDNS
    #[serde(default = "default_true")]
    pub mdns: bool,

    /// Seconds between re-announcements of configured peers
    #[serde(default = "default_announce_interval_secs")]
    pub announce_interval_secs: u64,

    /// Manually configured peers
    #[serde(default)]
    pub peers: Vec<StaticPeer>,
}

/// A peer reachable at a fixed address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticPeer {
    pub device_id: String,
    /// `host:port`
    pub address: String,
}

impl std::str::FromStr for StaticPeer {
    type Err = ConfigError;

    /// Parse `ID=HOST:PORT`
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (device_id, address) = value
            .split_once('=')
            .ok_or_else(|| ConfigError::Validation(format!("peer '{}' must look like ID=HOST:PORT", value)))?;

        let peer = StaticPeer {
            device_id: device_id.trim().to_string(),
            address: address.trim().to_string(),
        };
        peer.validate()?;
        Ok(peer)
    }
}

impl StaticPeer {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.is_empty() {
            return Err(ConfigError::Validation("peer device_id must not be empty".to_string()));
        }
        match self.address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
            _ => Err(ConfigError::Validation(format!(
                "peer address '{}' must be HOST:PORT",
                self.address
            ))),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_queue() -> usize {
    100
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_cooldown_ms() -> u64 {
    500
}

fn default_sweep_interval_secs() -> u64 {
    15
}

fn default_max_content_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE - ENVELOPE_RESERVE
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_announce_interval_secs() -> u64 {
    30
}

// Default implementations
impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            outbound_queue: default_queue(),
            inbound_queue: default_queue(),
            connect_timeout_ms: default_timeout_ms(),
            handshake_timeout_ms: default_timeout_ms(),
            write_timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_content_size: default_max_content_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mdns: default_true(),
            announce_interval_secs: default_announce_interval_secs(),
            peers: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: None,
            listen_port: default_listen_port(),
            log_level: default_log_level(),
            network: NetworkConfig::default(),
            sync: SyncConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            max_frame_size: self.max_frame_size,
            outbound_queue: self.outbound_queue,
            inbound_queue: self.inbound_queue,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

impl SyncConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Checks in order:
    /// 1. Path from CROSSCLIP_CONFIG environment variable
    /// 2. `<config_dir>/crossclip/config.toml`
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_path() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration with optional custom path
    pub fn load_config(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml_str)?;
        config.validate_config()?;
        Ok(config)
    }

    /// Find configuration file path
    fn find_config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        Self::default_path().filter(|p| p.exists())
    }

    /// `<config_dir>/crossclip/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("crossclip").join("config.toml"))
    }

    /// Default tracing filter for this config; `verbose` forces debug
    pub fn log_filter(&self, verbose: bool) -> String {
        let level = if verbose { "debug" } else { self.log_level.trim() };
        format!("crossclip={}", level.to_ascii_lowercase())
    }

    /// Validate configuration values
    pub fn validate_config(&self) -> Result<(), ConfigError> {
        if self.log_level.trim().parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Validation(format!(
                "log_level '{}' must be one of trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if let Some(id) = &self.device_id {
            if id.trim().is_empty() {
                return Err(ConfigError::Validation("device_id must not be empty".to_string()));
            }
        }

        let net = &self.network;
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&net.max_frame_size) {
            return Err(ConfigError::Validation(format!(
                "max_frame_size must be between {} and {} bytes",
                MIN_FRAME_SIZE, MAX_FRAME_SIZE
            )));
        }
        if net.outbound_queue == 0 || net.inbound_queue == 0 {
            return Err(ConfigError::Validation("queue capacities must be at least 1".to_string()));
        }
        if net.connect_timeout_ms == 0 || net.handshake_timeout_ms == 0 || net.write_timeout_ms == 0 {
            return Err(ConfigError::Validation("timeouts must be greater than zero".to_string()));
        }

        let sync = &self.sync;
        if !(1..=300).contains(&sync.sweep_interval_secs) {
            return Err(ConfigError::Validation(
                "sweep_interval_secs must be between 1 and 300".to_string(),
            ));
        }
        if sync.max_content_size == 0 || sync.max_content_size > net.max_frame_size {
            return Err(ConfigError::Validation(format!(
                "max_content_size must be between 1 and max_frame_size ({})",
                net.max_frame_size
            )));
        }
        if sync.poll_interval_ms == 0 {
            return Err(ConfigError::Validation("poll_interval_ms must be greater than zero".to_string()));
        }

        if self.discovery.announce_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "announce_interval_secs must be greater than zero".to_string(),
            ));
        }
        for peer in &self.discovery.peers {
            peer.validate()?;
        }

        Ok(())
    }

    /// The configured device id, or a fresh `<hostname>-<8 hex>` one
    pub fn resolve_device_id(&self) -> String {
        match &self.device_id {
            Some(id) => id.clone(),
            None => generate_device_id(),
        }
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Validate configuration file at given path
    pub fn validate(path: &Path) -> Result<(), ConfigError> {
        Self::load_from_path(path).map(|_| ())
    }

    /// Write the commented example file to `path`
    pub fn generate_example_config(path: &Path, force: bool) -> Result<(), ConfigError> {
        if !force && path.exists() {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, Self::generate_example())?;
        Ok(())
    }

    /// Generate example configuration file
    pub fn generate_example() -> String {
        let config = Config::default();

        format!(
            r#"# CrossClip Configuration File
# Location: <config dir>/crossclip/config.toml

# Fixed device id (default: <hostname>-<random suffix> on every start)
# device_id = "laptop"

# TCP port to accept peers on
listen_port = {}

# Logging level (trace, debug, info, warn, error)
log_level = "{}"

# Connection settings
[network]
# Largest frame body in bytes
max_frame_size = {}
# Per-peer queue capacities
outbound_queue = {}
inbound_queue = {}
# Timeouts in milliseconds
connect_timeout_ms = {}
handshake_timeout_ms = {}
write_timeout_ms = {}

# Propagation settings
[sync]
# Local changes within this window after a clipboard write are not broadcast
cooldown_ms = {}
# How often dead peers are pruned and live ones pinged
sweep_interval_secs = {}
# Largest clipboard text sent or accepted
max_content_size = {}
# System clipboard polling period
poll_interval_ms = {}

# Peer discovery
[discovery]
# Announce and browse via mDNS
mdns = {}
# Seconds between re-announcements of the peers below
announce_interval_secs = {}

# Peers to reach without mDNS
# [[discovery.peers]]
# device_id = "desktop"
# address = "192.168.1.20:8080"
"#,
            config.listen_port,
            config.log_level,
            config.network.max_frame_size,
            config.network.outbound_queue,
            config.network.inbound_queue,
            config.network.connect_timeout_ms,
            config.network.handshake_timeout_ms,
            config.network.write_timeout_ms,
            config.sync.cooldown_ms,
            config.sync.sweep_interval_secs,
            config.sync.max_content_size,
            config.sync.poll_interval_ms,
            config.discovery.mdns,
            config.discovery.announce_interval_secs,
        )
    }
}

/// `<hostname>-<8 hex digit nonce>`
pub fn generate_device_id() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let hostname = if hostname.is_empty() {
        "crossclip".to_string()
    } else {
        hostname
    };
    format!("{}-{:08x}", hostname, rand::random::<u32>())
}
