//! # CrossClip
//!
//! Peer-to-peer text clipboard synchronization over the local network.
//!
//! Devices find each other through mDNS (or a static peer list), hold one
//! framed TCP connection per peer and broadcast every local clipboard change
//! to all of them. Echoes are suppressed by device id and a short cooldown
//! after each clipboard write.

pub mod cli;
pub mod clipboard;
pub mod config;
pub mod discovery;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use sync::{EngineSettings, SyncEngine};

/// Result type alias for CrossClip operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for CrossClip operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Clipboard operation error
    #[error("Clipboard error: {0}")]
    Clipboard(#[from] clipboard::ClipboardError),

    /// Discovery error
    #[error("Discovery error: {0}")]
    Discovery(#[from] discovery::DiscoveryError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    /// Sync engine error
    #[error("Sync error: {0}")]
    Sync(#[from] sync::SyncError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
