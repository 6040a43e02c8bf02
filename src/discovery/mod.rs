//! Service discovery for finding other CrossClip devices
//!
//! Backends announce this device and report sightings of others as
//! [`DiscoveredDevice`]s. The same device may be reported many times; the
//! engine deduplicates.

pub mod fallback;
pub mod mdns;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

pub use fallback::StaticDiscovery;
pub use mdns::MdnsDiscovery;

use crate::config::DiscoveryConfig;

/// Capacity of a browse channel
pub const BROWSE_QUEUE: usize = 64;

/// A device seen on the network
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredDevice {
    pub device_id: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl DiscoveredDevice {
    pub fn new(device_id: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            device_id: device_id.into(),
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(String),

    #[error("no usable network interface: {0}")]
    NoInterface(String),

    #[error("cannot resolve peer address '{address}': {reason}")]
    Resolve { address: String, reason: String },

    #[error("discovery is not registered")]
    NotRegistered,

    #[error("all discovery backends failed: {0}")]
    AllFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for service discovery implementations
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Announce this device
    async fn register(&self, device_id: &str, port: u16) -> Result<(), DiscoveryError>;

    /// Stream of sightings; may be called again after the stream ends
    async fn browse(&self) -> Result<mpsc::Receiver<DiscoveredDevice>, DiscoveryError>;

    /// Withdraw the announcement
    async fn unregister(&self) -> Result<(), DiscoveryError>;
}

/// Combined discovery service using multiple backends
pub struct DiscoveryService {
    backends: Vec<Arc<dyn Discovery>>,
}

impl DiscoveryService {
    pub fn new(backends: Vec<Arc<dyn Discovery>>) -> Self {
        Self { backends }
    }

    /// Build the backends enabled in `config`
    pub fn from_config(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let mut backends: Vec<Arc<dyn Discovery>> = Vec::new();
        if config.mdns {
            backends.push(Arc::new(MdnsDiscovery::new()));
        }
        if !config.peers.is_empty() {
            backends.push(Arc::new(StaticDiscovery::from_config(config)));
        }
        Ok(Self::new(backends))
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }
}

#[async_trait]
impl Discovery for DiscoveryService {
    async fn register(&self, device_id: &str, port: u16) -> Result<(), DiscoveryError> {
        let mut failures = Vec::new();
        for backend in &self.backends {
            if let Err(err) = backend.register(device_id, port).await {
                warn!("discovery backend failed to register: {}", err);
                failures.push(err.to_string());
            }
        }

        if !self.backends.is_empty() && failures.len() == self.backends.len() {
            return Err(DiscoveryError::AllFailed(failures.join("; ")));
        }
        Ok(())
    }

    async fn browse(&self) -> Result<mpsc::Receiver<DiscoveredDevice>, DiscoveryError> {
        let (tx, rx) = mpsc::channel(BROWSE_QUEUE);
        let mut failures = Vec::new();

        for backend in &self.backends {
            match backend.browse().await {
                Ok(mut sightings) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        while let Some(device) = sightings.recv().await {
                            if tx.send(device).await.is_err() {
                                break;
                            }
                        }
                    });
                }
                Err(err) => {
                    warn!("discovery backend failed to browse: {}", err);
                    failures.push(err.to_string());
                }
            }
        }

        if !self.backends.is_empty() && failures.len() == self.backends.len() {
            return Err(DiscoveryError::AllFailed(failures.join("; ")));
        }
        Ok(rx)
    }

    async fn unregister(&self) -> Result<(), DiscoveryError> {
        for backend in &self.backends {
            if let Err(err) = backend.unregister().await {
                warn!("discovery backend failed to unregister: {}", err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticPeer;
    use std::time::Duration;

    struct Broken;

    #[async_trait]
    impl Discovery for Broken {
        async fn register(&self, _: &str, _: u16) -> Result<(), DiscoveryError> {
            Err(DiscoveryError::Mdns("no multicast".into()))
        }

        async fn browse(&self) -> Result<mpsc::Receiver<DiscoveredDevice>, DiscoveryError> {
            Err(DiscoveryError::Mdns("no multicast".into()))
        }

        async fn unregister(&self) -> Result<(), DiscoveryError> {
            Ok(())
        }
    }

    fn static_backend() -> Arc<dyn Discovery> {
        let config = DiscoveryConfig {
            mdns: false,
            announce_interval_secs: 1,
            peers: vec![StaticPeer {
                device_id: "bob".into(),
                address: "127.0.0.1:9100".into(),
            }],
        };
        Arc::new(StaticDiscovery::from_config(&config))
    }

    #[test]
    fn test_discovered_device_addr() {
        let device = DiscoveredDevice::new("bob", "10.0.0.2:8080".parse().unwrap());
        assert_eq!(device.socket_addr().to_string(), "10.0.0.2:8080");
    }

    #[tokio::test]
    async fn test_one_working_backend_is_enough() {
        let service = DiscoveryService::new(vec![Arc::new(Broken), static_backend()]);
        service.register("alice", 8080).await.unwrap();

        let mut sightings = service.browse().await.unwrap();
        let device = tokio::time::timeout(Duration::from_secs(2), sightings.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device.device_id, "bob");
    }

    #[tokio::test]
    async fn test_all_backends_failing() {
        let service = DiscoveryService::new(vec![Arc::new(Broken)]);
        assert!(matches!(
            service.register("alice", 8080).await,
            Err(DiscoveryError::AllFailed(_))
        ));
        assert!(service.browse().await.is_err());
    }

    #[test]
    fn test_from_config_without_backends() {
        let config = DiscoveryConfig {
            mdns: false,
            announce_interval_secs: 30,
            peers: Vec::new(),
        };
        let service = DiscoveryService::from_config(&config).unwrap();
        assert_eq!(service.backend_count(), 0);
    }
}
