//! Fallback discovery from manually configured peers
//!
//! For networks where multicast is filtered. Every configured peer is
//! re-announced on a fixed interval so a device that comes up late, or whose
//! connection dropped, is picked up again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, warn};

use super::{DiscoveredDevice, Discovery, DiscoveryError, BROWSE_QUEUE};
use crate::config::{DiscoveryConfig, StaticPeer};

/// Discovery backed by a fixed peer list
pub struct StaticDiscovery {
    peers: Arc<Vec<StaticPeer>>,
    announce_interval: Duration,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<StaticPeer>, announce_interval: Duration) -> Self {
        Self {
            peers: Arc::new(peers),
            announce_interval,
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(
            config.peers.clone(),
            Duration::from_secs(config.announce_interval_secs.max(1)),
        )
    }

    pub fn peers(&self) -> &[StaticPeer] {
        &self.peers
    }
}

/// Resolve a `host:port` entry to a sighting
async fn resolve(peer: &StaticPeer) -> Result<DiscoveredDevice, DiscoveryError> {
    let mut addrs = lookup_host(peer.address.as_str())
        .await
        .map_err(|err| DiscoveryError::Resolve {
            address: peer.address.clone(),
            reason: err.to_string(),
        })?;

    let addr = addrs.next().ok_or_else(|| DiscoveryError::Resolve {
        address: peer.address.clone(),
        reason: "no addresses returned".to_string(),
    })?;

    Ok(DiscoveredDevice::new(peer.device_id.clone(), addr))
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn register(&self, _device_id: &str, _port: u16) -> Result<(), DiscoveryError> {
        // Configured peers already know where we are
        Ok(())
    }

    async fn browse(&self) -> Result<mpsc::Receiver<DiscoveredDevice>, DiscoveryError> {
        let (tx, rx) = mpsc::channel(BROWSE_QUEUE);
        let peers = self.peers.clone();
        let period = self.announce_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                for peer in peers.iter() {
                    match resolve(peer).await {
                        Ok(device) => {
                            if tx.send(device).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!(device = %peer.device_id, "{}", err),
                    }
                }
            }
            debug!("static discovery stopped");
        });

        Ok(rx)
    }

    async fn unregister(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }
}
