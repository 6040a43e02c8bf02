//! mDNS/DNS-SD service discovery implementation
//!
//! Announces `_crossclip._tcp.local.` with the device id in the `id` TXT
//! record and reports every resolved instance that carries one.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::{DiscoveredDevice, Discovery, DiscoveryError, BROWSE_QUEUE};

pub const SERVICE_TYPE: &str = "_crossclip._tcp.local.";

/// TXT key holding the device id
const ID_PROPERTY: &str = "id";

const BROWSE_POLL: Duration = Duration::from_millis(500);

fn mdns_error(err: mdns_sd::Error) -> DiscoveryError {
    DiscoveryError::Mdns(err.to_string())
}

/// mDNS-based service discovery
pub struct MdnsDiscovery {
    daemon: Mutex<Option<ServiceDaemon>>,
    registered: Mutex<Option<String>>,
}

impl MdnsDiscovery {
    pub fn new() -> Self {
        Self {
            daemon: Mutex::new(None),
            registered: Mutex::new(None),
        }
    }

    async fn daemon(&self) -> Result<ServiceDaemon, DiscoveryError> {
        let mut slot = self.daemon.lock().await;
        if let Some(daemon) = slot.as_ref() {
            return Ok(daemon.clone());
        }
        let daemon = ServiceDaemon::new().map_err(mdns_error)?;
        *slot = Some(daemon.clone());
        Ok(daemon)
    }

    /// Instance names may not contain dots
    fn instance_name(device_id: &str) -> String {
        device_id.replace('.', "-")
    }

    fn service_info(device_id: &str, port: u16) -> Result<ServiceInfo, DiscoveryError> {
        let addresses = local_addresses()?;
        if addresses.is_empty() {
            return Err(DiscoveryError::NoInterface(
                "no non-loopback address found".to_string(),
            ));
        }
        let ips = addresses
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let host = format!("{}.local.", Self::instance_name(&hostname));

        let mut properties = HashMap::new();
        properties.insert(ID_PROPERTY.to_string(), device_id.to_string());

        ServiceInfo::new(
            SERVICE_TYPE,
            &Self::instance_name(device_id),
            &host,
            ips.as_str(),
            port,
            Some(properties),
        )
        .map_err(mdns_error)
    }

    /// Turn a resolved service into a sighting
    fn sighting(info: &ServiceInfo) -> Option<DiscoveredDevice> {
        let device_id = info.get_property_val_str(ID_PROPERTY)?.to_string();
        if device_id.is_empty() {
            return None;
        }
        let ip = best_address(info.get_addresses().iter().copied())?;
        Some(DiscoveredDevice {
            device_id,
            ip,
            port: info.get_port(),
        })
    }
}

impl Default for MdnsDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

/// Local IP addresses (excluding loopback)
fn local_addresses() -> Result<Vec<IpAddr>, DiscoveryError> {
    let interfaces = if_addrs::get_if_addrs().map_err(|err| DiscoveryError::NoInterface(err.to_string()))?;
    Ok(interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .map(|iface| iface.ip())
        .collect())
}

/// Prefer IPv4, which every peer can route
fn best_address(addresses: impl Iterator<Item = IpAddr>) -> Option<IpAddr> {
    let mut fallback = None;
    for addr in addresses {
        if addr.is_ipv4() {
            return Some(addr);
        }
        fallback.get_or_insert(addr);
    }
    fallback
}

#[async_trait]
impl Discovery for MdnsDiscovery {
    async fn register(&self, device_id: &str, port: u16) -> Result<(), DiscoveryError> {
        let daemon = self.daemon().await?;
        let info = Self::service_info(device_id, port)?;
        let fullname = info.get_fullname().to_string();

        daemon.register(info).map_err(mdns_error)?;
        info!("announced {} on port {}", fullname, port);
        *self.registered.lock().await = Some(fullname);
        Ok(())
    }

    async fn browse(&self) -> Result<mpsc::Receiver<DiscoveredDevice>, DiscoveryError> {
        let daemon = self.daemon().await?;
        let events = daemon.browse(SERVICE_TYPE).map_err(mdns_error)?;
        let (tx, rx) = mpsc::channel(BROWSE_QUEUE);

        // The mdns-sd receiver is blocking; keep it off the runtime threads
        tokio::task::spawn_blocking(move || loop {
            match events.recv_timeout(BROWSE_POLL) {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    let Some(device) = Self::sighting(&info) else {
                        debug!("ignoring {} without a device id", info.get_fullname());
                        continue;
                    };
                    if tx.blocking_send(device).is_err() {
                        break;
                    }
                }
                Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                    debug!("{} left the network", fullname);
                }
                Ok(_) => {}
                Err(_) if events.is_disconnected() || tx.is_closed() => break,
                Err(_) => {}
            }
        });

        Ok(rx)
    }

    async fn unregister(&self) -> Result<(), DiscoveryError> {
        let Some(daemon) = self.daemon.lock().await.take() else {
            return Ok(());
        };

        if let Some(fullname) = self.registered.lock().await.take() {
            if let Err(err) = daemon.unregister(&fullname) {
                warn!("failed to withdraw {}: {}", fullname, err);
            }
        }
        daemon.shutdown().map_err(mdns_error)?;
        Ok(())
    }
}
