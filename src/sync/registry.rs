//! Table of live peer connections, keyed by device id
//!
//! At most one connection per remote device is kept. When two connections to
//! the same device race (both sides dialed at once), the one initiated by the
//! lexicographically smaller device id wins on both ends, so the pair always
//! settles on the same TCP stream.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::transport::{Connection, ConnectionError, ConnectionId, ConnectionState, Direction, HandshakeError, Message};

/// A registered remote device
#[derive(Debug, Clone)]
pub struct Peer {
    pub device_id: String,
    pub connection: Connection,
    /// Where the device's listener can be reached again after a disconnect
    pub reconnect_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
}

impl Peer {
    pub fn new(device_id: impl Into<String>, connection: Connection) -> Self {
        Self {
            device_id: device_id.into(),
            connection,
            reconnect_addr: None,
            connected_at: Utc::now(),
        }
    }

    pub fn with_reconnect_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.reconnect_addr = addr;
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.connection.remote_addr()
    }

    pub fn direction(&self) -> Direction {
        self.connection.direction()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Device that opened this peer's connection
    fn initiator<'a>(&'a self, local_id: &'a str) -> &'a str {
        match self.direction() {
            Direction::Outbound => local_id,
            Direction::Inbound => &self.device_id,
        }
    }

    fn holds_slot(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Handshaking | ConnectionState::Connected
        )
    }
}

/// Outcome of a successful [`PeerRegistry::add_if_absent`]
#[derive(Debug)]
pub enum Admission {
    Inserted,
    /// The new connection displaced this one; the caller closes it
    Superseded(Peer),
}

#[derive(Debug, Error)]
#[error("device '{device_id}' already has a live connection")]
pub struct DuplicateConnection {
    pub device_id: String,
    /// The refused peer, handed back so its connection can be closed
    pub rejected: Peer,
}

impl From<DuplicateConnection> for HandshakeError {
    fn from(dup: DuplicateConnection) -> Self {
        HandshakeError::Duplicate {
            device_id: dup.device_id,
        }
    }
}

/// Result of fanning a message out to every peer
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    /// Peers whose outbound queue was full
    pub skipped: Vec<String>,
    /// Peers that were already closing
    pub closed: Vec<String>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.skipped.len() + self.closed.len()
    }
}

#[derive(Clone)]
pub struct PeerRegistry {
    local_id: Arc<str>,
    peers: Arc<RwLock<BTreeMap<String, Peer>>>,
}

impl PeerRegistry {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: Arc::from(local_id.into()),
            peers: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Register `peer` unless its device already has a live connection
    pub async fn add_if_absent(&self, peer: Peer) -> Result<Admission, DuplicateConnection> {
        let mut peers = self.peers.write().await;

        let replace = match peers.get(&peer.device_id) {
            None => None,
            Some(existing) if !existing.holds_slot() => Some(true),
            Some(existing) => Some(self.supersedes(&peer, existing)),
        };

        match replace {
            None => {
                debug!(device = %peer.device_id, direction = %peer.direction(), "registered peer");
                peers.insert(peer.device_id.clone(), peer);
                Ok(Admission::Inserted)
            }
            Some(true) => {
                debug!(device = %peer.device_id, direction = %peer.direction(), "replacing peer connection");
                let old = peers.insert(peer.device_id.clone(), peer);
                // Present since the lookup above matched
                match old {
                    Some(old) => Ok(Admission::Superseded(old)),
                    None => Ok(Admission::Inserted),
                }
            }
            Some(false) => Err(DuplicateConnection {
                device_id: peer.device_id.clone(),
                rejected: peer,
            }),
        }
    }

    fn supersedes(&self, incoming: &Peer, existing: &Peer) -> bool {
        incoming.initiator(&self.local_id) < existing.initiator(&self.local_id)
    }

    pub async fn remove(&self, device_id: &str) -> Option<Peer> {
        self.peers.write().await.remove(device_id)
    }

    /// Remove the device only if it is still bound to `connection_id`
    pub async fn remove_connection(&self, device_id: &str, connection_id: ConnectionId) -> Option<Peer> {
        let mut peers = self.peers.write().await;
        match peers.get(device_id) {
            Some(peer) if peer.connection.id() == connection_id => peers.remove(device_id),
            _ => None,
        }
    }

    pub async fn get(&self, device_id: &str) -> Option<Peer> {
        self.peers.read().await.get(device_id).cloned()
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.peers.read().await.contains_key(device_id)
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn device_ids(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    /// Registered peers ordered by device id
    pub async fn snapshot(&self) -> Vec<Peer> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Queue `message` on every peer without waiting on any of them
    pub async fn broadcast(&self, message: &Message) -> BroadcastReport {
        let peers = self.peers.read().await;
        let mut report = BroadcastReport::default();

        for (device_id, peer) in peers.iter() {
            match peer.connection.send(message.clone()) {
                Ok(()) => report.delivered.push(device_id.clone()),
                Err(ConnectionError::QueueFull) => {
                    warn!(device = %device_id, "outbound queue full, skipping {}", message.kind);
                    report.skipped.push(device_id.clone());
                }
                Err(err) => {
                    debug!(device = %device_id, "not sending {}: {}", message.kind, err);
                    report.closed.push(device_id.clone());
                }
            }
        }

        report
    }

    /// Empty the table, returning everything that was registered
    pub async fn drain_all(&self) -> Vec<Peer> {
        let mut peers = self.peers.write().await;
        std::mem::take(&mut *peers).into_values().collect()
    }
}
