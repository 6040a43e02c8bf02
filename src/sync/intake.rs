//! Handoff from a handshaken connection to the running engine
//!
//! Both the listener and the dialer finish by calling [`Intake::admit`]: the
//! peer is registered, and a pump task forwards its inbound messages into
//! the engine's event queue until the connection ends.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::registry::{Admission, DuplicateConnection, Peer, PeerRegistry};
use crate::transport::{ConnectionId, Direction, Inbound, Message};

/// Something that happened on a peer connection
#[derive(Debug)]
pub enum PeerEvent {
    Connected {
        device_id: String,
        connection_id: ConnectionId,
        direction: Direction,
    },
    Message {
        device_id: String,
        connection_id: ConnectionId,
        message: Message,
    },
    Disconnected {
        device_id: String,
        connection_id: ConnectionId,
    },
}

#[derive(Clone)]
pub struct Intake {
    registry: PeerRegistry,
    events: mpsc::Sender<PeerEvent>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Intake {
    pub fn new(
        registry: PeerRegistry,
        events: mpsc::Sender<PeerEvent>,
        tasks: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            events,
            tasks,
            shutdown,
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Register `peer` and start forwarding its traffic
    ///
    /// A refused peer has its connection closed before the error is returned.
    pub async fn admit(&self, peer: Peer, inbound: Inbound) -> Result<(), DuplicateConnection> {
        let device_id = peer.device_id.clone();
        let connection_id = peer.connection.id();
        let direction = peer.direction();

        match self.registry.add_if_absent(peer).await {
            Ok(Admission::Inserted) => {}
            Ok(Admission::Superseded(old)) => {
                info!(
                    device = %device_id,
                    "{} connection supersedes {}",
                    direction,
                    old.connection.id()
                );
                old.connection.close();
            }
            Err(dup) => {
                debug!(device = %device_id, "refusing duplicate {} connection", direction);
                dup.rejected.connection.close();
                return Err(dup);
            }
        }

        info!(device = %device_id, direction = %direction, "peer connected");
        self.emit(PeerEvent::Connected {
            device_id: device_id.clone(),
            connection_id,
            direction,
        })
        .await;

        let pump = self.clone();
        self.tasks
            .spawn(async move { pump.forward(device_id, inbound).await });
        Ok(())
    }

    async fn forward(self, device_id: String, mut inbound: Inbound) {
        let connection_id = inbound.connection_id();
        while let Some(message) = inbound.recv().await {
            let delivered = self
                .emit(PeerEvent::Message {
                    device_id: device_id.clone(),
                    connection_id,
                    message,
                })
                .await;
            if !delivered {
                return;
            }
        }

        self.emit(PeerEvent::Disconnected {
            device_id,
            connection_id,
        })
        .await;
    }

    async fn emit(&self, event: PeerEvent) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }
}
