//! Opens outbound connections to discovered devices

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::SinkExt;
use tracing::{debug, instrument};

use super::intake::Intake;
use super::registry::Peer;
use crate::transport::{
    framed, ChannelFactory, Connection, ConnectionError, Direction, HandshakeError, LocalIdentity, TransportConfig,
};

#[derive(Clone)]
pub struct Dialer {
    factory: Arc<dyn ChannelFactory>,
    identity: Arc<LocalIdentity>,
    config: TransportConfig,
    intake: Intake,
}

impl Dialer {
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        identity: Arc<LocalIdentity>,
        config: TransportConfig,
        intake: Intake,
    ) -> Self {
        Self {
            factory,
            identity,
            config,
            intake,
        }
    }

    /// Connect to `device_id` at `addr`, send our hello and register the peer
    ///
    /// The remote hello is checked by the connection itself: anything else
    /// arriving first closes it.
    pub async fn dial(&self, device_id: &str, addr: SocketAddr) -> Result<(), HandshakeError> {
        if device_id == self.identity.device_id {
            return Err(HandshakeError::SelfConnection);
        }

        let shutdown = self.intake.shutdown_token().clone();
        tokio::select! {
            _ = shutdown.cancelled() => Err(HandshakeError::Cancelled),
            result = self.establish(device_id, addr) => result,
        }
    }

    #[instrument(name = "outbound_handshake", skip(self))]
    async fn establish(&self, device_id: &str, addr: SocketAddr) -> Result<(), HandshakeError> {
        debug!(device = %device_id, %addr, "dialing");

        let stream = tokio::time::timeout(self.config.connect_timeout, self.factory.connect(addr))
            .await
            .map_err(|_| ConnectionError::ConnectTimeout { addr })?
            .map_err(|source| ConnectionError::Connect { addr, source })?;

        let (reader, mut writer) = framed(stream, self.config.max_frame_size);
        tokio::time::timeout(self.config.write_timeout, writer.send(self.identity.hello()))
            .await
            .map_err(|_| ConnectionError::WriteTimeout(self.config.write_timeout))??;

        let (connection, inbound) = Connection::spawn(
            reader,
            writer,
            addr,
            Direction::Outbound,
            self.config.connection_options(Direction::Outbound),
            self.intake.tasks(),
            self.intake.shutdown_token(),
        );

        let peer = Peer::new(device_id, connection).with_reconnect_addr(Some(addr));
        self.intake.admit(peer, inbound).await?;
        Ok(())
    }
}
