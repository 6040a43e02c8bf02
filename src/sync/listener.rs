//! Accepts inbound peer connections
//!
//! Every accepted stream gets its own handshake task, so a slow or silent
//! client never delays the next accept.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument, warn};

use super::intake::Intake;
use super::registry::Peer;
use crate::transport::handshake::read_hello;
use crate::transport::{
    framed, ChannelFactory, Connection, Direction, HandshakeError, LocalIdentity, TransportConfig, TransportError,
};

pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    factory: Arc<dyn ChannelFactory>,
    config: TransportConfig,
    intake: Intake,
}

impl Listener {
    /// Bind the listening socket
    ///
    /// Failure here is fatal to the engine.
    pub async fn bind(
        addr: SocketAddr,
        factory: Arc<dyn ChannelFactory>,
        config: TransportConfig,
        intake: Intake,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        info!("listening for peers on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            factory,
            config,
            intake,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until shutdown, greeting peers as `identity`
    pub async fn run(self, identity: Arc<LocalIdentity>) {
        let shutdown = self.intake.shutdown_token().clone();

        loop {
            let (stream, remote) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("accept failed: {}", err);
                        // Typically fd exhaustion; give it a moment to clear
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            debug!(%remote, "accepted connection");
            let session = Session {
                factory: self.factory.clone(),
                identity: identity.clone(),
                config: self.config.clone(),
                intake: self.intake.clone(),
            };
            self.intake.tasks().spawn(async move {
                if let Err(err) = session.accept(stream, remote).await {
                    debug!(%remote, "inbound handshake failed: {}", err);
                }
            });
        }

        debug!("listener on {} stopped", self.local_addr);
    }
}

struct Session {
    factory: Arc<dyn ChannelFactory>,
    identity: Arc<LocalIdentity>,
    config: TransportConfig,
    intake: Intake,
}

impl Session {
    #[instrument(name = "inbound_handshake", skip(self, stream))]
    async fn accept(self, stream: TcpStream, remote: SocketAddr) -> Result<(), HandshakeError> {
        let shutdown = self.intake.shutdown_token().clone();
        let limit = self.config.handshake_timeout;

        // Channel setup and the hello share one deadline
        let handshake = async {
            let stream = self.factory.accept(stream).await?;
            let (mut reader, writer) = framed(stream, self.config.max_frame_size);
            let hello = read_hello(&mut reader, limit).await?;
            Ok::<_, HandshakeError>((reader, writer, hello))
        };
        let (reader, writer, hello) = tokio::select! {
            _ = shutdown.cancelled() => return Err(HandshakeError::Cancelled),
            result = tokio::time::timeout(limit, handshake) => {
                result.map_err(|_| HandshakeError::Timeout(limit))??
            }
        };
        if hello.device_id == self.identity.device_id {
            return Err(HandshakeError::SelfConnection);
        }

        let (connection, inbound) = Connection::spawn(
            reader,
            writer,
            remote,
            Direction::Inbound,
            self.config.connection_options(Direction::Inbound),
            self.intake.tasks(),
            &shutdown,
        );

        // Queued ahead of anything a broadcast could add once registered
        if let Err(err) = connection.send(self.identity.hello()) {
            connection.close();
            return Err(err.into());
        }

        let reconnect_addr = hello
            .listen_port()
            .map(|port| SocketAddr::new(remote.ip(), port));
        let peer = Peer::new(hello.device_id, connection).with_reconnect_addr(reconnect_addr);

        self.intake.admit(peer, inbound).await?;
        Ok(())
    }
}
