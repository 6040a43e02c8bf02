//! Network transport layer for peer clipboard synchronization
//!
//! Frames [`Message`]s over any reliable byte stream, manages the per-peer
//! read/write tasks and runs the hello exchange that opens every connection.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub mod codec;
pub mod connection;
pub mod handshake;
pub mod protocol;

pub use codec::{MessageCodec, ProtocolError, DEFAULT_MAX_FRAME_SIZE};
pub use connection::{
    framed, Connection, ConnectionError, ConnectionId, ConnectionOptions, ConnectionState, Direction, FrameReader,
    FrameWriter, Inbound,
};
pub use handshake::{HandshakeError, LocalIdentity};
pub use protocol::{Message, MessageKind};

/// Transport layer errors with user-friendly messages
#[derive(Debug, Error)]
pub enum TransportError {
    /// Wire format violation
    #[error("CC001: Protocol error: {0}. The remote device may run an incompatible CrossClip version.")]
    Protocol(#[from] ProtocolError),

    /// Per-connection failure
    #[error("CC002: Connection error: {0}. Check if the remote device is online and reachable.")]
    Connection(#[from] ConnectionError),

    /// Hello exchange failed
    #[error("CC003: Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Listener could not bind
    #[error("CC004: Cannot listen on {addr}: {source}. Is another CrossClip instance using this port?")]
    Bind { addr: SocketAddr, source: io::Error },
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Any reliable, ordered, bidirectional byte stream
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Produces byte streams for peer connections
///
/// The engine only needs a stream; a TLS or otherwise authenticated channel
/// can be slotted in here without touching the framing or sync layers.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Open a channel to a remote listener
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxedStream>;

    /// Wrap a freshly accepted TCP stream
    async fn accept(&self, stream: TcpStream) -> io::Result<BoxedStream>;
}

/// Plain TCP channels
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpChannel;

#[async_trait]
impl ChannelFactory for TcpChannel {
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn accept(&self, stream: TcpStream) -> io::Result<BoxedStream> {
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Configuration for transport layer
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest frame body accepted or sent (default: 1 MiB)
    pub max_frame_size: usize,

    /// Per-connection outbound queue capacity
    pub outbound_queue: usize,

    /// Per-connection inbound queue capacity
    pub inbound_queue: usize,

    /// Dial timeout (default: 5 seconds)
    pub connect_timeout: Duration,

    /// Time allowed for the remote hello (default: 5 seconds)
    pub handshake_timeout: Duration,

    /// Deadline for a single frame write (default: 5 seconds)
    pub write_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            outbound_queue: 100,
            inbound_queue: 100,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl TransportConfig {
    /// Options for a connection spawned under this configuration
    pub fn connection_options(&self, direction: Direction) -> ConnectionOptions {
        ConnectionOptions {
            max_frame_size: self.max_frame_size,
            outbound_queue: self.outbound_queue,
            inbound_queue: self.inbound_queue,
            write_timeout: self.write_timeout,
            // The dialing side has not seen the remote hello yet
            expect_hello: direction == Direction::Outbound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.max_frame_size, 1024 * 1024);
        assert_eq!(config.outbound_queue, 100);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.write_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_only_dialed_connections_expect_hello() {
        let config = TransportConfig::default();
        assert!(config.connection_options(Direction::Outbound).expect_hello);
        assert!(!config.connection_options(Direction::Inbound).expect_hello);
    }

    #[tokio::test]
    async fn test_tcp_channel_roundtrip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = TcpChannel.accept(stream).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut client = TcpChannel.connect(addr).await.unwrap();
        client.write_all(b"clip").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"clip");
    }
}
