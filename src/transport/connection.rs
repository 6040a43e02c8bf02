//! One live peer connection
//!
//! A [`Connection`] is a cheap, clonable handle. Behind it a writer task
//! drains a bounded outbound queue onto the stream and a reader task feeds a
//! bounded inbound queue consumed through [`Inbound`]. Whichever task sees
//! the stream fail closes the whole connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::codec::{MessageCodec, ProtocolError};
use super::protocol::{Message, MessageKind};
use super::BoxedStream;

pub type ConnectionId = Uuid;

pub type FrameReader = FramedRead<ReadHalf<BoxedStream>, MessageCodec>;
pub type FrameWriter = FramedWrite<WriteHalf<BoxedStream>, MessageCodec>;

/// Split a stream into framed halves
pub fn framed(stream: BoxedStream, max_frame_size: usize) -> (FrameReader, FrameWriter) {
    let (read, write) = tokio::io::split(stream);
    (
        FramedRead::new(read, MessageCodec::new(max_frame_size)),
        FramedWrite::new(write, MessageCodec::new(max_frame_size)),
    )
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,

    #[error("outbound queue is full")]
    QueueFull,

    #[error("connecting to {addr} timed out")]
    ConnectTimeout { addr: SocketAddr },

    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Connection lifecycle
///
/// Transitions only move forward; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting = 0,
    Handshaking = 1,
    Connected = 2,
    Draining = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Handshaking,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener
    Inbound,
    /// Dialed by us
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub max_frame_size: usize,
    pub outbound_queue: usize,
    pub inbound_queue: usize,
    pub write_timeout: Duration,
    /// Close unless the first inbound frame is a `device_hello`
    pub expect_hello: bool,
}

struct Shared {
    id: ConnectionId,
    remote_addr: SocketAddr,
    direction: Direction,
    established_at: DateTime<Utc>,
    state: AtomicU8,
    outbound: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    drain: CancellationToken,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` unless already past it
    fn advance(&self, next: ConnectionState) -> ConnectionState {
        let prev = self.state.fetch_max(next as u8, Ordering::AcqRel);
        ConnectionState::from_u8(prev)
    }

    fn close(&self, reason: &str) {
        if self.advance(ConnectionState::Closed) != ConnectionState::Closed {
            info!(
                connection = %self.id,
                remote = %self.remote_addr,
                "connection closed: {}",
                reason
            );
        }
        self.shutdown.cancel();
    }
}

/// Handle to a running peer connection
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

/// Receiving side of a connection's inbound queue
pub struct Inbound {
    connection_id: ConnectionId,
    receiver: mpsc::Receiver<Message>,
}

impl Inbound {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Next decoded message, or `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

impl Connection {
    /// Start the reader and writer tasks for an established stream
    ///
    /// The connection's lifetime is bounded by `parent`: cancelling it closes
    /// the connection. Both tasks are spawned on `tasks`.
    pub fn spawn(
        reader: FrameReader,
        writer: FrameWriter,
        remote_addr: SocketAddr,
        direction: Direction,
        options: ConnectionOptions,
        tasks: &TaskTracker,
        parent: &CancellationToken,
    ) -> (Connection, Inbound) {
        let (outbound_tx, outbound_rx) = mpsc::channel(options.outbound_queue.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_queue.max(1));

        let initial = if options.expect_hello {
            ConnectionState::Handshaking
        } else {
            ConnectionState::Connected
        };

        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            remote_addr,
            direction,
            established_at: Utc::now(),
            state: AtomicU8::new(initial as u8),
            outbound: outbound_tx,
            shutdown: parent.child_token(),
            drain: CancellationToken::new(),
        });

        debug!(
            connection = %shared.id,
            remote = %remote_addr,
            %direction,
            "connection established"
        );

        tasks.spawn(write_loop(
            shared.clone(),
            writer,
            outbound_rx,
            options.write_timeout,
        ));
        tasks.spawn(read_loop(shared.clone(), reader, inbound_tx, options.expect_hello));

        let inbound = Inbound {
            connection_id: shared.id,
            receiver: inbound_rx,
        };
        (Connection { shared }, inbound)
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.shared.established_at
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Whether the connection can still carry traffic
    pub fn is_alive(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Handshaking | ConnectionState::Connected
        ) && !self.shared.shutdown.is_cancelled()
    }

    /// Queue a message without waiting
    ///
    /// Fails with [`ConnectionError::QueueFull`] when the writer is behind and
    /// [`ConnectionError::Closed`] once the connection is shutting down.
    pub fn send(&self, message: Message) -> Result<(), ConnectionError> {
        if self.state() >= ConnectionState::Draining {
            return Err(ConnectionError::Closed);
        }
        self.enqueue(message)
    }

    fn enqueue(&self, message: Message) -> Result<(), ConnectionError> {
        self.shared.outbound.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Queue `bye` behind any pending messages, flush, then close
    pub fn drain(&self, bye: Message) {
        let prev = self.shared.advance(ConnectionState::Draining);
        if prev >= ConnectionState::Draining {
            return;
        }
        if let Err(err) = self.enqueue(bye) {
            debug!(connection = %self.id(), "cannot queue goodbye: {}", err);
        }
        self.shared.drain.cancel();
    }

    /// Close immediately; calling it again has no effect
    pub fn close(&self) {
        self.shared.close("closed locally");
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("remote_addr", &self.shared.remote_addr)
            .field("direction", &self.shared.direction)
            .field("state", &self.state())
            .finish()
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: FrameWriter,
    mut queue: mpsc::Receiver<Message>,
    write_timeout: Duration,
) {
    let reason = loop {
        let message = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break "shutdown",
            next = queue.recv() => match next {
                Some(message) => message,
                None => break "outbound queue dropped",
            },
            _ = shared.drain.cancelled() => break "drained",
        };

        let kind = message.kind.clone();
        match tokio::time::timeout(write_timeout, writer.send(message)).await {
            Ok(Ok(())) => debug!(connection = %shared.id, "sent {}", kind),
            Ok(Err(ProtocolError::FrameTooLarge { size, max })) => {
                // Nothing reached the stream, so the connection is still usable
                warn!(
                    connection = %shared.id,
                    "dropping {} of {} bytes (limit {})",
                    kind,
                    size,
                    max
                );
            }
            Ok(Err(err)) => {
                warn!(connection = %shared.id, "write failed: {}", err);
                break "write failed";
            }
            Err(_) => {
                warn!(
                    connection = %shared.id,
                    "write of {} exceeded {:?}",
                    kind,
                    write_timeout
                );
                break "write timed out";
            }
        }
    };

    shared.close(reason);
    // Best effort FIN so the remote reader sees end of stream
    let _ = tokio::time::timeout(write_timeout, writer.close()).await;
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: FrameReader,
    inbound: mpsc::Sender<Message>,
    mut expect_hello: bool,
) {
    let reason = loop {
        let frame = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break "shutdown",
            frame = reader.next() => frame,
        };

        let message = match frame {
            None => break "closed by peer",
            Some(Err(err)) => {
                warn!(connection = %shared.id, "stream error: {}", err);
                break "stream error";
            }
            Some(Ok(Err(err))) if expect_hello => {
                warn!(connection = %shared.id, "invalid first frame: {}", err);
                break "protocol violation";
            }
            Some(Ok(Err(err))) => {
                warn!(connection = %shared.id, "dropping malformed frame: {}", err);
                continue;
            }
            Some(Ok(Ok(message))) => message,
        };

        if expect_hello {
            if message.kind != MessageKind::DeviceHello {
                warn!(
                    connection = %shared.id,
                    "expected device_hello, received {}",
                    message.kind
                );
                break "protocol violation";
            }
            expect_hello = false;
            shared.advance(ConnectionState::Connected);
        }

        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break "shutdown",
            sent = inbound.send(message) => {
                if sent.is_err() {
                    debug!(connection = %shared.id, "no inbound consumer, discarding frame");
                }
            }
        }
    };

    shared.close(reason);
}
