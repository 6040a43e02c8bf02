//! Hello exchange that opens every peer connection
//!
//! Both sides send a `device_hello` as their first frame. The accepting side
//! waits for the remote hello before answering with its own; the dialing side
//! sends first and lets the connection's reader verify the reply.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;

use super::codec::ProtocolError;
use super::connection::{ConnectionError, FrameReader};
use super::protocol::{meta, Message, MessageKind, PROTOCOL_VERSION};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no hello received within {0:?}")]
    Timeout(Duration),

    #[error("stream closed before hello")]
    Closed,

    #[error("peer announced our own device id")]
    SelfConnection,

    #[error("device '{device_id}' is already connected")]
    Duplicate { device_id: String },

    #[error("shutting down")]
    Cancelled,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What this device tells peers about itself
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub device_id: String,
    pub hostname: String,
    /// Port our listener accepts on, advertised so peers can reconnect
    pub listen_port: u16,
}

impl LocalIdentity {
    pub fn new(device_id: impl Into<String>, listen_port: u16) -> Self {
        Self {
            device_id: device_id.into(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            listen_port,
        }
    }

    pub fn hello(&self) -> Message {
        let mut metadata = BTreeMap::new();
        metadata.insert(meta::HOSTNAME.to_string(), self.hostname.clone());
        metadata.insert(meta::VERSION.to_string(), PROTOCOL_VERSION.to_string());
        metadata.insert(meta::PLATFORM.to_string(), std::env::consts::OS.to_string());
        metadata.insert(meta::LISTEN_PORT.to_string(), self.listen_port.to_string());
        Message::device_hello(&self.device_id, metadata)
    }
}

/// Wait for the remote hello on a freshly opened stream
///
/// Reads through the framed reader so nothing the peer sends right after its
/// hello is lost when the connection tasks take over.
pub async fn read_hello(reader: &mut FrameReader, limit: Duration) -> Result<Message, HandshakeError> {
    let frame = tokio::time::timeout(limit, reader.next())
        .await
        .map_err(|_| HandshakeError::Timeout(limit))?;

    let message = match frame {
        None => return Err(HandshakeError::Closed),
        Some(Err(err)) | Some(Ok(Err(err))) => return Err(err.into()),
        Some(Ok(Ok(message))) => message,
    };

    if message.kind != MessageKind::DeviceHello {
        return Err(ProtocolError::UnexpectedKind {
            expected: MessageKind::DeviceHello,
            actual: message.kind,
        }
        .into());
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::codec::{encode, DEFAULT_MAX_FRAME_SIZE};
    use crate::transport::connection::framed;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_hello_metadata() {
        let identity = LocalIdentity::new("alice-0badf00d", 9000);
        let hello = identity.hello();

        assert_eq!(hello.kind, MessageKind::DeviceHello);
        assert_eq!(hello.device_id, "alice-0badf00d");
        assert_eq!(hello.listen_port(), Some(9000));
        assert_eq!(hello.metadata.get(meta::VERSION).map(String::as_str), Some(PROTOCOL_VERSION));
    }

    #[tokio::test]
    async fn test_read_hello() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let (mut reader, _writer) = framed(Box::new(local), DEFAULT_MAX_FRAME_SIZE);

        let hello = LocalIdentity::new("bob", 8080).hello();
        remote
            .write_all(&encode(&hello, DEFAULT_MAX_FRAME_SIZE).unwrap())
            .await
            .unwrap();

        let received = read_hello(&mut reader, Duration::from_secs(1)).await.unwrap();
        assert_eq!(received.device_id, "bob");
    }

    #[tokio::test]
    async fn test_read_hello_rejects_other_kinds() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let (mut reader, _writer) = framed(Box::new(local), DEFAULT_MAX_FRAME_SIZE);

        remote
            .write_all(&encode(&Message::ping("bob"), DEFAULT_MAX_FRAME_SIZE).unwrap())
            .await
            .unwrap();

        let err = read_hello(&mut reader, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Protocol(ProtocolError::UnexpectedKind { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_hello_times_out() {
        let (local, _remote) = tokio::io::duplex(4096);
        let (mut reader, _writer) = framed(Box::new(local), DEFAULT_MAX_FRAME_SIZE);

        let err = read_hello(&mut reader, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_read_hello_on_closed_stream() {
        let (local, remote) = tokio::io::duplex(4096);
        let (mut reader, _writer) = framed(Box::new(local), DEFAULT_MAX_FRAME_SIZE);
        drop(remote);

        let err = read_hello(&mut reader, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Closed));
    }
}
