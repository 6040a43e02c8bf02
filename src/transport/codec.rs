//! Length-prefixed JSON framing
//!
//! A frame is a 4-byte big-endian length followed by exactly that many bytes
//! of UTF-8 JSON. [`MessageCodec`] plugs the framing into
//! `tokio_util::codec` so connections can use `FramedRead`/`FramedWrite`.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{Message, MessageKind};

/// Size of the length prefix
pub const LENGTH_PREFIX: usize = 4;

/// Default upper bound for a frame body
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("{extra} unexpected bytes after frame body")]
    TrailingBytes { extra: usize },

    #[error("malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("expected {expected} but received {actual}")]
    UnexpectedKind {
        expected: MessageKind,
        actual: MessageKind,
    },

    #[error("stream error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether the error poisons the byte stream rather than a single frame
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Truncated { .. } | ProtocolError::FrameTooLarge { .. } | ProtocolError::Io(_)
        )
    }
}

/// Serialize `message` into a complete frame
pub fn encode(message: &Message, max_frame_size: usize) -> Result<Bytes, ProtocolError> {
    let mut frame = BytesMut::new();
    write_frame(message, max_frame_size, &mut frame)?;
    Ok(frame.freeze())
}

/// Parse one complete frame
///
/// The slice must hold the length prefix and exactly the declared body.
pub fn decode(frame: &[u8], max_frame_size: usize) -> Result<Message, ProtocolError> {
    if frame.len() < LENGTH_PREFIX {
        return Err(ProtocolError::Truncated {
            expected: LENGTH_PREFIX,
            actual: frame.len(),
        });
    }

    let mut header = &frame[..LENGTH_PREFIX];
    let declared = header.get_u32() as usize;
    if declared > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: declared,
            max: max_frame_size,
        });
    }

    let body = &frame[LENGTH_PREFIX..];
    if body.len() < declared {
        return Err(ProtocolError::Truncated {
            expected: declared,
            actual: body.len(),
        });
    }
    if body.len() > declared {
        return Err(ProtocolError::TrailingBytes {
            extra: body.len() - declared,
        });
    }

    decode_body(body)
}

/// Parse a frame body without its length prefix
pub fn decode_body(body: &[u8]) -> Result<Message, ProtocolError> {
    let message: Message = serde_json::from_slice(body)?;
    message.validate()?;
    Ok(message)
}

fn write_frame(message: &Message, max_frame_size: usize, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: max_frame_size,
        });
    }

    dst.reserve(LENGTH_PREFIX + body.len());
    dst.put_u32(body.len() as u32);
    dst.extend_from_slice(&body);
    Ok(())
}

/// Streaming codec for [`Message`] frames
///
/// Decoded items are themselves results: a frame whose body fails to parse
/// yields `Some(Err(..))` and the stream carries on with the next frame.
/// Errors returned from `decode` itself (oversized prefix, EOF mid-frame,
/// I/O) end the stream.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_size: usize,
    pending: Option<usize>,
}

impl MessageCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            pending: None,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for MessageCodec {
    type Item = Result<Message, ProtocolError>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.pending {
            Some(len) => len,
            None => {
                if src.len() < LENGTH_PREFIX {
                    return Ok(None);
                }
                let len = src.get_u32() as usize;
                if len > self.max_frame_size {
                    return Err(ProtocolError::FrameTooLarge {
                        size: len,
                        max: self.max_frame_size,
                    });
                }
                self.pending = Some(len);
                len
            }
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.pending = None;
        let body = src.split_to(len);
        Ok(Some(decode_body(&body)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }

        match self.pending {
            Some(expected) => Err(ProtocolError::Truncated {
                expected,
                actual: src.len(),
            }),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::Truncated {
                expected: LENGTH_PREFIX,
                actual: src.len(),
            }),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(&item, self.max_frame_size, dst)
    }
}
