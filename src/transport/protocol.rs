//! Wire protocol definitions for CrossClip peer connections
//!
//! Every frame on the wire carries exactly one [`Message`]. The body is a JSON
//! object whose `type` field selects the [`MessageKind`]; the kind decides
//! which of the remaining fields are meaningful.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::codec::ProtocolError;

/// Protocol version advertised in the hello metadata
pub const PROTOCOL_VERSION: &str = "1";

/// Metadata keys carried by a `device_hello`
pub mod meta {
    pub const HOSTNAME: &str = "hostname";
    pub const VERSION: &str = "version";
    pub const PLATFORM: &str = "platform";
    pub const LISTEN_PORT: &str = "listen_port";
}

/// Message type tag
///
/// Tags this build does not know decode to [`MessageKind::Unknown`] so that a
/// newer peer never breaks framing; the engine refuses to act on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Identity announcement, always the first frame in each direction
    DeviceHello,

    /// New clipboard text from the sender
    ClipboardUpdate,

    /// Acknowledges a message carrying `message_id`
    Ack,

    /// Liveness probe
    Ping,

    /// Liveness reply
    Pong,

    /// Graceful goodbye before the sender closes the connection
    DeviceBye,

    /// A tag introduced by a newer protocol revision
    Unknown(String),
}

impl MessageKind {
    /// Tag used on the wire
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::DeviceHello => "device_hello",
            MessageKind::ClipboardUpdate => "clipboard_update",
            MessageKind::Ack => "ack",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::DeviceBye => "device_bye",
            MessageKind::Unknown(tag) => tag,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, MessageKind::Unknown(_))
    }
}

impl From<String> for MessageKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "device_hello" => MessageKind::DeviceHello,
            "clipboard_update" => MessageKind::ClipboardUpdate,
            "ack" => MessageKind::Ack,
            "ping" => MessageKind::Ping,
            "pong" => MessageKind::Pong,
            "device_bye" => MessageKind::DeviceBye,
            _ => MessageKind::Unknown(tag),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Unknown(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire format message container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message type for routing
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Stable identifier of the sending device
    pub device_id: String,

    /// Creation time
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Present on messages that expect a reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Clipboard text, only on `clipboard_update`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Hello metadata (see [`meta`])
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Message {
    /// Create a bare message stamped with the current time
    pub fn new(kind: MessageKind, device_id: impl Into<String>) -> Self {
        Self {
            kind,
            device_id: device_id.into(),
            timestamp: Utc::now(),
            message_id: None,
            content: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn device_hello(device_id: impl Into<String>, metadata: BTreeMap<String, String>) -> Self {
        let mut msg = Self::new(MessageKind::DeviceHello, device_id);
        msg.metadata = metadata;
        msg
    }

    /// Clipboard update with a fresh message id so the receiver can ack it
    pub fn clipboard_update(device_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageKind::ClipboardUpdate, device_id);
        msg.message_id = Some(Uuid::new_v4().to_string());
        msg.content = Some(content.into());
        msg
    }

    pub fn ack(device_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self::new(MessageKind::Ack, device_id).with_message_id(message_id)
    }

    pub fn ping(device_id: impl Into<String>) -> Self {
        Self::new(MessageKind::Ping, device_id).with_message_id(Uuid::new_v4().to_string())
    }

    pub fn pong(device_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self::new(MessageKind::Pong, device_id).with_message_id(message_id)
    }

    pub fn device_bye(device_id: impl Into<String>) -> Self {
        Self::new(MessageKind::DeviceBye, device_id)
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Listening port the sender advertised in its hello, if any
    pub fn listen_port(&self) -> Option<u16> {
        self.metadata
            .get(meta::LISTEN_PORT)
            .and_then(|port| port.parse().ok())
    }

    /// Length in bytes of the clipboard text
    pub fn content_len(&self) -> usize {
        self.content.as_ref().map_or(0, String::len)
    }

    /// Check the fields every message must carry
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.kind.as_str().is_empty() {
            return Err(ProtocolError::MissingField("type"));
        }
        if self.device_id.is_empty() {
            return Err(ProtocolError::MissingField("device_id"));
        }
        Ok(())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.kind, self.device_id)?;
        if let Some(id) = &self.message_id {
            write!(f, " ({})", id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kind_tags() {
        assert_eq!(MessageKind::DeviceHello.to_string(), "device_hello");
        assert_eq!(MessageKind::ClipboardUpdate.to_string(), "clipboard_update");
        assert_eq!(MessageKind::from("pong".to_string()), MessageKind::Pong);
        assert_eq!(
            MessageKind::from("file_offer".to_string()),
            MessageKind::Unknown("file_offer".to_string())
        );
        assert!(!MessageKind::Unknown("x".into()).is_known());
    }

    #[test]
    fn test_clipboard_update_fields() {
        let msg = Message::clipboard_update("alice", "hello");
        assert_eq!(msg.kind, MessageKind::ClipboardUpdate);
        assert_eq!(msg.content.as_deref(), Some("hello"));
        assert!(msg.message_id.is_some());
        assert_eq!(msg.content_len(), 5);
    }

    #[test]
    fn test_json_shape() {
        let msg = Message::ack("bob", "42");
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "ack");
        assert_eq!(value["device_id"], "bob");
        assert_eq!(value["message_id"], "42");
        assert!(value.get("content").is_none());
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn test_unknown_kind_survives_serialization() {
        let json = r#"{"type":"file_offer","device_id":"carol","timestamp":"2024-05-01T10:00:00Z"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind, MessageKind::Unknown("file_offer".into()));

        let again = serde_json::to_string(&msg).unwrap();
        assert!(again.contains(r#""type":"file_offer""#));
    }

    #[test]
    fn test_listen_port_metadata() {
        let mut metadata = BTreeMap::new();
        metadata.insert(meta::LISTEN_PORT.to_string(), "8080".to_string());
        let hello = Message::device_hello("alice", metadata);
        assert_eq!(hello.listen_port(), Some(8080));

        let bare = Message::device_hello("alice", BTreeMap::new());
        assert_eq!(bare.listen_port(), None);
    }

    #[test]
    fn test_validate_rejects_empty_device_id() {
        let msg = Message::new(MessageKind::Ping, "");
        assert!(matches!(
            msg.validate(),
            Err(ProtocolError::MissingField("device_id"))
        ));
    }
}
