//! Wire envelope exchanged between peers.
//!
//! Every frame on a chat stream is one JSON object terminated by `\n`:
//!
//! ```text
//! { "type": "handshake" | "handshake_ack" | "handshake_reject" | "chat",
//!   "from": "<peer id, optional>",
//!   "payload": <type-specific JSON> }
//! ```
//!
//! [`Envelope`] is the raw frame; [`Envelope::decode`] turns it into the
//! typed [`Message`] the handler matches on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Envelope(serde_json::Error),

    #[error("Malformed {kind} payload: {source}")]
    Payload {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    HandshakeAck,
    HandshakeReject,
    Chat,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::HandshakeAck => "handshake_ack",
            Self::HandshakeReject => "handshake_reject",
            Self::Chat => "chat",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub avatar_url: String,
}

/// Introduction sent on first contact (and echoed back in the ack).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandShake {
    pub version: String,
    #[serde(default)]
    pub user_info: UserInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub message: String,
}

/// The wire unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Decoded envelope contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(HandShake),
    HandshakeAck(HandShake),
    HandshakeReject,
    Chat(ChatPayload),
}

impl Envelope {
    pub fn handshake(hs: &HandShake) -> Self {
        Self::with_payload(MessageType::Handshake, hs)
    }

    pub fn handshake_ack(hs: &HandShake) -> Self {
        Self::with_payload(MessageType::HandshakeAck, hs)
    }

    pub fn handshake_reject() -> Self {
        Self {
            kind: MessageType::HandshakeReject,
            from: None,
            payload: Value::Null,
        }
    }

    pub fn chat(message: impl Into<String>) -> Self {
        Self::with_payload(
            MessageType::Chat,
            &ChatPayload {
                message: message.into(),
            },
        )
    }

    fn with_payload<T: Serialize>(kind: MessageType, payload: &T) -> Self {
        // Plain structs of strings always serialize.
        let payload = serde_json::to_value(payload).unwrap_or(Value::Null);
        Self {
            kind,
            from: None,
            payload,
        }
    }

    /// Parse one frame (without its trailing newline).
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Envelope)
    }

    /// Serialize as a single newline-terminated frame.
    pub fn to_frame(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut frame = serde_json::to_vec(self)?;
        frame.push(b'\n');
        Ok(frame)
    }

    /// Interpret the payload according to the type tag.
    pub fn decode(&self) -> Result<Message, ProtocolError> {
        let payload_err = |source| ProtocolError::Payload {
            kind: self.kind,
            source,
        };

        match self.kind {
            MessageType::Handshake => serde_json::from_value(self.payload.clone())
                .map(Message::Handshake)
                .map_err(payload_err),
            MessageType::HandshakeAck => serde_json::from_value(self.payload.clone())
                .map(Message::HandshakeAck)
                .map_err(payload_err),
            MessageType::HandshakeReject => Ok(Message::HandshakeReject),
            MessageType::Chat => serde_json::from_value(self.payload.clone())
                .map(Message::Chat)
                .map_err(payload_err),
        }
    }
}
