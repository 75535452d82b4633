//! Channel envelope format.
//!
//! Every broadcast on the session channel is one [`Envelope`], CBOR-encoded.
//! Content envelopes (chat and voice) carry ciphertext sealed under the
//! session key together with the nonce used. The hex-encoded nonce doubles as
//! the message id, which acknowledgments refer back to.
//!
//! | kind                 | data                          | nonce |
//! |----------------------|-------------------------------|-------|
//! | `key-exchange`       | SEC1 public key               | none  |
//! | `chat-message`       | sealed [`ChatPayload`]        | yes   |
//! | `voice-message`      | sealed `VoiceMessage`         | yes   |
//! | `message-ack`        | acknowledged message id       | none  |
//! | `session-terminated` | empty                         | none  |

use ghost_crypto::NONCE_SIZE;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{engine::SealedPayload, error::WireError, identity::SessionIdentity};

/// Discriminates envelope payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    /// Sender's public key
    KeyExchange,
    /// Encrypted text or file
    ChatMessage,
    /// Encrypted voice recording
    VoiceMessage,
    /// Receipt for a content envelope
    MessageAck,
    /// Sender ended the session
    SessionTerminated,
}

/// A single channel broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload kind
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Sender's presence identity
    #[serde(rename = "senderId")]
    pub sender_id: SessionIdentity,
    /// Kind-specific payload
    pub data: Vec<u8>,
    /// Sender wall clock, unix milliseconds
    pub timestamp: u64,
    /// AEAD nonce for sealed payloads
    pub nonce: Option<[u8; NONCE_SIZE]>,
}

impl Envelope {
    /// Announce our public key.
    pub fn key_exchange(sender_id: SessionIdentity, public_key: &[u8], timestamp: u64) -> Self {
        Self {
            kind: EnvelopeKind::KeyExchange,
            sender_id,
            data: public_key.to_vec(),
            timestamp,
            nonce: None,
        }
    }

    /// Wrap a sealed chat or voice payload.
    pub fn sealed(
        kind: EnvelopeKind,
        sender_id: SessionIdentity,
        sealed: SealedPayload,
        timestamp: u64,
    ) -> Self {
        debug_assert!(matches!(kind, EnvelopeKind::ChatMessage | EnvelopeKind::VoiceMessage));

        Self { kind, sender_id, data: sealed.ciphertext, timestamp, nonce: Some(sealed.nonce) }
    }

    /// Acknowledge receipt of `message_id`.
    pub fn ack(sender_id: SessionIdentity, message_id: &str, timestamp: u64) -> Self {
        Self {
            kind: EnvelopeKind::MessageAck,
            sender_id,
            data: message_id.as_bytes().to_vec(),
            timestamp,
            nonce: None,
        }
    }

    /// Tell the peer the session is over.
    pub fn terminated(sender_id: SessionIdentity, timestamp: u64) -> Self {
        Self {
            kind: EnvelopeKind::SessionTerminated,
            sender_id,
            data: Vec::new(),
            timestamp,
            nonce: None,
        }
    }

    /// Message id of a sealed envelope (hex nonce).
    pub fn message_id(&self) -> Option<String> {
        self.nonce.map(hex::encode)
    }

    /// Acknowledged id carried by a `message-ack`.
    pub fn acked_id(&self) -> Option<&str> {
        match self.kind {
            EnvelopeKind::MessageAck => std::str::from_utf8(&self.data).ok(),
            _ => None,
        }
    }

    /// Serialize to CBOR.
    ///
    /// # Errors
    ///
    /// - `WireError::Encode` if serialization fails
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        encode(self)
    }

    /// Deserialize from CBOR.
    ///
    /// # Errors
    ///
    /// - `WireError::Decode` if the bytes are not an envelope
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        decode(bytes)
    }
}

/// Kind of a chat payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChatKind {
    /// UTF-8 text
    Text,
    /// Named binary attachment
    File,
}

/// Plaintext of a `chat-message` before sealing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChatPayload {
    /// Text or file
    #[zeroize(skip)]
    pub kind: ChatKind,
    /// Message body or file bytes
    pub content: Vec<u8>,
    /// Attachment name, for files
    #[serde(rename = "fileName")]
    pub file_name: Option<String>,
}

impl std::fmt::Debug for ChatPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatPayload")
            .field("kind", &self.kind)
            .field("len", &self.content.len())
            .finish_non_exhaustive()
    }
}

impl ChatPayload {
    /// Text message.
    pub fn text(text: &str) -> Self {
        Self { kind: ChatKind::Text, content: text.as_bytes().to_vec(), file_name: None }
    }

    /// File attachment.
    pub fn file(name: &str, bytes: &[u8]) -> Self {
        Self { kind: ChatKind::File, content: bytes.to_vec(), file_name: Some(name.to_string()) }
    }

    /// Serialize to CBOR.
    ///
    /// # Errors
    ///
    /// - `WireError::Encode` if serialization fails
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        encode(self)
    }

    /// Deserialize from CBOR.
    ///
    /// # Errors
    ///
    /// - `WireError::Decode` if the bytes are not a chat payload
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        decode(bytes)
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    ciborium::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}
