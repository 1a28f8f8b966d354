//! Typed stream message model.
//!
//! A [`StreamMessage`] is one element of a message chain: it carries its
//! identity ([`MessageId`]), a link to the chronologically previous message
//! in the same chain ([`MessageRef`]), the (possibly encrypted) content,
//! and the publisher's signature. The wire encoding lives in [`crate::wire`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Fixed-length binary publisher address (20 bytes).
///
/// Rendered on the wire as lowercase `0x`-prefixed hex. Parsing rejects
/// anything that is not exactly 20 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    /// Byte length of an address.
    pub const LEN: usize = 20;

    /// Wrap raw address bytes.
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Parse a `0x`-prefixed (or bare) lowercase/uppercase hex address.
    pub fn from_hex(s: &str) -> Result<Self> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|e| ProtocolError::MalformedMessage {
            reason: format!("publisher address is not valid hex: {e}"),
        })?;
        let bytes: [u8; 20] =
            bytes.try_into().map_err(|b: Vec<u8>| ProtocolError::MalformedMessage {
                reason: format!("publisher address must be {} bytes, got {}", Self::LEN, b.len()),
            })?;
        Ok(Self(bytes))
    }

    /// Lowercase `0x`-prefixed hex form.
    pub fn to_hex(self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Raw address bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

/// Position of a message within its chain: `(timestamp, sequence number)`.
///
/// Totally ordered by timestamp, then sequence number. The sequence number
/// disambiguates messages published within the same millisecond.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageRef {
    /// Publish time in milliseconds since the epoch.
    pub timestamp_ms: i64,
    /// Sequence number within the millisecond.
    pub sequence_number: i64,
}

impl MessageRef {
    /// Construct a reference from a timestamp and sequence number.
    pub fn new(timestamp_ms: i64, sequence_number: i64) -> Self {
        Self { timestamp_ms, sequence_number }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.timestamp_ms, self.sequence_number)
    }
}

/// Unique identity of a stream message.
///
/// One publisher may run several independent ordered chains concurrently
/// (e.g. multiple producing threads); `msg_chain_id` separates them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    /// Stream this message belongs to.
    pub stream_id: String,
    /// Partition within the stream.
    pub partition: u32,
    /// Publish time in milliseconds since the epoch.
    pub timestamp_ms: i64,
    /// Sequence number within the millisecond.
    pub sequence_number: i64,
    /// Publisher address.
    pub publisher_id: Address,
    /// Opaque per-publisher chain token.
    pub msg_chain_id: String,
}

impl MessageId {
    /// Chain position of this message.
    pub fn message_ref(&self) -> MessageRef {
        MessageRef::new(self.timestamp_ms, self.sequence_number)
    }
}

/// A group key encrypted for transport, either under a counterpart's RSA
/// public key or under another group key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedGroupKey {
    /// Key identifier.
    pub id: String,
    /// Hex-encoded ciphertext of the 256-bit key.
    pub ciphertext_hex: String,
}

/// Content-layer message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Ordinary stream message.
    Message,
    /// Request for one or more group keys.
    GroupKeyRequest,
    /// Response carrying encrypted group keys.
    GroupKeyResponse,
    /// Error response to a group key request.
    GroupKeyErrorResponse,
}

impl MessageType {
    /// Wire code for this type.
    pub fn code(self) -> i64 {
        match self {
            Self::Message => 27,
            Self::GroupKeyRequest => 28,
            Self::GroupKeyResponse => 29,
            Self::GroupKeyErrorResponse => 31,
        }
    }

    /// Decode a wire code.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            27 => Ok(Self::Message),
            28 => Ok(Self::GroupKeyRequest),
            29 => Ok(Self::GroupKeyResponse),
            31 => Ok(Self::GroupKeyErrorResponse),
            _ => Err(ProtocolError::UnsupportedFormat { field: "message type", code }),
        }
    }
}

/// Encoding of the content payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// UTF-8 JSON text.
    Json,
}

impl ContentType {
    /// Wire code for this type.
    pub fn code(self) -> i64 {
        match self {
            Self::Json => 0,
        }
    }

    /// Decode a wire code.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::Json),
            _ => Err(ProtocolError::UnsupportedFormat { field: "content type", code }),
        }
    }
}

/// How the content payload is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    /// Plaintext content.
    None,
    /// Content encrypted under the counterpart's RSA public key.
    Rsa,
    /// Content encrypted under a shared group key (AES-CTR).
    Aes,
}

impl EncryptionType {
    /// Wire code for this type.
    pub fn code(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Rsa => 1,
            Self::Aes => 2,
        }
    }

    /// Decode a wire code.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Rsa),
            2 => Ok(Self::Aes),
            _ => Err(ProtocolError::UnsupportedFormat { field: "encryption type", code }),
        }
    }
}

/// Signature scheme applied to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    /// Unsigned message.
    None,
    /// Recoverable secp256k1 signature over the prefixed Keccak hash of the
    /// canonical payload.
    Eth,
}

impl SignatureType {
    /// Wire code for this type.
    pub fn code(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Eth => 2,
        }
    }

    /// Decode a wire code.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::None),
            2 => Ok(Self::Eth),
            _ => Err(ProtocolError::UnsupportedFormat { field: "signature type", code }),
        }
    }
}

/// One message of an ordered, signed, optionally encrypted stream.
///
/// # Invariants
///
/// - `new_group_key`, if present, must carry a key id different from
///   `group_key_id`: a rotation announcement always announces a *new* key.
///   [`StreamMessage::with_new_group_key`] and the wire decoder enforce
///   this at construction time.
/// - `previous_ref`, when present, references a message that chronologically
///   precedes this one in the same chain; the ordering engine validates the
///   link to detect gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Message identity.
    pub id: MessageId,
    /// Reference to the previous message in the same chain, if any.
    pub previous_ref: Option<MessageRef>,
    /// Content-layer message type.
    pub message_type: MessageType,
    /// Encoding of the content payload.
    pub content_type: ContentType,
    /// How the content is encrypted.
    pub encryption_type: EncryptionType,
    /// Id of the group key the content is encrypted with, if any.
    pub group_key_id: Option<String>,
    /// Content payload: JSON text, or hex ciphertext when encrypted.
    pub content: String,
    /// Rotation announcement: the next group key, encrypted under the
    /// current one.
    pub new_group_key: Option<EncryptedGroupKey>,
    /// Signature scheme.
    pub signature_type: SignatureType,
    /// Hex-encoded signature, if signed.
    pub signature: Option<String>,
}

impl StreamMessage {
    /// Create an unsigned plaintext JSON message.
    pub fn new(id: MessageId, previous_ref: Option<MessageRef>, content: String) -> Self {
        Self {
            id,
            previous_ref,
            message_type: MessageType::Message,
            content_type: ContentType::Json,
            encryption_type: EncryptionType::None,
            group_key_id: None,
            content,
            new_group_key: None,
            signature_type: SignatureType::None,
            signature: None,
        }
    }

    /// Attach a key-rotation announcement.
    ///
    /// # Errors
    ///
    /// `ProtocolError::InvalidNewGroupKey` if the announced key re-uses the
    /// id the message is already encrypted with.
    pub fn with_new_group_key(mut self, key: EncryptedGroupKey) -> Result<Self> {
        if self.group_key_id.as_deref() == Some(key.id.as_str()) {
            return Err(ProtocolError::InvalidNewGroupKey { key_id: key.id });
        }
        self.new_group_key = Some(key);
        Ok(self)
    }

    /// Chain position of this message.
    pub fn message_ref(&self) -> MessageRef {
        self.id.message_ref()
    }

    /// Parse the content payload as JSON.
    ///
    /// # Errors
    ///
    /// `ProtocolError::ContentNotAccessible` if the message is still
    /// encrypted (decrypt first), `ProtocolError::MalformedMessage` if the
    /// plaintext is not valid JSON.
    pub fn parsed_content(&self) -> Result<serde_json::Value> {
        if self.encryption_type != EncryptionType::None {
            return Err(ProtocolError::ContentNotAccessible);
        }
        serde_json::from_str(&self.content).map_err(|e| ProtocolError::MalformedMessage {
            reason: format!("content is not valid JSON: {e}"),
        })
    }

    /// Canonical byte string the publisher signs.
    ///
    /// Concatenation of the identity fields, the previous reference (when
    /// present), the content payload, and the serialized new-group-key
    /// announcement (when present). Stable across wire versions.
    pub fn signature_payload(&self) -> Vec<u8> {
        let mut payload = String::new();
        payload.push_str(&self.id.stream_id);
        payload.push_str(&self.id.partition.to_string());
        payload.push_str(&self.id.timestamp_ms.to_string());
        payload.push_str(&self.id.sequence_number.to_string());
        payload.push_str(&self.id.publisher_id.to_hex());
        payload.push_str(&self.id.msg_chain_id);
        if let Some(prev) = self.previous_ref {
            payload.push_str(&prev.timestamp_ms.to_string());
            payload.push_str(&prev.sequence_number.to_string());
        }
        payload.push_str(&self.content);
        if let Some(key) = &self.new_group_key {
            payload.push_str(&key.id);
            payload.push_str(&key.ciphertext_hex);
        }
        payload.into_bytes()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_id() -> MessageId {
        MessageId {
            stream_id: "stream".to_string(),
            partition: 0,
            timestamp_ms: 1000,
            sequence_number: 0,
            publisher_id: Address::new([0xAB; 20]),
            msg_chain_id: "chain-1".to_string(),
        }
    }

    #[test]
    fn stream_message_equality_is_total() {
        // Downstream action types derive `Eq` over whole messages.
        fn assert_eq_impl<T: Eq>() {}
        assert_eq_impl::<StreamMessage>();
    }

    #[test]
    fn message_refs_order_by_timestamp_then_sequence() {
        let a = MessageRef::new(100, 5);
        let b = MessageRef::new(100, 6);
        let c = MessageRef::new(101, 0);

        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn address_round_trips_through_hex() {
        let addr = Address::new([0x12; 20]);
        let parsed = Address::from_hex(&addr.to_hex()).unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn address_rejects_wrong_length() {
        let result = Address::from_hex("0x1234");
        assert!(matches!(result, Err(ProtocolError::MalformedMessage { .. })));
    }

    #[test]
    fn new_group_key_must_differ_from_current() {
        let mut msg = StreamMessage::new(test_id(), None, "{}".to_string());
        msg.encryption_type = EncryptionType::Aes;
        msg.group_key_id = Some("key-1".to_string());

        let result = msg.clone().with_new_group_key(EncryptedGroupKey {
            id: "key-1".to_string(),
            ciphertext_hex: "abcd".to_string(),
        });
        assert!(matches!(result, Err(ProtocolError::InvalidNewGroupKey { .. })));

        let ok = msg.with_new_group_key(EncryptedGroupKey {
            id: "key-2".to_string(),
            ciphertext_hex: "abcd".to_string(),
        });
        assert!(ok.is_ok());
    }

    #[test]
    fn parsed_content_fails_on_encrypted_message() {
        let mut msg = StreamMessage::new(test_id(), None, "deadbeef".to_string());
        msg.encryption_type = EncryptionType::Aes;
        msg.group_key_id = Some("key-1".to_string());

        assert!(matches!(msg.parsed_content(), Err(ProtocolError::ContentNotAccessible)));
    }

    #[test]
    fn parsed_content_returns_json() {
        let msg = StreamMessage::new(test_id(), None, r#"{"hello":"world"}"#.to_string());
        let value = msg.parsed_content().unwrap();
        assert_eq!(value["hello"], "world");
    }

    #[test]
    fn signature_payload_covers_previous_ref() {
        let without = StreamMessage::new(test_id(), None, "{}".to_string());
        let with = StreamMessage::new(test_id(), Some(MessageRef::new(900, 0)), "{}".to_string());
        assert_ne!(without.signature_payload(), with.signature_payload());
    }
}
