//! Versioned fixed-position array wire codec.
//!
//! A message travels as a JSON array whose first element is the wire
//! version. Optional fields occupy fixed positions and are carried as
//! `null` when absent (never omitted), so every version has a fixed arity.
//!
//! Layout (version 32, the latest):
//!
//! ```text
//! [version,
//!  [streamId, partition, timestampMs, sequenceNo, publisherId, msgChainId],
//!  [prevTimestampMs, prevSequenceNo] | null,
//!  messageType, contentType, encryptionType,
//!  groupKeyId | null,
//!  content,
//!  [newGroupKeyId, ciphertextHex] | null,
//!  signatureType,
//!  signature | null]
//! ```
//!
//! Version 31 is identical minus the `newGroupKey` position. Decoding is
//! strict: unknown versions and codes fail with `UnsupportedFormat`, shape
//! problems fail with `MalformedMessage` naming the offending position.

use serde_json::{Value, json};

use crate::{
    errors::{ProtocolError, Result},
    message::{
        Address, ContentType, EncryptedGroupKey, EncryptionType, MessageId, MessageRef,
        MessageType, SignatureType, StreamMessage,
    },
};

/// Latest supported wire version.
pub const LATEST_VERSION: u8 = 32;

/// All wire versions this codec understands.
pub const SUPPORTED_VERSIONS: [u8; 2] = [31, 32];

/// Array arity of a version-32 message.
const ARITY_V32: usize = 11;

/// Array arity of a version-31 message (no `newGroupKey` position).
const ARITY_V31: usize = 10;

/// Encode a message at the given wire version.
///
/// Absent optional fields are emitted as `null` at their fixed positions.
///
/// # Errors
///
/// - `ProtocolError::UnsupportedFormat` for an unknown version
/// - `ProtocolError::IllegalArgument` when encoding a key-rotation
///   announcement at version 31, which has no position for it
pub fn encode(msg: &StreamMessage, version: u8) -> Result<String> {
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(ProtocolError::UnsupportedFormat { field: "version", code: i64::from(version) });
    }
    if version == 31 && msg.new_group_key.is_some() {
        return Err(ProtocolError::IllegalArgument {
            reason: "version 31 has no position for a new group key".to_string(),
        });
    }

    let id = &msg.id;
    let id_array = json!([
        id.stream_id,
        id.partition,
        id.timestamp_ms,
        id.sequence_number,
        id.publisher_id.to_hex(),
        id.msg_chain_id,
    ]);
    let prev = match msg.previous_ref {
        Some(p) => json!([p.timestamp_ms, p.sequence_number]),
        None => Value::Null,
    };

    let mut array = vec![
        json!(version),
        id_array,
        prev,
        json!(msg.message_type.code()),
        json!(msg.content_type.code()),
        json!(msg.encryption_type.code()),
        opt_string(msg.group_key_id.as_deref()),
        json!(msg.content),
    ];
    if version == 32 {
        array.push(match &msg.new_group_key {
            Some(key) => json!([key.id, key.ciphertext_hex]),
            None => Value::Null,
        });
    }
    array.push(json!(msg.signature_type.code()));
    array.push(opt_string(msg.signature.as_deref()));

    serde_json::to_string(&Value::Array(array)).map_err(|e| ProtocolError::MalformedMessage {
        reason: format!("failed to serialize message array: {e}"),
    })
}

/// Decode a message, dispatching on the leading version element.
///
/// # Errors
///
/// - `ProtocolError::MalformedMessage` for shape or element-type problems
/// - `ProtocolError::UnsupportedFormat` for unknown version or enum codes
/// - `ProtocolError::InvalidNewGroupKey` if a rotation announcement
///   re-announces the message's own key
pub fn decode(raw: &str) -> Result<StreamMessage> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ProtocolError::MalformedMessage {
        reason: format!("not valid JSON: {e}"),
    })?;
    let array = value.as_array().ok_or_else(|| ProtocolError::MalformedMessage {
        reason: "message must be a JSON array".to_string(),
    })?;

    let version = as_i64(array, 0, "version")?;
    let (expected_arity, has_new_group_key) = match version {
        31 => (ARITY_V31, false),
        32 => (ARITY_V32, true),
        _ => return Err(ProtocolError::UnsupportedFormat { field: "version", code: version }),
    };
    if array.len() != expected_arity {
        return Err(ProtocolError::MalformedMessage {
            reason: format!(
                "version {version} message must have {expected_arity} elements, got {}",
                array.len()
            ),
        });
    }

    let id = decode_id(field(array, 1, "message id")?)?;
    let previous_ref = decode_prev(field(array, 2, "previous ref")?)?;
    let message_type = MessageType::from_code(as_i64(array, 3, "message type")?)?;
    let content_type = ContentType::from_code(as_i64(array, 4, "content type")?)?;
    let encryption_type = EncryptionType::from_code(as_i64(array, 5, "encryption type")?)?;
    let group_key_id = opt_str(array, 6, "group key id")?;
    let content = req_str(array, 7, "content")?;

    let (sig_pos, new_group_key) = if has_new_group_key {
        (9, decode_new_group_key(field(array, 8, "new group key")?)?)
    } else {
        (8, None)
    };
    let signature_type = SignatureType::from_code(as_i64(array, sig_pos, "signature type")?)?;
    let signature = opt_str(array, sig_pos + 1, "signature")?;

    if signature_type == SignatureType::Eth && signature.is_none() {
        return Err(ProtocolError::MalformedMessage {
            reason: "signature type requires a signature, got null".to_string(),
        });
    }

    let msg = StreamMessage {
        id,
        previous_ref,
        message_type,
        content_type,
        encryption_type,
        group_key_id,
        content,
        new_group_key: None,
        signature_type,
        signature,
    };
    match new_group_key {
        Some(key) => msg.with_new_group_key(key),
        None => Ok(msg),
    }
}

fn opt_string(value: Option<&str>) -> Value {
    match value {
        Some(s) => json!(s),
        None => Value::Null,
    }
}

fn field<'a>(array: &'a [Value], pos: usize, name: &str) -> Result<&'a Value> {
    array.get(pos).ok_or_else(|| ProtocolError::MalformedMessage {
        reason: format!("missing {name} at position {pos}"),
    })
}

fn as_i64(array: &[Value], pos: usize, name: &str) -> Result<i64> {
    field(array, pos, name)?.as_i64().ok_or_else(|| ProtocolError::MalformedMessage {
        reason: format!("{name} at position {pos} must be an integer"),
    })
}

fn req_str(array: &[Value], pos: usize, name: &str) -> Result<String> {
    field(array, pos, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::MalformedMessage {
            reason: format!("{name} at position {pos} must be a string"),
        })
}

fn opt_str(array: &[Value], pos: usize, name: &str) -> Result<Option<String>> {
    let value = field(array, pos, name)?;
    if value.is_null() {
        return Ok(None);
    }
    value.as_str().map(|s| Some(s.to_string())).ok_or_else(|| {
        ProtocolError::MalformedMessage {
            reason: format!("{name} at position {pos} must be a string or null"),
        }
    })
}

fn decode_id(value: &Value) -> Result<MessageId> {
    let array = value.as_array().ok_or_else(|| ProtocolError::MalformedMessage {
        reason: "message id must be an array".to_string(),
    })?;
    if array.len() != 6 {
        return Err(ProtocolError::MalformedMessage {
            reason: format!("message id must have 6 elements, got {}", array.len()),
        });
    }
    let partition = as_i64(array, 1, "partition")?;
    let partition = u32::try_from(partition).map_err(|_| ProtocolError::MalformedMessage {
        reason: format!("partition must be a non-negative 32-bit integer, got {partition}"),
    })?;
    Ok(MessageId {
        stream_id: req_str(array, 0, "stream id")?,
        partition,
        timestamp_ms: as_i64(array, 2, "timestamp")?,
        sequence_number: as_i64(array, 3, "sequence number")?,
        publisher_id: Address::from_hex(&req_str(array, 4, "publisher id")?)?,
        msg_chain_id: req_str(array, 5, "message chain id")?,
    })
}

fn decode_prev(value: &Value) -> Result<Option<MessageRef>> {
    if value.is_null() {
        return Ok(None);
    }
    let array = value.as_array().ok_or_else(|| ProtocolError::MalformedMessage {
        reason: "previous ref must be an array or null".to_string(),
    })?;
    if array.len() != 2 {
        return Err(ProtocolError::MalformedMessage {
            reason: format!("previous ref must have 2 elements, got {}", array.len()),
        });
    }
    Ok(Some(MessageRef::new(
        as_i64(array, 0, "previous timestamp")?,
        as_i64(array, 1, "previous sequence number")?,
    )))
}

fn decode_new_group_key(value: &Value) -> Result<Option<EncryptedGroupKey>> {
    if value.is_null() {
        return Ok(None);
    }
    let array = value.as_array().ok_or_else(|| ProtocolError::MalformedMessage {
        reason: "new group key must be an array or null".to_string(),
    })?;
    if array.len() != 2 {
        return Err(ProtocolError::MalformedMessage {
            reason: format!("new group key must have 2 elements, got {}", array.len()),
        });
    }
    Ok(Some(EncryptedGroupKey {
        id: req_str(array, 0, "new group key id")?,
        ciphertext_hex: req_str(array, 1, "new group key ciphertext")?,
    }))
}
