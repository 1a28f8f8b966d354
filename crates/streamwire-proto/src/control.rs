//! Key-exchange control messages and resend requests.
//!
//! Control messages use the same fixed-position array convention as the
//! data codec but carry their own version tag, independent of the data
//! message versions.

use serde_json::{Value, json};

use crate::{
    errors::{ProtocolError, Result},
    message::{EncryptedGroupKey, MessageRef, MessageType},
};

/// Wire version of the control message layer.
pub const CONTROL_VERSION: u8 = 2;

/// A publisher's answer to a group key request: one or more encrypted
/// group keys for a stream.
///
/// Wire form: `[version, 29, requestId, streamId, [[keyId, ciphertextHex], ..]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupKeyResponse {
    /// Correlates the response with the request that triggered it.
    pub request_id: String,
    /// Stream the keys belong to.
    pub stream_id: String,
    /// Keys wrapped with the requester's RSA public key.
    pub keys: Vec<EncryptedGroupKey>,
}

impl GroupKeyResponse {
    /// Encode to the control wire form.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MalformedMessage` if serialization fails.
    pub fn encode(&self) -> Result<String> {
        let keys: Vec<Value> =
            self.keys.iter().map(|k| json!([k.id, k.ciphertext_hex])).collect();
        let array = json!([
            CONTROL_VERSION,
            MessageType::GroupKeyResponse.code(),
            self.request_id,
            self.stream_id,
            keys,
        ]);
        serde_json::to_string(&array).map_err(|e| ProtocolError::MalformedMessage {
            reason: format!("failed to serialize group key response: {e}"),
        })
    }

    /// Decode from the control wire form.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MalformedMessage` on shape problems and
    /// `ProtocolError::UnsupportedFormat` on unknown version or type codes.
    pub fn decode(raw: &str) -> Result<Self> {
        let array = control_array(raw, MessageType::GroupKeyResponse, 5)?;
        let keys = array[4]
            .as_array()
            .ok_or_else(|| ProtocolError::MalformedMessage {
                reason: "group key list at position 4 must be an array".to_string(),
            })?
            .iter()
            .map(decode_key_entry)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            request_id: control_str(&array, 2, "request id")?,
            stream_id: control_str(&array, 3, "stream id")?,
            keys,
        })
    }
}

/// A publisher's refusal (or inability) to serve a group key request.
///
/// Wire form:
/// `[version, 31, requestId, streamId, errorCode, errorMessage, [keyId, ..]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupKeyErrorResponse {
    /// Correlates the error with the request that triggered it.
    pub request_id: String,
    /// Stream the request was for.
    pub stream_id: String,
    /// Machine-readable error class.
    pub error_code: String,
    /// Human-readable description.
    pub error_message: String,
    /// The key ids the request asked for.
    pub group_key_ids: Vec<String>,
}

impl GroupKeyErrorResponse {
    /// Encode to the control wire form.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MalformedMessage` if serialization fails.
    pub fn encode(&self) -> Result<String> {
        let array = json!([
            CONTROL_VERSION,
            MessageType::GroupKeyErrorResponse.code(),
            self.request_id,
            self.stream_id,
            self.error_code,
            self.error_message,
            self.group_key_ids,
        ]);
        serde_json::to_string(&array).map_err(|e| ProtocolError::MalformedMessage {
            reason: format!("failed to serialize group key error response: {e}"),
        })
    }

    /// Decode from the control wire form.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MalformedMessage` on shape problems and
    /// `ProtocolError::UnsupportedFormat` on unknown version or type codes.
    pub fn decode(raw: &str) -> Result<Self> {
        let array = control_array(raw, MessageType::GroupKeyErrorResponse, 7)?;
        let group_key_ids = array[6]
            .as_array()
            .ok_or_else(|| ProtocolError::MalformedMessage {
                reason: "group key id list at position 6 must be an array".to_string(),
            })?
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_str().map(str::to_string).ok_or_else(|| ProtocolError::MalformedMessage {
                    reason: format!("group key id {i} must be a string"),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            request_id: control_str(&array, 2, "request id")?,
            stream_id: control_str(&array, 3, "stream id")?,
            error_code: control_str(&array, 4, "error code")?,
            error_message: control_str(&array, 5, "error message")?,
            group_key_ids,
        })
    }
}

fn control_array(raw: &str, expected: MessageType, arity: usize) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ProtocolError::MalformedMessage {
        reason: format!("not valid JSON: {e}"),
    })?;
    let array = match value {
        Value::Array(a) => a,
        _ => {
            return Err(ProtocolError::MalformedMessage {
                reason: "control message must be a JSON array".to_string(),
            });
        }
    };
    if array.len() != arity {
        return Err(ProtocolError::MalformedMessage {
            reason: format!("control message must have {arity} elements, got {}", array.len()),
        });
    }
    let version = control_i64(&array, 0, "version")?;
    if version != i64::from(CONTROL_VERSION) {
        return Err(ProtocolError::UnsupportedFormat { field: "control version", code: version });
    }
    let type_code = control_i64(&array, 1, "message type")?;
    if MessageType::from_code(type_code)? != expected {
        return Err(ProtocolError::MalformedMessage {
            reason: format!("expected message type {}, got {type_code}", expected.code()),
        });
    }
    Ok(array)
}

fn control_i64(array: &[Value], pos: usize, name: &str) -> Result<i64> {
    array
        .get(pos)
        .and_then(Value::as_i64)
        .ok_or_else(|| ProtocolError::MalformedMessage {
            reason: format!("{name} at position {pos} must be an integer"),
        })
}

fn control_str(array: &[Value], pos: usize, name: &str) -> Result<String> {
    array
        .get(pos)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::MalformedMessage {
            reason: format!("{name} at position {pos} must be a string"),
        })
}

fn decode_key_entry(value: &Value) -> Result<EncryptedGroupKey> {
    let pair = value.as_array().ok_or_else(|| ProtocolError::MalformedMessage {
        reason: "group key entry must be an array".to_string(),
    })?;
    if pair.len() != 2 {
        return Err(ProtocolError::MalformedMessage {
            reason: format!("group key entry must have 2 elements, got {}", pair.len()),
        });
    }
    Ok(EncryptedGroupKey {
        id: control_str(pair, 0, "group key id")?,
        ciphertext_hex: control_str(pair, 1, "group key ciphertext")?,
    })
}

/// Filter narrowing a resend request to one publisher's message chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendFilter {
    /// Publisher address, lowercase hex with `0x` prefix.
    pub publisher_id: String,
    /// Message chain within that publisher's stream partition.
    pub msg_chain_id: String,
}

/// A request for historical messages from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResendRequest {
    /// The most recent `count` messages.
    Last {
        /// Number of messages, newest first on the wire, replayed oldest first.
        count: u64,
    },
    /// Everything from `from` (inclusive) to the present.
    From {
        /// Lower bound.
        from: MessageRef,
        /// Optional publisher/chain narrowing.
        filter: Option<ResendFilter>,
    },
    /// Everything between `from` and `to`, both inclusive.
    Range {
        /// Lower bound.
        from: MessageRef,
        /// Upper bound, never below `from`.
        to: MessageRef,
        /// Optional publisher/chain narrowing.
        filter: Option<ResendFilter>,
    },
}

impl ResendRequest {
    /// Build a range request, validating the bounds.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::IllegalArgument` if `from > to`.
    pub fn range(from: MessageRef, to: MessageRef, filter: Option<ResendFilter>) -> Result<Self> {
        if from > to {
            return Err(ProtocolError::IllegalArgument {
                reason: format!(
                    "resend range is inverted: from {from:?} is past to {to:?}"
                ),
            });
        }
        Ok(Self::Range { from, to, filter })
    }
}
