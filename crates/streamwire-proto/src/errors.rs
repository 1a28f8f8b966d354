//! Error types for message construction and wire decoding.
//!
//! Decoding is strict: structural problems and unknown codes are distinct
//! errors so the caller can decide whether a message is salvageable. Both
//! are fatal to the single message only, never to the stream.

use thiserror::Error;

/// Errors from message construction, encoding, and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Wire bytes do not have the expected array shape or element types.
    #[error("malformed message: {reason}")]
    MalformedMessage {
        /// What was wrong, naming the offending position.
        reason: String,
    },

    /// A version or enum code on the wire is not recognized.
    #[error("unsupported format: unknown {field} code {code}")]
    UnsupportedFormat {
        /// Which field carried the unknown code.
        field: &'static str,
        /// The offending code.
        code: i64,
    },

    /// Parsed content was requested on a message that is still encrypted.
    #[error("content is not accessible: message is encrypted, decrypt first")]
    ContentNotAccessible,

    /// A key-rotation announcement re-announced the key the message is
    /// already encrypted with.
    #[error("new group key {key_id} must differ from the message's group key")]
    InvalidNewGroupKey {
        /// The duplicated key id.
        key_id: String,
    },

    /// Caller error surfaced synchronously at the call that caused it.
    #[error("illegal argument: {reason}")]
    IllegalArgument {
        /// What the caller got wrong.
        reason: String,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;
