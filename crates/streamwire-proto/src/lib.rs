//! Streamwire message model and wire codec.
//!
//! The content layer of the Streamwire protocol: typed stream messages
//! ([`StreamMessage`]) with per-publisher chain identity, the versioned
//! fixed-position array wire encoding ([`wire`]), and the group-key control
//! messages and resend-request parameters exchanged with the transport
//! collaborator ([`control`]).
//!
//! This crate holds pure data and (de)serialization only. Signature
//! verification and content decryption live in `streamwire-crypto`; the
//! ordering and subscription machinery lives in `streamwire-client`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod control;
mod errors;
mod message;
pub mod wire;

pub use control::{GroupKeyErrorResponse, GroupKeyResponse, ResendFilter, ResendRequest};
pub use errors::ProtocolError;
pub use message::{
    Address, ContentType, EncryptedGroupKey, EncryptionType, MessageId, MessageRef, MessageType,
    SignatureType, StreamMessage,
};
