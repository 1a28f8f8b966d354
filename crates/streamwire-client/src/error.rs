//! Error types for the subscriber state machine.
//!
//! Two tiers, following the taxonomy of the protocol: [`SubscriberError`]
//! for caller mistakes and unrecoverable state-machine failures (returned
//! from `handle`), and [`StreamError`] for per-message and per-chain
//! failures that never abort the subscription (carried in
//! `SubscriberAction::ReportError`).

use streamwire_crypto::CryptoError;
use streamwire_proto::{Address, MessageRef, ProtocolError};
use thiserror::Error;

/// Errors returned synchronously from `Subscriber::handle`.
#[derive(Debug, Error)]
pub enum SubscriberError {
    /// A subscription already exists for the (stream, partition) pair.
    #[error("already subscribed to stream {stream_id} partition {partition}")]
    AlreadySubscribed {
        /// Stream of the colliding subscribe.
        stream_id: String,
        /// Partition of the colliding subscribe.
        partition: u32,
    },

    /// No subscription exists for the (stream, partition) pair.
    #[error("no subscription for stream {stream_id} partition {partition}")]
    SubscriptionNotFound {
        /// Stream of the unknown pair.
        stream_id: String,
        /// Partition of the unknown pair.
        partition: u32,
    },

    /// Group key store misuse.
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// Malformed protocol input.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Key-exchange material could not be produced.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors from the group key store.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Key ids are globally unique across all streams of one store.
    #[error("group key {key_id} already exists (held for stream {stream_id})")]
    KeyAlreadyExists {
        /// The duplicated key id.
        key_id: String,
        /// The stream already holding that id.
        stream_id: String,
    },
}

/// Recoverable per-message and per-chain failures.
///
/// Reported to the application through `SubscriberAction::ReportError`;
/// the subscription stays usable after every variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A message's signature did not verify against its publisher address.
    /// The message was dropped, never delivered.
    #[error("invalid signature on message from {publisher} in stream {stream_id}")]
    InvalidSignature {
        /// Stream the message belonged to.
        stream_id: String,
        /// Claimed publisher address.
        publisher: Address,
    },

    /// A message could not be decrypted with the key it named.
    #[error("unable to decrypt message in stream {stream_id} with group key {group_key_id}")]
    UnableToDecrypt {
        /// Stream the message belonged to.
        stream_id: String,
        /// The key id the message named.
        group_key_id: String,
    },

    /// Resend retries for a gap were exhausted. The chain resumes with the
    /// messages it has; the application decides whether to abort.
    #[error(
        "gap fill failed for publisher {publisher} chain {msg_chain_id}: \
         missing messages in ({from:?}, {to:?}]"
    )]
    GapFillFailed {
        /// Publisher owning the chain.
        publisher: Address,
        /// Chain the gap occurred on.
        msg_chain_id: String,
        /// Last delivered ref (exclusive gap bound).
        from: MessageRef,
        /// First withheld ref's predecessor (inclusive gap bound).
        to: MessageRef,
    },
}
