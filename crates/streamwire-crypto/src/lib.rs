//! Cryptographic primitives for the Streamwire protocol.
//!
//! Three concerns live here:
//!
//! - **Key exchange** ([`exchange`]): temporary RSA key pairs used to wrap
//!   symmetric group keys in transit between publisher and subscriber.
//! - **Content encryption** ([`cipher`]): AES-256-CTR over message payloads
//!   under a shared [`GroupKey`].
//! - **Publisher identity** ([`signing`]): recoverable secp256k1 signatures
//!   over a canonical message payload, bound to a 20-byte keccak address.
//!
//! Secret material (group key bytes) is zeroed on drop.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cipher;
mod errors;
pub mod exchange;
mod group_key;
pub mod signing;

pub use errors::CryptoError;
pub use exchange::ExchangeKeyPair;
pub use group_key::GroupKey;

// Callers hold `SigningKey`s for test publishers; keep the version aligned.
pub use k256;
