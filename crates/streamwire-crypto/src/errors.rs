//! Error types for the crypto layer.

use thiserror::Error;

/// Errors produced by key exchange, content encryption, and signing.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A PEM document was structurally invalid or not the expected kind.
    #[error("malformed PEM: {reason}")]
    MalformedPem {
        /// What was wrong with the document.
        reason: String,
    },

    /// A requested RSA modulus was below the accepted minimum.
    #[error("modulus of {bits} bits is below the 2048-bit minimum")]
    WeakModulus {
        /// The rejected bit length.
        bits: usize,
    },

    /// RSA key pair generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(#[source] rsa::Error),

    /// A key could not be rendered as PEM.
    #[error("PEM encoding failed: {reason}")]
    PemEncode {
        /// Underlying encoder message.
        reason: String,
    },

    /// Wrapping a group key under an RSA public key failed.
    #[error("group key wrap failed: {0}")]
    WrapFailed(#[source] rsa::Error),

    /// Unwrapping a group key with the private key failed, usually because
    /// the ciphertext was wrapped for a different key pair.
    #[error("group key unwrap failed: {0}")]
    UnwrapFailed(#[source] rsa::Error),

    /// Group key material had the wrong length.
    #[error("invalid group key: expected 32 bytes, got {length}")]
    InvalidGroupKey {
        /// Actual byte length of the rejected material.
        length: usize,
    },

    /// A hex ciphertext was not decodable or too short to hold its IV.
    #[error("malformed ciphertext: {reason}")]
    MalformedCiphertext {
        /// What was wrong with the ciphertext.
        reason: String,
    },

    /// A signature string was not 65 bytes of hex.
    #[error("malformed signature: {reason}")]
    MalformedSignature {
        /// What was wrong with the signature.
        reason: String,
    },

    /// No recovery id yielded a valid public key for the signature.
    #[error("no public key could be recovered from the signature")]
    SignatureRecoveryFailed,
}
