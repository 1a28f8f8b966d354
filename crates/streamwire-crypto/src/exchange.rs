//! RSA key exchange for group keys.
//!
//! Subscribers hold a temporary RSA key pair. Its public half travels (as
//! PEM) inside group key requests; publishers wrap group keys under it with
//! OAEP and the subscriber unwraps them with the private half. The pair
//! never outlives the subscriber session and is never persisted.

use rand::{CryptoRng, RngCore};
use rsa::{
    Oaep, RsaPrivateKey, RsaPublicKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{errors::CryptoError, group_key::GroupKey};

/// Default RSA modulus size for generated pairs.
pub const DEFAULT_MODULUS_BITS: usize = 4096;

/// Smallest modulus the exchange accepts.
const MIN_MODULUS_BITS: usize = 2048;

/// A subscriber-session RSA key pair for receiving wrapped group keys.
pub struct ExchangeKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl ExchangeKeyPair {
    /// Generate a fresh pair at the default modulus size.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyGeneration` if prime generation fails.
    pub fn generate<R: CryptoRng + RngCore>(rng: &mut R) -> Result<Self, CryptoError> {
        Self::generate_with_bits(rng, DEFAULT_MODULUS_BITS)
    }

    /// Generate a fresh pair at an explicit modulus size.
    ///
    /// Full-size generation is slow; tests use 2048-bit pairs.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::WeakModulus` below 2048 bits and
    /// `CryptoError::KeyGeneration` if prime generation fails.
    pub fn generate_with_bits<R: CryptoRng + RngCore>(
        rng: &mut R,
        bits: usize,
    ) -> Result<Self, CryptoError> {
        if bits < MIN_MODULUS_BITS {
            return Err(CryptoError::WeakModulus { bits });
        }
        let private = RsaPrivateKey::new(rng, bits).map_err(CryptoError::KeyGeneration)?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// Reconstruct a pair from a PKCS#8 private key PEM.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::MalformedPem` if the document lacks PEM
    /// framing or does not parse as a private key.
    pub fn from_private_key_pem(pem: &str) -> Result<Self, CryptoError> {
        check_pem_framing(pem)?;
        let private =
            RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| CryptoError::MalformedPem {
                reason: format!("not a PKCS#8 private key: {e}"),
            })?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// The public half, for embedding in group key requests.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Render the public half as SPKI PEM.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::PemEncode` if DER encoding fails.
    pub fn public_key_pem(&self) -> Result<String, CryptoError> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::PemEncode { reason: e.to_string() })
    }

    /// Render the private half as PKCS#8 PEM, zeroed when dropped.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::PemEncode` if DER encoding fails.
    pub fn private_key_pem(&self) -> Result<Zeroizing<String>, CryptoError> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::PemEncode { reason: e.to_string() })
    }

    /// Unwrap a hex OAEP ciphertext into a group key under `key_id`.
    ///
    /// # Errors
    ///
    /// - `CryptoError::MalformedCiphertext` if the hex does not decode
    /// - `CryptoError::UnwrapFailed` if OAEP decryption fails, typically
    ///   because the key was wrapped for a different pair
    /// - `CryptoError::InvalidGroupKey` if the plaintext is not 32 bytes
    pub fn unwrap_key(&self, wrapped_hex: &str, key_id: &str) -> Result<GroupKey, CryptoError> {
        let ciphertext =
            hex::decode(wrapped_hex).map_err(|e| CryptoError::MalformedCiphertext {
                reason: format!("wrapped key is not valid hex: {e}"),
            })?;
        let secret = Zeroizing::new(
            self.private
                .decrypt(Oaep::new::<Sha256>(), &ciphertext)
                .map_err(CryptoError::UnwrapFailed)?,
        );
        GroupKey::new(key_id, &secret)
    }
}

// RsaPrivateKey's Debug prints modulus internals; keep it opaque here.
impl std::fmt::Debug for ExchangeKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeKeyPair").finish_non_exhaustive()
    }
}

/// Parse a counterparty's SPKI public key PEM.
///
/// # Errors
///
/// Returns `CryptoError::MalformedPem` if the document lacks PEM framing
/// or does not parse as a public key.
pub fn import_public_key_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    check_pem_framing(pem)?;
    RsaPublicKey::from_public_key_pem(pem).map_err(|e| CryptoError::MalformedPem {
        reason: format!("not an SPKI public key: {e}"),
    })
}

/// Wrap a group key under a recipient's public key, producing hex.
///
/// # Errors
///
/// Returns `CryptoError::WrapFailed` if OAEP encryption fails.
pub fn wrap_key<R: CryptoRng + RngCore>(
    rng: &mut R,
    recipient: &RsaPublicKey,
    key: &GroupKey,
) -> Result<String, CryptoError> {
    let ciphertext = recipient
        .encrypt(rng, Oaep::new::<Sha256>(), key.secret())
        .map_err(CryptoError::WrapFailed)?;
    Ok(hex::encode(ciphertext))
}

// Reject non-PEM input before handing it to the DER parser, so callers get
// a framing diagnostic instead of a base64 one.
fn check_pem_framing(pem: &str) -> Result<(), CryptoError> {
    let trimmed = pem.trim();
    if !trimmed.starts_with("-----BEGIN ") || !trimmed.ends_with("-----") {
        return Err(CryptoError::MalformedPem {
            reason: "missing -----BEGIN/END----- framing".to_string(),
        });
    }
    Ok(())
}
