//! Recoverable secp256k1 signatures over message payloads.
//!
//! Publishers sign the keccak-256 of an Ethereum-prefixed challenge built
//! from the canonical payload. Signatures travel as 65 hex-encoded bytes
//! (`r || s || v`) with an optional `0x` prefix; `v` may be raw (0..=3) or
//! Ethereum-offset (27/28). Verification recovers candidate public keys and
//! accepts the signature if any candidate's address matches the claimed
//! publisher, since more than one recovery id can yield a valid key.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::errors::CryptoError;

/// Byte length of a recoverable signature: 64 bytes `r || s` plus `v`.
pub const SIGNATURE_LEN: usize = 65;

const ETH_MESSAGE_PREFIX: &str = "\x19Ethereum Signed Message:\n";

/// Keccak-256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// The prehash a publisher actually signs:
/// `keccak256("\x19Ethereum Signed Message:\n" + len + payload)`.
pub fn challenge_hash(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(ETH_MESSAGE_PREFIX.as_bytes());
    hasher.update(payload.len().to_string().as_bytes());
    hasher.update(payload);
    hasher.finalize().into()
}

/// Sign a payload, producing a `0x`-prefixed 65-byte hex signature.
///
/// # Errors
///
/// Returns `CryptoError::SignatureRecoveryFailed` if the curve operation
/// fails, which only happens with a degenerate key.
pub fn sign(payload: &[u8], key: &SigningKey) -> Result<String, CryptoError> {
    let digest = challenge_hash(payload);
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(&digest)
        .map_err(|_| CryptoError::SignatureRecoveryFailed)?;

    let mut bytes = [0_u8; SIGNATURE_LEN];
    bytes[..64].copy_from_slice(&signature.to_bytes());
    bytes[64] = recovery_id.to_byte();
    Ok(format!("0x{}", hex::encode(bytes)))
}

/// Recover the signer's address from a payload and signature.
///
/// Tries the embedded recovery id first, then the remaining ids, and
/// returns the first address that recovers.
///
/// # Errors
///
/// - `CryptoError::MalformedSignature` if the hex or length is wrong
/// - `CryptoError::SignatureRecoveryFailed` if no id yields a key
pub fn recover_address(payload: &[u8], signature_hex: &str) -> Result<[u8; 20], CryptoError> {
    let (signature, embedded) = parse_signature(signature_hex)?;
    let digest = challenge_hash(payload);
    for id in candidate_ids(embedded) {
        if let Ok(key) = VerifyingKey::recover_from_prehash(&digest, &signature, id) {
            return Ok(address(&key));
        }
    }
    Err(CryptoError::SignatureRecoveryFailed)
}

/// Check a signature against the claimed publisher address.
///
/// Accepts the signature if ANY recoverable candidate key hashes to
/// `expected`; returns `Ok(false)` when none does.
///
/// # Errors
///
/// Returns `CryptoError::MalformedSignature` if the hex or length is wrong.
pub fn verify(
    payload: &[u8],
    signature_hex: &str,
    expected: &[u8; 20],
) -> Result<bool, CryptoError> {
    let (signature, embedded) = parse_signature(signature_hex)?;
    let digest = challenge_hash(payload);
    for id in candidate_ids(embedded) {
        if let Ok(key) = VerifyingKey::recover_from_prehash(&digest, &signature, id) {
            if &address(&key) == expected {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// The 20-byte address of a signing key: the trailing bytes of the
/// keccak-256 of the uncompressed public point without its SEC1 tag.
pub fn address_of(key: &SigningKey) -> [u8; 20] {
    address(key.verifying_key())
}

fn address(key: &VerifyingKey) -> [u8; 20] {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut out = [0_u8; 20];
    out.copy_from_slice(&digest[12..]);
    out
}

fn parse_signature(signature_hex: &str) -> Result<(Signature, Option<RecoveryId>), CryptoError> {
    let stripped = signature_hex.strip_prefix("0x").unwrap_or(signature_hex);
    let bytes = hex::decode(stripped).map_err(|e| CryptoError::MalformedSignature {
        reason: format!("not valid hex: {e}"),
    })?;
    if bytes.len() != SIGNATURE_LEN {
        return Err(CryptoError::MalformedSignature {
            reason: format!("expected {SIGNATURE_LEN} bytes, got {}", bytes.len()),
        });
    }
    let signature = Signature::from_slice(&bytes[..64]).map_err(|e| {
        CryptoError::MalformedSignature { reason: format!("invalid r || s: {e}") }
    })?;
    let v = bytes[64];
    let raw = if v >= 27 { v - 27 } else { v };
    Ok((signature, RecoveryId::from_byte(raw)))
}

// The embedded id fronts the candidate list; a wrong or missing id still
// lets verification succeed through the exhaustive tail.
fn candidate_ids(embedded: Option<RecoveryId>) -> impl Iterator<Item = RecoveryId> {
    embedded.into_iter().chain(
        (0_u8..=3).filter_map(RecoveryId::from_byte).filter(move |id| Some(*id) != embedded),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_key() -> SigningKey {
        SigningKey::from_slice(&[0x3d; 32]).unwrap()
    }

    #[test]
    fn sign_then_verify_against_own_address() {
        let key = test_key();
        let signature = sign(b"payload", &key).unwrap();
        assert!(verify(b"payload", &signature, &address_of(&key)).unwrap());
    }

    #[test]
    fn recovery_matches_signer() {
        let key = test_key();
        let signature = sign(b"payload", &key).unwrap();
        assert_eq!(recover_address(b"payload", &signature).unwrap(), address_of(&key));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let key = test_key();
        let signature = sign(b"payload", &key).unwrap();
        assert!(!verify(b"tampered", &signature, &address_of(&key)).unwrap());
    }

    #[test]
    fn wrong_address_fails_verification() {
        let key = test_key();
        let signature = sign(b"payload", &key).unwrap();
        assert!(!verify(b"payload", &signature, &[0_u8; 20]).unwrap());
    }

    #[test]
    fn ethereum_offset_v_is_accepted() {
        let key = test_key();
        let signature = sign(b"payload", &key).unwrap();
        let mut bytes = hex::decode(signature.strip_prefix("0x").unwrap()).unwrap();
        bytes[64] += 27;
        let offset = hex::encode(bytes);
        assert!(verify(b"payload", &offset, &address_of(&key)).unwrap());
    }

    #[test]
    fn short_signature_is_rejected() {
        let result = verify(b"payload", "0xabcd", &[0_u8; 20]);
        assert!(matches!(result, Err(CryptoError::MalformedSignature { .. })));
    }

    #[test]
    fn challenge_hash_is_length_prefixed() {
        // Equal-prefix payloads of different length must hash apart.
        assert_ne!(challenge_hash(b"aa"), challenge_hash(b"a"));
    }
}
