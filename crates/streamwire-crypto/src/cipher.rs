//! AES-256-CTR content encryption.
//!
//! Ciphertexts travel as lowercase hex: 16 IV bytes (32 hex characters)
//! followed by the keystream-encrypted payload. CTR mode means ciphertext
//! length equals plaintext length, so any hex string of at least 32
//! characters with even length is structurally valid.

use aes::{
    Aes256,
    cipher::{KeyIvInit, StreamCipher},
};
use ctr::Ctr128BE;

use crate::{errors::CryptoError, group_key::GroupKey};

type Aes256Ctr = Ctr128BE<Aes256>;

/// Byte length of the counter-mode IV.
pub const IV_LEN: usize = 16;

/// Hex characters occupied by the IV prefix of a ciphertext.
const IV_HEX_LEN: usize = IV_LEN * 2;

/// Encrypt a payload under a group key, producing `hex(iv) || hex(ct)`.
///
/// The IV must be fresh per message; callers draw it from their
/// environment's randomness source.
pub fn encrypt(plaintext: &[u8], key: &GroupKey, iv: [u8; IV_LEN]) -> String {
    let mut cipher = Aes256Ctr::new(key.secret().into(), &iv.into());
    let mut buffer = plaintext.to_vec();
    cipher.apply_keystream(&mut buffer);
    format!("{}{}", hex::encode(iv), hex::encode(buffer))
}

/// Decrypt a `hex(iv) || hex(ct)` ciphertext under a group key.
///
/// # Errors
///
/// Returns `CryptoError::MalformedCiphertext` if the string is too short
/// to hold an IV or is not valid hex.
pub fn decrypt(ciphertext_hex: &str, key: &GroupKey) -> Result<Vec<u8>, CryptoError> {
    if ciphertext_hex.len() < IV_HEX_LEN {
        return Err(CryptoError::MalformedCiphertext {
            reason: format!(
                "expected at least {IV_HEX_LEN} hex characters, got {}",
                ciphertext_hex.len()
            ),
        });
    }
    let (iv_hex, payload_hex) = ciphertext_hex.split_at(IV_HEX_LEN);
    let iv: [u8; IV_LEN] = hex::decode(iv_hex)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| CryptoError::MalformedCiphertext {
            reason: "IV prefix is not valid hex".to_string(),
        })?;
    let mut buffer = hex::decode(payload_hex).map_err(|e| CryptoError::MalformedCiphertext {
        reason: format!("payload is not valid hex: {e}"),
    })?;

    let mut cipher = Aes256Ctr::new(key.secret().into(), &iv.into());
    cipher.apply_keystream(&mut buffer);
    Ok(buffer)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn test_key() -> GroupKey {
        GroupKey::new("key-1", &[0x42; 32]).unwrap()
    }

    #[test]
    fn round_trip() {
        let key = test_key();
        let ciphertext = encrypt(b"hello streams", &key, [9; IV_LEN]);
        assert_eq!(decrypt(&ciphertext, &key).unwrap(), b"hello streams");
    }

    #[test]
    fn iv_travels_in_the_clear() {
        let ciphertext = encrypt(b"payload", &test_key(), [0xab; IV_LEN]);
        assert!(ciphertext.starts_with(&"ab".repeat(IV_LEN)));
    }

    #[test]
    fn wrong_key_garbles_plaintext() {
        let ciphertext = encrypt(b"payload", &test_key(), [9; IV_LEN]);
        let other = GroupKey::new("key-2", &[0x43; 32]).unwrap();
        assert_ne!(decrypt(&ciphertext, &other).unwrap(), b"payload");
    }

    #[test]
    fn short_input_is_rejected() {
        let result = decrypt("abcd", &test_key());
        assert!(matches!(result, Err(CryptoError::MalformedCiphertext { .. })));
    }

    #[test]
    fn non_hex_input_is_rejected() {
        let bad = "zz".repeat(IV_LEN + 4);
        let result = decrypt(&bad, &test_key());
        assert!(matches!(result, Err(CryptoError::MalformedCiphertext { .. })));
    }

    proptest! {
        /// Any payload survives an encrypt/decrypt round trip.
        #[test]
        fn round_trip_arbitrary(payload in prop::collection::vec(any::<u8>(), 0..512),
                                iv in any::<[u8; IV_LEN]>(),
                                secret in any::<[u8; 32]>()) {
            let key = GroupKey::new("k", &secret).unwrap();
            let ciphertext = encrypt(&payload, &key, iv);
            prop_assert_eq!(decrypt(&ciphertext, &key).unwrap(), payload);
        }
    }
}
