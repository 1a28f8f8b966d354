//! Symmetric group keys shared by a stream's publishers and subscribers.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::CryptoError;

/// Byte length of group key material (AES-256).
pub const GROUP_KEY_LEN: usize = 32;

/// A named 256-bit symmetric key protecting a stream's message content.
///
/// The key id travels in cleartext on every encrypted message; the secret
/// bytes only ever travel RSA-wrapped. Secret material is zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct GroupKey {
    #[zeroize(skip)]
    id: String,
    secret: [u8; GROUP_KEY_LEN],
}

impl GroupKey {
    /// Wrap existing key material under an id.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidGroupKey` if `secret` is not exactly
    /// 32 bytes.
    pub fn new(id: impl Into<String>, secret: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; GROUP_KEY_LEN] = secret
            .try_into()
            .map_err(|_| CryptoError::InvalidGroupKey { length: secret.len() })?;
        Ok(Self { id: id.into(), secret })
    }

    /// The key's cleartext identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The raw key material.
    pub fn secret(&self) -> &[u8; GROUP_KEY_LEN] {
        &self.secret
    }
}

// Never print key material, not even in debug output.
impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKey").field("id", &self.id).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_material() {
        let result = GroupKey::new("key-1", &[0_u8; 16]);
        assert!(matches!(result, Err(CryptoError::InvalidGroupKey { length: 16 })));
    }

    #[test]
    fn accepts_exact_material() {
        let key = GroupKey::new("key-1", &[7_u8; 32]).unwrap();
        assert_eq!(key.id(), "key-1");
        assert_eq!(key.secret(), &[7_u8; 32]);
    }

    #[test]
    fn debug_output_hides_secret() {
        let key = GroupKey::new("key-1", &[7_u8; 32]).unwrap();
        let rendered = format!("{key:?}");
        assert!(rendered.contains("key-1"));
        assert!(!rendered.contains('7'));
    }
}
