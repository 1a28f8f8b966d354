//! Shared group key store.
//!
//! One store per subscriber, shared by all of its subscriptions. Key ids
//! are globally unique across streams: a publisher never reuses an id, so
//! a colliding add is a caller error, not a rotation.

use std::collections::HashMap;

use streamwire_crypto::GroupKey;
use tracing::debug;

use crate::error::KeyStoreError;

/// Maps key ids to group keys and tracks each stream's current key.
#[derive(Default)]
pub struct GroupKeyStore {
    /// key id → (owning stream, key material).
    keys: HashMap<String, (String, GroupKey)>,
    /// stream id → most recently added key id.
    current: HashMap<String, String>,
}

impl GroupKeyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key for a stream and mark it current.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError::KeyAlreadyExists` if the key id is held by
    /// any stream. The failed add leaves current-key state untouched.
    pub fn add(&mut self, stream_id: &str, key: GroupKey) -> Result<(), KeyStoreError> {
        if let Some((holder, _)) = self.keys.get(key.id()) {
            return Err(KeyStoreError::KeyAlreadyExists {
                key_id: key.id().to_string(),
                stream_id: holder.clone(),
            });
        }
        debug!(stream_id, key_id = key.id(), "adding group key");
        self.current.insert(stream_id.to_string(), key.id().to_string());
        self.keys.insert(key.id().to_string(), (stream_id.to_string(), key));
        Ok(())
    }

    /// Look up a key by stream and id. `None` if absent or held by a
    /// different stream.
    pub fn get(&self, stream_id: &str, key_id: &str) -> Option<&GroupKey> {
        self.keys.get(key_id).filter(|(holder, _)| holder == stream_id).map(|(_, key)| key)
    }

    /// Whether any stream holds the key id.
    pub fn contains(&self, key_id: &str) -> bool {
        self.keys.contains_key(key_id)
    }

    /// The stream's most recently added key.
    pub fn current_key(&self, stream_id: &str) -> Option<&GroupKey> {
        let key_id = self.current.get(stream_id)?;
        self.get(stream_id, key_id)
    }

    /// All key ids held for a stream.
    pub fn key_ids(&self, stream_id: &str) -> Vec<String> {
        self.keys
            .iter()
            .filter(|(_, (holder, _))| holder == stream_id)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key(id: &str, byte: u8) -> GroupKey {
        GroupKey::new(id, &[byte; 32]).unwrap()
    }

    #[test]
    fn add_makes_key_current() {
        let mut store = GroupKeyStore::new();
        store.add("s1", key("k1", 1)).unwrap();
        store.add("s1", key("k2", 2)).unwrap();
        assert_eq!(store.current_key("s1").unwrap().id(), "k2");
        assert!(store.get("s1", "k1").is_some());
    }

    #[test]
    fn key_ids_are_globally_unique() {
        let mut store = GroupKeyStore::new();
        store.add("s1", key("k1", 1)).unwrap();

        let result = store.add("s2", key("k1", 9));
        assert!(matches!(
            result,
            Err(KeyStoreError::KeyAlreadyExists { key_id, stream_id })
                if key_id == "k1" && stream_id == "s1"
        ));
        // The failed add must not disturb s2's current key.
        assert!(store.current_key("s2").is_none());
    }

    #[test]
    fn lookup_is_stream_scoped() {
        let mut store = GroupKeyStore::new();
        store.add("s1", key("k1", 1)).unwrap();
        assert!(store.get("s2", "k1").is_none());
        assert!(store.contains("k1"));
    }
}
