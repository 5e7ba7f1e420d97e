//! # Persistence Contract
//!
//! The core never owns durable storage. The collaborator injects a
//! key-value capability and the core confines itself to three namespaces:
//!
//! - `identity` - the opaque identity blob
//! - `outbox/<message_id>` - durable outbox rows
//! - `favorites/<peer_id>` - the favorites map
//!
//! Each status transition of an outbox row is a single `put`, which the
//! backend is expected to apply atomically.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::Result;

/// Key prefix for outbox rows.
pub const OUTBOX_PREFIX: &str = "outbox/";

/// Key prefix for favorite records.
pub const FAVORITES_PREFIX: &str = "favorites/";

/// Key of the identity blob.
pub const IDENTITY_KEY: &str = "identity";

/// The persistence capability the collaborator provides.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value, replacing any existing one.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// In-memory store used in tests and as the default wiring.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").unwrap(), None);

        store.put("a", b"1").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));

        store.put("a", b"2").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"2".to_vec()));

        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        // Deleting again is fine
        store.delete("a").unwrap();
    }

    #[test]
    fn test_scan_prefix() {
        let store = MemoryStore::new();
        store.put("outbox/01", b"a").unwrap();
        store.put("outbox/02", b"b").unwrap();
        store.put("favorites/x", b"c").unwrap();

        let rows = store.scan_prefix(OUTBOX_PREFIX).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "outbox/01");
        assert_eq!(rows[1].0, "outbox/02");

        assert!(store.scan_prefix("missing/").unwrap().is_empty());
    }
}
