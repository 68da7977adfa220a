/*!

The secret cache: an in-memory write-through/write-back buffer sitting
in front of [crate::store::secret::SecretStore], keyed by identity id.
See spec's SecretCache note in §2.

 */
use dashmap::DashMap;
use std::collections::HashMap;

use crate::credentials::Credentials;
use crate::error::Result;
use crate::method_cache::MethodCache;
use crate::store::secret::SecretStore;

#[derive(Clone, Default)]
struct CachedIdentity {
    credentials: Option<Credentials>,
    methods: HashMap<u32, MethodCache>,
}

/// A per-process cache of the most recently seen secret data for each
/// identity, so repeated reads (e.g. re-checking a password within one
/// session) don't round-trip through SQLite.
#[derive(Default)]
pub struct SecretCache {
    entries: DashMap<u32, CachedIdentity>,
}

impl SecretCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credentials(&self, id: u32) -> Option<Credentials> {
        self.entries.get(&id).and_then(|e| e.credentials.clone())
    }

    pub fn put_credentials(&self, id: u32, creds: Credentials) {
        self.entries.entry(id).or_default().credentials = Some(creds);
    }

    pub fn method_data(&self, id: u32, method_id: u32) -> Option<MethodCache> {
        self.entries.get(&id).and_then(|e| e.methods.get(&method_id).cloned())
    }

    pub fn put_method_data(&self, id: u32, method_id: u32, data: MethodCache) {
        self.entries.entry(id).or_default().methods.insert(method_id, data);
    }

    pub fn remove_method_data(&self, id: u32, method_id: Option<u32>) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            match method_id {
                Some(method_id) => {
                    entry.methods.remove(&method_id);
                }
                None => entry.methods.clear(),
            }
        }
    }

    /// Drops every cached value for `id` (the identity was removed, or its
    /// secrets were otherwise invalidated).
    pub fn remove_identity(&self, id: u32) {
        self.entries.remove(&id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Writes every cached entry for `id` into `store`, atomically per the
    /// underlying store's own transaction semantics.
    pub fn flush(&self, id: u32, store: &mut SecretStore, max_data_storage: usize) -> Result<()> {
        let Some(entry) = self.entries.get(&id) else {
            return Ok(());
        };
        if let Some(creds) = &entry.credentials {
            store.update_credentials(creds)?;
        }
        for (method_id, data) in &entry.methods {
            store.update_data(id, *method_id, data, max_data_storage)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_roundtrip() {
        let cache = SecretCache::new();
        assert!(cache.credentials(1).is_none());
        cache.put_credentials(1, Credentials::new(1, "alice", "p@ss"));
        assert_eq!(cache.credentials(1).unwrap().username, "alice");
    }

    #[test]
    fn test_method_data_roundtrip() {
        let cache = SecretCache::new();
        let mut data = MethodCache::new();
        data.insert("token".into(), crate::method_cache::Value::Str("abc".into()));
        cache.put_method_data(1, 5, data.clone());
        assert_eq!(cache.method_data(1, 5).unwrap(), data);
        assert!(cache.method_data(1, 6).is_none());
    }

    #[test]
    fn test_remove_method_data_single_vs_all() {
        let cache = SecretCache::new();
        let data = MethodCache::new();
        cache.put_method_data(1, 5, data.clone());
        cache.put_method_data(1, 6, data.clone());
        cache.remove_method_data(1, Some(5));
        assert!(cache.method_data(1, 5).is_none());
        assert!(cache.method_data(1, 6).is_some());
        cache.remove_method_data(1, None);
        assert!(cache.method_data(1, 6).is_none());
    }

    #[test]
    fn test_remove_identity_drops_everything() {
        let cache = SecretCache::new();
        cache.put_credentials(1, Credentials::new(1, "a", "p"));
        cache.remove_identity(1);
        assert!(cache.credentials(1).is_none());
    }

    #[test]
    fn test_flush_writes_through_to_store() {
        use tempfile::tempdir;
        let dir = tempdir().unwrap();
        let mut store = SecretStore::new();
        store.open(&dir.path().join("secret.db")).unwrap();

        let cache = SecretCache::new();
        cache.put_credentials(1, Credentials::new(1, "alice", "p@ss"));
        cache
            .flush(1, &mut store, crate::store::secret::DEFAULT_MAX_DATA_STORAGE)
            .unwrap();

        let loaded = store.load_credentials(1).unwrap().unwrap();
        assert_eq!(loaded.username, "alice");
    }
}
