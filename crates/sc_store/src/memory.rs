//! Reference in-memory backend: a `BTreeMap` behind a read-write lock.
//! Prefix scans fall out of the ordered map for free.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::{Storage, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Option<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Some(BTreeMap::new())),
        }
    }
}

impl Storage for MemoryStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let guard = self.inner.read();
        let map = guard.as_ref().ok_or_else(closed)?;
        map.get(key).cloned().ok_or(StoreError::NotFound)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        let map = guard.as_mut().ok_or_else(closed)?;
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        let map = guard.as_mut().ok_or_else(closed)?;
        map.remove(key);
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let guard = self.inner.read();
        let map = guard.as_ref().ok_or_else(closed)?;
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn close(&self) -> Result<(), StoreError> {
        *self.inner.write() = None;
        Ok(())
    }
}

fn closed() -> StoreError {
    StoreError::IoError("store is closed".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;

    #[test]
    fn get_put_delete() {
        let store = MemoryStore::new();
        assert!(matches!(store.get("missing"), Err(StoreError::NotFound)));

        store.put("k", b"v1").unwrap();
        assert_eq!(store.get("k").unwrap(), b"v1");

        store.put("k", b"v2").unwrap();
        assert_eq!(store.get("k").unwrap(), b"v2");

        store.delete("k").unwrap();
        assert!(matches!(store.get("k"), Err(StoreError::NotFound)));
        // Deleting again is fine.
        store.delete("k").unwrap();
    }

    #[test]
    fn scan_respects_prefix_and_order() {
        let store = MemoryStore::new();
        store.put(&keys::contact("carol"), b"c").unwrap();
        store.put(&keys::contact("alice"), b"a").unwrap();
        store.put(&keys::session("me", "alice"), b"s").unwrap();

        let contacts = store.scan(keys::CONTACT_PREFIX).unwrap();
        let names: Vec<&str> = contacts.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["contacts/alice", "contacts/carol"]);
    }

    #[test]
    fn closed_store_errors() {
        let store = MemoryStore::new();
        store.put("k", b"v").unwrap();
        store.close().unwrap();
        assert!(matches!(store.get("k"), Err(StoreError::IoError(_))));
        assert!(matches!(store.put("k", b"v"), Err(StoreError::IoError(_))));
    }
}
