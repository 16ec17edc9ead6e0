//! In-memory coordination store.
//!
//! TTLs are evaluated against the injected [`Clock`], so tests can expire
//! keys by advancing a [`ManualClock`](crate::ManualClock). Clones share
//! the same underlying data, which lets several simulated pods in one
//! process coordinate exactly as they would through Redis.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{SharedClock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::store::CoordinationStore;

struct Entry {
    data: Vec<u8>,
    expires_at: u64,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
        }
    }

    /// Number of live (unexpired) plain keys.
    pub fn live_keys(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock()
            .map(|inner| inner.values.values().filter(|e| e.expires_at > now).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn live<'a>(inner: &'a Inner, key: &str, now: u64) -> Option<&'a Entry> {
        inner.values.get(key).filter(|e| e.expires_at > now)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let mut inner = self.lock()?;
        inner.values.insert(
            key.to_string(),
            Entry {
                data: value.to_vec(),
                expires_at: now + ttl.as_millis() as u64,
            },
        );
        Ok(())
    }

    async fn set_nx_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let mut inner = self.lock()?;
        if Self::live(&inner, key, now).is_some() {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            Entry {
                data: value.to_vec(),
                expires_at: now + ttl.as_millis() as u64,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = self.clock.now_millis();
        let inner = self.lock()?;
        Ok(Self::live(&inner, key, now).map(|e| e.data.clone()))
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        let now = self.clock.now_millis();
        let inner = self.lock()?;
        Ok(keys
            .iter()
            .map(|k| Self::live(&inner, k, now).map(|e| e.data.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let mut inner = self.lock()?;
        Ok(inner
            .values
            .remove(key)
            .is_some_and(|e| e.expires_at > now))
    }

    async fn hash_set_all(&self, hash: &str, fields: &[(String, Vec<u8>)]) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let map = inner.hashes.entry(hash.to_string()).or_default();
        for (field, value) in fields {
            map.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_get_all(&self, hash: &str) -> StoreResult<HashMap<String, Vec<u8>>> {
        let inner = self.lock()?;
        Ok(inner.hashes.get(hash).cloned().unwrap_or_default())
    }

    async fn hash_delete(&self, hash: &str, field: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        Ok(inner
            .hashes
            .get_mut(hash)
            .is_some_and(|map| map.remove(field).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(clock: &ManualClock) -> MemoryStore {
        MemoryStore::with_clock(Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn values_expire_with_clock() {
        let clock = ManualClock::new(0);
        let store = store_at(&clock);

        store
            .set_with_ttl("k", b"v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some(&b"v"[..]));

        clock.advance(Duration::from_secs(10));
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.live_keys(), 0);
    }

    #[tokio::test]
    async fn set_nx_only_first_writer_wins() {
        let clock = ManualClock::new(0);
        let store = store_at(&clock);
        let ttl = Duration::from_secs(60);

        assert!(store.set_nx_with_ttl("lock", b"a", ttl).await.unwrap());
        assert!(!store.set_nx_with_ttl("lock", b"b", ttl).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some(&b"a"[..]));

        // Once the lock expires it can be taken again.
        clock.advance(ttl);
        assert!(store.set_nx_with_ttl("lock", b"c", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn get_many_preserves_order() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.set_with_ttl("a", b"1", ttl).await.unwrap();
        store.set_with_ttl("c", b"3", ttl).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = store.get_many(&keys).await.unwrap();
        assert_eq!(
            values,
            vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]
        );
    }

    #[tokio::test]
    async fn delete_reports_live_keys_only() {
        let clock = ManualClock::new(0);
        let store = store_at(&clock);
        store
            .set_with_ttl("k", b"v", Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        assert!(!store.delete("k").await.unwrap());
        assert!(!store.delete("missing").await.unwrap());
    }

    #[tokio::test]
    async fn hash_fields_overwrite_whole_values() {
        let store = MemoryStore::new();
        store
            .hash_set_all(
                "h",
                &[("a".to_string(), b"1".to_vec()), ("b".to_string(), b"2".to_vec())],
            )
            .await
            .unwrap();
        store
            .hash_set_all("h", &[("a".to_string(), b"10".to_vec())])
            .await
            .unwrap();

        let all = store.hash_get_all("h").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"], b"10".to_vec());

        assert!(store.hash_delete("h", "a").await.unwrap());
        assert!(!store.hash_delete("h", "a").await.unwrap());
        assert!(store.hash_get_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clones_share_data() {
        let store = MemoryStore::new();
        let peer = store.clone();
        store
            .hash_set_all("h", &[("pod".to_string(), b"x".to_vec())])
            .await
            .unwrap();
        assert_eq!(peer.hash_get_all("h").await.unwrap().len(), 1);
    }
}
