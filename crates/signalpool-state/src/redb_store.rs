//! RedbStore — coordination store backed by an embedded redb file.
//!
//! Suitable for a single host (one process holds the file lock), e.g. a
//! development pool whose pods run as tasks of one `signalpoold`. Plain
//! values are stored with an 8-byte big-endian expiry prefix and expire
//! lazily on read; [`RedbStore::purge_expired`] reclaims the space.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use crate::clock::{SharedClock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::store::CoordinationStore;

/// TTL'd values keyed by full store key.
const VALUES: TableDefinition<&str, &[u8]> = TableDefinition::new("values");

/// Hash fields keyed by `{hash}\x1f{field}`.
const HASH_FIELDS: TableDefinition<&str, &[u8]> = TableDefinition::new("hash_fields");

const FIELD_SEP: char = '\u{1f}';

/// Convert any `Display` error into `StoreError::Unavailable`.
macro_rules! map_err {
    () => {
        |e| StoreError::Unavailable(e.to_string())
    };
}

fn field_key(hash: &str, field: &str) -> String {
    format!("{hash}{FIELD_SEP}{field}")
}

fn wrap(value: &[u8], expires_at: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + value.len());
    buf.extend_from_slice(&expires_at.to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Split a stored value into (expires_at, payload).
fn unwrap_value(raw: &[u8]) -> StoreResult<(u64, &[u8])> {
    if raw.len() < 8 {
        return Err(StoreError::Deserialize(format!(
            "stored value too short ({} bytes)",
            raw.len()
        )));
    }
    let (head, payload) = raw.split_at(8);
    let mut expiry = [0u8; 8];
    expiry.copy_from_slice(head);
    Ok((u64::from_be_bytes(expiry), payload))
}

/// Thread-safe coordination store backed by redb.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    clock: SharedClock,
}

impl RedbStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!())?;
        let store = Self {
            db: Arc::new(db),
            clock: Arc::new(SystemClock),
        };
        store.ensure_tables()?;
        debug!(?path, "redb coordination store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory redb store.
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!())?;
        let store = Self {
            db: Arc::new(db),
            clock: Arc::new(SystemClock),
        };
        store.ensure_tables()?;
        debug!("in-memory redb coordination store opened");
        Ok(store)
    }

    /// Evaluate TTLs against `clock` instead of wall time.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!())?;
        txn.open_table(VALUES).map_err(map_err!())?;
        txn.open_table(HASH_FIELDS).map_err(map_err!())?;
        txn.commit().map_err(map_err!())?;
        Ok(())
    }

    fn put_value(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        only_if_absent: bool,
    ) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let buf = wrap(value, now + ttl.as_millis() as u64);
        let txn = self.db.begin_write().map_err(map_err!())?;
        let written;
        {
            let mut table = txn.open_table(VALUES).map_err(map_err!())?;
            let occupied = if only_if_absent {
                match table.get(key).map_err(map_err!())? {
                    Some(guard) => unwrap_value(guard.value())?.0 > now,
                    None => false,
                }
            } else {
                false
            };
            if !occupied {
                table.insert(key, buf.as_slice()).map_err(map_err!())?;
            }
            written = !occupied;
        }
        txn.commit().map_err(map_err!())?;
        Ok(written)
    }

    /// Remove expired values. Returns the number removed.
    pub fn purge_expired(&self) -> StoreResult<usize> {
        let now = self.clock.now_millis();
        let expired: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!())?;
            let table = txn.open_table(VALUES).map_err(map_err!())?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!())? {
                let (key, value) = entry.map_err(map_err!())?;
                if unwrap_value(value.value())?.0 <= now {
                    keys.push(key.value().to_string());
                }
            }
            keys
        };

        let txn = self.db.begin_write().map_err(map_err!())?;
        {
            let mut table = txn.open_table(VALUES).map_err(map_err!())?;
            for key in &expired {
                table.remove(key.as_str()).map_err(map_err!())?;
            }
        }
        txn.commit().map_err(map_err!())?;
        debug!(removed = expired.len(), "purged expired values");
        Ok(expired.len())
    }
}

#[async_trait]
impl CoordinationStore for RedbStore {
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.put_value(key, value, ttl, false).map(|_| ())
    }

    async fn set_nx_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.put_value(key, value, ttl, true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = self.clock.now_millis();
        let txn = self.db.begin_read().map_err(map_err!())?;
        let table = txn.open_table(VALUES).map_err(map_err!())?;
        match table.get(key).map_err(map_err!())? {
            Some(guard) => {
                let (expires_at, payload) = unwrap_value(guard.value())?;
                Ok((expires_at > now).then(|| payload.to_vec()))
            }
            None => Ok(None),
        }
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        let now = self.clock.now_millis();
        let txn = self.db.begin_read().map_err(map_err!())?;
        let table = txn.open_table(VALUES).map_err(map_err!())?;
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let value = match table.get(key.as_str()).map_err(map_err!())? {
                Some(guard) => {
                    let (expires_at, payload) = unwrap_value(guard.value())?;
                    (expires_at > now).then(|| payload.to_vec())
                }
                None => None,
            };
            results.push(value);
        }
        Ok(results)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let txn = self.db.begin_write().map_err(map_err!())?;
        let existed;
        {
            let mut table = txn.open_table(VALUES).map_err(map_err!())?;
            existed = match table.remove(key).map_err(map_err!())? {
                Some(guard) => unwrap_value(guard.value())?.0 > now,
                None => false,
            };
        }
        txn.commit().map_err(map_err!())?;
        Ok(existed)
    }

    async fn hash_set_all(&self, hash: &str, fields: &[(String, Vec<u8>)]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!())?;
        {
            let mut table = txn.open_table(HASH_FIELDS).map_err(map_err!())?;
            for (field, value) in fields {
                let key = field_key(hash, field);
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!())?;
            }
        }
        txn.commit().map_err(map_err!())?;
        Ok(())
    }

    async fn hash_get_all(&self, hash: &str) -> StoreResult<HashMap<String, Vec<u8>>> {
        let prefix = format!("{hash}{FIELD_SEP}");
        let txn = self.db.begin_read().map_err(map_err!())?;
        let table = txn.open_table(HASH_FIELDS).map_err(map_err!())?;
        let mut results = HashMap::new();
        for entry in table.iter().map_err(map_err!())? {
            let (key, value) = entry.map_err(map_err!())?;
            if let Some(field) = key.value().strip_prefix(&prefix) {
                results.insert(field.to_string(), value.value().to_vec());
            }
        }
        Ok(results)
    }

    async fn hash_delete(&self, hash: &str, field: &str) -> StoreResult<bool> {
        let key = field_key(hash, field);
        let txn = self.db.begin_write().map_err(map_err!())?;
        let existed;
        {
            let mut table = txn.open_table(HASH_FIELDS).map_err(map_err!())?;
            existed = table.remove(key.as_str()).map_err(map_err!())?.is_some();
        }
        txn.commit().map_err(map_err!())?;
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(clock: &ManualClock) -> RedbStore {
        RedbStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn set_nx_respects_expiry() {
        let clock = ManualClock::new(1_000);
        let store = store_at(&clock);
        let ttl = Duration::from_secs(5);

        assert!(store.set_nx_with_ttl("lock", b"pod-a", ttl).await.unwrap());
        assert!(!store.set_nx_with_ttl("lock", b"pod-b", ttl).await.unwrap());

        clock.advance(Duration::from_secs(5));
        assert!(store.get("lock").await.unwrap().is_none());
        assert!(store.set_nx_with_ttl("lock", b"pod-b", ttl).await.unwrap());
        assert_eq!(
            store.get("lock").await.unwrap().as_deref(),
            Some(&b"pod-b"[..])
        );
    }

    #[tokio::test]
    async fn hashes_are_isolated_by_name() {
        let store = RedbStore::open_in_memory().unwrap();
        store
            .hash_set_all("pool-a:members", &[("p1".to_string(), b"x".to_vec())])
            .await
            .unwrap();
        store
            .hash_set_all("pool-b:members", &[("p2".to_string(), b"y".to_vec())])
            .await
            .unwrap();

        let a = store.hash_get_all("pool-a:members").await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a["p1"], b"x".to_vec());

        assert!(store.hash_delete("pool-a:members", "p1").await.unwrap());
        assert!(store.hash_get_all("pool-a:members").await.unwrap().is_empty());
        assert_eq!(store.hash_get_all("pool-b:members").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_many_skips_expired() {
        let clock = ManualClock::new(0);
        let store = store_at(&clock);
        store
            .set_with_ttl("short", b"1", Duration::from_secs(1))
            .await
            .unwrap();
        store
            .set_with_ttl("long", b"2", Duration::from_secs(100))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        let values = store
            .get_many(&["short".to_string(), "long".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![None, Some(b"2".to_vec())]);
    }

    #[tokio::test]
    async fn purge_expired_removes_dead_values() {
        let clock = ManualClock::new(0);
        let store = store_at(&clock);
        store
            .set_with_ttl("a", b"1", Duration::from_secs(1))
            .await
            .unwrap();
        store
            .set_with_ttl("b", b"2", Duration::from_secs(60))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(30));

        assert_eq!(store.purge_expired().unwrap(), 1);
        assert!(store.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            store
                .hash_set_all("signalpool:members", &[("pod-1".to_string(), b"{}".to_vec())])
                .await
                .unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        let members = store.hash_get_all("signalpool:members").await.unwrap();
        assert!(members.contains_key("pod-1"));
    }

    #[test]
    fn short_values_are_rejected() {
        assert!(matches!(
            unwrap_value(b"abc"),
            Err(StoreError::Deserialize(_))
        ));
    }
}
