//! Fault injection for degradation tests and simulations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::store::CoordinationStore;

/// Wraps a store and fails every call while an outage is switched on.
pub struct FaultyStore<S> {
    inner: S,
    failing: AtomicBool,
    rejected: AtomicU64,
}

impl<S: CoordinationStore> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of calls rejected so far.
    pub fn rejected_calls(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: CoordinationStore> CoordinationStore for FaultyStore<S> {
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.check()?;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn set_nx_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.check()?;
        self.inner.set_nx_with_ttl(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        self.check()?;
        self.inner.get_many(keys).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn hash_set_all(&self, hash: &str, fields: &[(String, Vec<u8>)]) -> StoreResult<()> {
        self.check()?;
        self.inner.hash_set_all(hash, fields).await
    }

    async fn hash_get_all(&self, hash: &str) -> StoreResult<HashMap<String, Vec<u8>>> {
        self.check()?;
        self.inner.hash_get_all(hash).await
    }

    async fn hash_delete(&self, hash: &str, field: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.hash_delete(hash, field).await
    }
}
