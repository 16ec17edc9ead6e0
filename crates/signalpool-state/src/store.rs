//! The coordination store interface.
//!
//! Implementations must make every method a single atomic operation. No
//! caller relies on multi-step transactions, so a partial failure affects
//! at most one key or hash field.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

/// Store handle shared across a pod's subsystems.
pub type SharedStore = Arc<dyn CoordinationStore>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// `SET key value PX ttl`.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// `SET key value NX PX ttl`. Returns true if this call created the key.
    async fn set_nx_with_ttl(&self, key: &str, value: &[u8], ttl: Duration)
    -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// `MGET`. The result has one slot per requested key, in order.
    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>>;

    /// Returns true if a live key was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// `HSET hash f1 v1 f2 v2 ...`. Each field is overwritten as a whole.
    async fn hash_set_all(&self, hash: &str, fields: &[(String, Vec<u8>)]) -> StoreResult<()>;

    /// `HGETALL`.
    async fn hash_get_all(&self, hash: &str) -> StoreResult<HashMap<String, Vec<u8>>>;

    /// `HDEL`. Returns true if the field existed.
    async fn hash_delete(&self, hash: &str, field: &str) -> StoreResult<bool>;
}
