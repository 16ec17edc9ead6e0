//! RedisStore — production coordination store (Redis 6+).
//!
//! Each trait method maps to exactly one Redis command, so every write is
//! atomic on the server. The multiplexed connection is cheap to clone and
//! shared by all of a pod's timers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::store::CoordinationStore;

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis.
    (ttl.as_millis() as u64).max(1)
}

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        info!("connected to redis coordination store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn set_nx_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        // Replies "OK" when set, nil when the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(values)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn hash_set_all(&self, hash: &str, fields: &[(String, Vec<u8>)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(hash);
        for (field, value) in fields {
            cmd.arg(field.as_str()).arg(value.as_slice());
        }
        let mut conn = self.conn.clone();
        let _: i64 = cmd.query_async(&mut conn).await.map_err(unavailable)?;
        Ok(())
    }

    async fn hash_get_all(&self, hash: &str) -> StoreResult<HashMap<String, Vec<u8>>> {
        let mut conn = self.conn.clone();
        let all: HashMap<String, Vec<u8>> = redis::cmd("HGETALL")
            .arg(hash)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(all)
    }

    async fn hash_delete(&self, hash: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("HDEL")
            .arg(hash)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(removed > 0)
    }
}
