//! Membership registry — TTL-based pod liveness.
//!
//! Each pod owns exactly one field of the members hash and always writes
//! its whole [`PodRecord`] in one `HSET`, so readers never observe a torn
//! record. Nothing is deleted on expiry: a record whose heartbeat is older
//! than `heartbeat_ttl` is simply read as STALE.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use signalpool_state::*;

/// Live and expired records from one read of the members hash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MembershipSnapshot {
    /// Records within the TTL, sorted by pod id.
    pub active: Vec<PodRecord>,
    /// Expired records, sorted by pod id.
    pub stale: Vec<PodRecord>,
    /// Epoch millis the snapshot was evaluated at.
    pub taken_at: u64,
}

pub struct MembershipRegistry {
    store: SharedStore,
    keys: Keyspace,
    clock: SharedClock,
    heartbeat_ttl: Duration,
    /// Records of the pods hosted by this process. Heartbeats are written
    /// from this copy, never read back from the store.
    owned: Mutex<HashMap<PodId, PodRecord>>,
    last_known_good: RwLock<Option<MembershipSnapshot>>,
}

impl MembershipRegistry {
    pub fn new(store: SharedStore, keys: Keyspace, clock: SharedClock) -> Self {
        Self {
            store,
            keys,
            clock,
            heartbeat_ttl: Duration::from_secs(30),
            owned: Mutex::new(HashMap::new()),
            last_known_good: RwLock::new(None),
        }
    }

    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_ttl
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Insert or overwrite this pod's record with status ACTIVE.
    ///
    /// The record is kept locally even if the write fails, so the next
    /// heartbeat publishes it.
    pub async fn register(
        &self,
        pod_id: &str,
        metadata: HashMap<String, String>,
    ) -> StoreResult<PodRecord> {
        let now = self.clock.now_millis();
        let record = {
            let mut owned = self.owned.lock().await;
            let mut record = PodRecord::new(pod_id, metadata, now);
            if let Some(prev) = owned.get(pod_id) {
                record.last_heartbeat = next_heartbeat(prev.last_heartbeat, now);
                record.registered_at = prev.registered_at;
            }
            owned.insert(pod_id.to_string(), record.clone());
            record
        };

        self.write(&record).await?;
        info!(%pod_id, "pod registered");
        Ok(record)
    }

    /// Refresh this pod's record with a new load snapshot.
    ///
    /// A pod that was never registered here is registered implicitly.
    pub async fn heartbeat(&self, pod_id: &str, load: LoadSnapshot) -> StoreResult<PodRecord> {
        let now = self.clock.now_millis();
        let record = {
            let mut owned = self.owned.lock().await;
            let record = owned.entry(pod_id.to_string()).or_insert_with(|| {
                warn!(%pod_id, "heartbeat for unregistered pod, registering");
                PodRecord::new(pod_id, HashMap::new(), now)
            });

            record.last_heartbeat = next_heartbeat(record.last_heartbeat, now);
            record.load = load.load.clamp(0.0, 1.0);
            record.queue_size = load.queue_size;
            record.processing_rate = load.processing_rate;
            record.status = match record.status {
                PodStatus::Draining => PodStatus::Draining,
                _ if load.overloaded => PodStatus::Overloaded,
                _ => PodStatus::Active,
            };
            record.clone()
        };

        self.write(&record).await?;
        debug!(%pod_id, status = ?record.status, queue = record.queue_size, "heartbeat written");
        Ok(record)
    }

    /// Mark this pod DRAINING so peers stop routing new keys to it.
    pub async fn mark_draining(&self, pod_id: &str) -> StoreResult<Option<PodRecord>> {
        let now = self.clock.now_millis();
        let record = {
            let mut owned = self.owned.lock().await;
            match owned.get_mut(pod_id) {
                Some(record) => {
                    record.status = PodStatus::Draining;
                    record.last_heartbeat = next_heartbeat(record.last_heartbeat, now);
                    record.clone()
                }
                None => return Ok(None),
            }
        };

        self.write(&record).await?;
        info!(%pod_id, "pod draining");
        Ok(Some(record))
    }

    /// Remove this pod's record. A missing record is not an error.
    pub async fn deregister(&self, pod_id: &str) -> StoreResult<bool> {
        self.owned.lock().await.remove(pod_id);
        let existed = self.store.hash_delete(&self.keys.members(), pod_id).await?;
        if existed {
            info!(%pod_id, "pod deregistered");
        } else {
            debug!(%pod_id, "deregister found no record");
        }
        Ok(existed)
    }

    /// Delete a long-expired peer record. Idempotent across pods.
    pub async fn reap(&self, pod_id: &str) -> StoreResult<bool> {
        let removed = self.store.hash_delete(&self.keys.members(), pod_id).await?;
        if removed {
            info!(%pod_id, "reaped expired pod record");
        }
        Ok(removed)
    }

    /// Every stored record, sorted by pod id. Malformed records are skipped.
    pub async fn list_all(&self) -> StoreResult<Vec<PodRecord>> {
        let raw = self.store.hash_get_all(&self.keys.members()).await?;
        let mut records: Vec<PodRecord> = raw
            .into_iter()
            .filter_map(|(field, bytes)| match decode::<PodRecord>(&bytes) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(pod_id = %field, error = %e, "skipping malformed pod record");
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| a.pod_id.cmp(&b.pod_id));
        Ok(records)
    }

    /// Records whose heartbeat is at most `heartbeat_ttl` old at `now`,
    /// sorted by pod id.
    pub async fn list_active(
        &self,
        now: u64,
        heartbeat_ttl: Duration,
    ) -> StoreResult<Vec<PodRecord>> {
        Ok(self.snapshot_at(now, heartbeat_ttl).await?.active)
    }

    /// Read and split the membership at the current clock and configured TTL.
    pub async fn snapshot(&self) -> StoreResult<MembershipSnapshot> {
        self.snapshot_at(self.clock.now_millis(), self.heartbeat_ttl)
            .await
    }

    /// The last successfully read snapshot, for use while the store is down.
    pub async fn last_known_good(&self) -> Option<MembershipSnapshot> {
        self.last_known_good.read().await.clone()
    }

    async fn snapshot_at(&self, now: u64, ttl: Duration) -> StoreResult<MembershipSnapshot> {
        let records = self.list_all().await?;
        let (stale, active): (Vec<_>, Vec<_>) =
            records.into_iter().partition(|r| r.is_expired(now, ttl));

        let snapshot = MembershipSnapshot {
            active,
            stale,
            taken_at: now,
        };
        *self.last_known_good.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn write(&self, record: &PodRecord) -> StoreResult<()> {
        let value = encode(record)?;
        self.store
            .hash_set_all(&self.keys.members(), &[(record.pod_id.clone(), value)])
            .await
    }
}

/// Heartbeat timestamps never go backwards, even if the wall clock does.
fn next_heartbeat(previous: u64, now: u64) -> u64 {
    now.max(previous + 1)
}
