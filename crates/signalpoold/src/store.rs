//! Coordination store selection from the command line.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use signalpool_state::{MemoryStore, RedbStore, SharedClock, SharedStore};

/// Which store backend to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSpec {
    /// In-process; only useful for a single-pod trial run.
    Memory,
    /// Embedded redb file shared by pods on one host.
    Redb(PathBuf),
    /// Redis URL (`redis://` or `rediss://`).
    Redis(String),
}

impl FromStr for StoreSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "memory" {
            return Ok(StoreSpec::Memory);
        }
        if let Some(path) = s.strip_prefix("redb:") {
            anyhow::ensure!(!path.is_empty(), "redb store needs a path: redb:/path/to/file");
            return Ok(StoreSpec::Redb(PathBuf::from(path)));
        }
        if s.starts_with("redis://") || s.starts_with("rediss://") {
            return Ok(StoreSpec::Redis(s.to_string()));
        }
        anyhow::bail!("unknown store '{s}', expected memory, redb:PATH, or redis://URL")
    }
}

impl fmt::Display for StoreSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreSpec::Memory => f.write_str("memory"),
            StoreSpec::Redb(path) => write!(f, "redb:{}", path.display()),
            StoreSpec::Redis(url) => f.write_str(url),
        }
    }
}

/// Open the store described by `spec`, with TTLs driven by `clock`.
pub async fn open_store(spec: &StoreSpec, clock: SharedClock) -> anyhow::Result<SharedStore> {
    let store: SharedStore = match spec {
        StoreSpec::Memory => Arc::new(MemoryStore::with_clock(clock)),
        StoreSpec::Redb(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let store = RedbStore::open(path)
                .with_context(|| format!("opening redb store {}", path.display()))?
                .with_clock(clock);
            // Values that expired while no pod had the file open are never
            // read again, so drop them here.
            let purged = store
                .purge_expired()
                .with_context(|| format!("purging expired values in {}", path.display()))?;
            info!(store = %spec, purged, "expired values removed");
            Arc::new(store)
        }
        StoreSpec::Redis(url) => open_redis(url).await?,
    };
    info!(store = %spec, "coordination store opened");
    Ok(store)
}

#[cfg(feature = "redis")]
async fn open_redis(url: &str) -> anyhow::Result<SharedStore> {
    let store = signalpool_state::RedisStore::connect(url)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn open_redis(url: &str) -> anyhow::Result<SharedStore> {
    anyhow::bail!("{url}: built without the `redis` feature")
}
