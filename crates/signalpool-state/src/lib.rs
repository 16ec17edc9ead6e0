//! signalpool-state — the coordination store shared by every pod.
//!
//! The store is an injected interface ([`CoordinationStore`]) exposing
//! only single-round-trip atomic primitives: `SET` with TTL, `SET NX` with
//! TTL (the scaling lock), `GET`/`MGET`, `DEL`, and hash get-all/set-all.
//! Pods never talk to each other directly; everything they agree on is a
//! pure function of what they read here.
//!
//! # Backends
//!
//! ```text
//! MemoryStore  — in-process, clock-driven TTLs (tests, simulations)
//! RedbStore    — embedded redb file (single-host development)
//! RedisStore   — Redis 6+ (production, `redis` feature)
//! FaultyStore  — wraps any backend and injects outages
//! ```
//!
//! All records are JSON-serialized into the store's byte values.

pub mod clock;
pub mod error;
pub mod fault;
pub mod keys;
pub mod memory;
pub mod redb_store;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{StoreError, StoreResult};
pub use fault::FaultyStore;
pub use keys::Keyspace;
pub use memory::MemoryStore;
pub use redb_store::RedbStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use store::{CoordinationStore, SharedStore};
pub use types::*;
