//! signalpool-cluster — leaderless pod membership and work routing.
//!
//! Every pod runs the same code over the same store snapshot, so every
//! pod derives the same ring and therefore the same key owner without any
//! coordination message.
//!
//! # Architecture
//!
//! ```text
//! MembershipRegistry
//!   ├── register() / heartbeat() → one atomic hash-field write per pod
//!   ├── list_active()           → records younger than heartbeat_ttl
//!   └── deregister()            → best effort; TTL expiry is the safety net
//!
//! RingRouter
//!   ├── refresh()   → list_active(), keeps cached view on store failure
//!   └── assign(key) → HashRing lookup, rebuilt when membership changes
//!
//! FailoverDetector
//!   └── scan() → diff snapshots, report stale pods, update the router
//! ```

pub mod error;
pub mod failover;
pub mod membership;
pub mod ring;
pub mod router;

pub use error::RingError;
pub use failover::{FailoverDetector, FailoverReport};
pub use membership::{MembershipRegistry, MembershipSnapshot};
pub use ring::{DEFAULT_VIRTUAL_NODES, HashRing};
pub use router::RingRouter;
