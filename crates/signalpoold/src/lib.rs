//! signalpoold — one pod of a leaderless signal-computation pool.
//!
//! The daemon hosts a [`PodAgent`], which wires the membership registry,
//! ring router, backpressure monitor, scaling coordinator, and failover
//! detector to a coordination store and drives them from independent
//! timers until shutdown.

pub mod agent;
pub mod store;

pub use agent::PodAgent;
pub use store::{StoreSpec, open_store};
