//! signalpool-core — configuration shared by every pod subsystem.

pub mod config;

pub use config::{ConfigError, PoolConfig};
