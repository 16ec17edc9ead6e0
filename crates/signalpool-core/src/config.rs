//! Pool configuration (`signalpool.toml`).
//!
//! Every field has a default, so an empty file is a valid config. Values
//! can be overridden with `SIGNALPOOL_<FIELD>` environment variables, e.g.
//! `SIGNALPOOL_HEARTBEAT_TTL_S=45`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SIGNALPOOL_";

/// Errors produced while parsing or validating a [`PoolConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Prefix for every key the pool writes to the coordination store.
    pub namespace: String,
    pub heartbeat_interval_s: u64,
    /// A pod whose last heartbeat is older than this is treated as stale.
    pub heartbeat_ttl_s: u64,
    pub virtual_nodes_per_pod: usize,
    pub sampling_interval_s: u64,
    /// TTL of published metrics. Defaults to twice the sampling interval.
    pub metrics_ttl_s: Option<u64>,
    /// Age bound of the local metric window.
    pub sample_window_s: u64,
    /// Queue depth per pod above which the pool wants to scale up.
    pub queue_capacity_per_pod: u64,
    /// Fraction of `queue_capacity_per_pod` below which the pool scales down.
    pub scale_down_ratio: f64,
    pub debounce_window_s: u64,
    pub min_pods: u32,
    pub max_pods: u32,
    /// Absolute local queue depth that signals backpressure immediately.
    pub backpressure_queue_threshold: u64,
    /// Consecutive declining samples that signal backpressure.
    pub backpressure_trend_samples: usize,
    /// Scaling evaluation period. Defaults to the sampling interval.
    pub evaluation_interval_s: Option<u64>,
    pub decision_ttl_s: u64,
    /// Stale records older than this are deleted by failover scans.
    pub stale_reap_after_s: u64,
    pub deregister_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            namespace: "signalpool".to_string(),
            heartbeat_interval_s: 5,
            heartbeat_ttl_s: 30,
            virtual_nodes_per_pod: 160,
            sampling_interval_s: 5,
            metrics_ttl_s: None,
            sample_window_s: 60,
            queue_capacity_per_pod: 100,
            scale_down_ratio: 0.3,
            debounce_window_s: 60,
            min_pods: 1,
            max_pods: 20,
            backpressure_queue_threshold: 200,
            backpressure_trend_samples: 3,
            evaluation_interval_s: None,
            decision_ttl_s: 300,
            stale_reap_after_s: 300,
            deregister_timeout_ms: 2000,
        }
    }
}

impl PoolConfig {
    /// Load a config file, apply environment overrides, and validate.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        debug!(?path, "pool config loaded");
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `SIGNALPOOL_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(
                    let name = format!("{ENV_PREFIX}{}", stringify!($field).to_uppercase());
                    if let Some(raw) = lookup(&name) {
                        self.$field = parse_env(stringify!($field), &raw)?;
                    }
                )*
            };
        }

        if let Some(ns) = lookup(&format!("{ENV_PREFIX}NAMESPACE")) {
            self.namespace = ns;
        }
        overlay!(
            heartbeat_interval_s,
            heartbeat_ttl_s,
            virtual_nodes_per_pod,
            sampling_interval_s,
            sample_window_s,
            queue_capacity_per_pod,
            scale_down_ratio,
            debounce_window_s,
            min_pods,
            max_pods,
            backpressure_queue_threshold,
            backpressure_trend_samples,
            decision_ttl_s,
            stale_reap_after_s,
            deregister_timeout_ms,
        );
        if let Some(raw) = lookup(&format!("{ENV_PREFIX}METRICS_TTL_S")) {
            self.metrics_ttl_s = Some(parse_env("metrics_ttl_s", &raw)?);
        }
        if let Some(raw) = lookup(&format!("{ENV_PREFIX}EVALUATION_INTERVAL_S")) {
            self.evaluation_interval_s = Some(parse_env("evaluation_interval_s", &raw)?);
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.namespace.is_empty() {
            return Err(invalid("namespace", "must not be empty"));
        }
        if self.heartbeat_interval_s == 0 {
            return Err(invalid("heartbeat_interval_s", "must be positive"));
        }
        if self.heartbeat_ttl_s <= self.heartbeat_interval_s {
            return Err(invalid(
                "heartbeat_ttl_s",
                format!(
                    "must exceed heartbeat_interval_s ({})",
                    self.heartbeat_interval_s
                ),
            ));
        }
        if self.virtual_nodes_per_pod == 0 {
            return Err(invalid("virtual_nodes_per_pod", "must be at least 1"));
        }
        if self.sampling_interval_s == 0 {
            return Err(invalid("sampling_interval_s", "must be positive"));
        }
        if self.metrics_ttl().as_secs() < self.sampling_interval_s {
            return Err(invalid(
                "metrics_ttl_s",
                "must be at least one sampling interval",
            ));
        }
        if !(self.scale_down_ratio > 0.0 && self.scale_down_ratio < 1.0) {
            return Err(invalid("scale_down_ratio", "must be within (0, 1)"));
        }
        if self.queue_capacity_per_pod == 0 {
            return Err(invalid("queue_capacity_per_pod", "must be positive"));
        }
        if self.min_pods > self.max_pods {
            return Err(invalid(
                "min_pods",
                format!("must not exceed max_pods ({})", self.max_pods),
            ));
        }
        if self.backpressure_trend_samples < 2 {
            return Err(invalid("backpressure_trend_samples", "must be at least 2"));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_s)
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.sampling_interval_s)
    }

    pub fn metrics_ttl(&self) -> Duration {
        Duration::from_secs(
            self.metrics_ttl_s
                .unwrap_or(self.sampling_interval_s.saturating_mul(2)),
        )
    }

    pub fn sample_window(&self) -> Duration {
        Duration::from_secs(self.sample_window_s)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_window_s)
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(
            self.evaluation_interval_s
                .unwrap_or(self.sampling_interval_s),
        )
    }

    pub fn decision_ttl(&self) -> Duration {
        Duration::from_secs(self.decision_ttl_s)
    }

    pub fn stale_reap_after(&self) -> Duration {
        Duration::from_secs(self.stale_reap_after_s)
    }

    pub fn deregister_timeout(&self) -> Duration {
        Duration::from_millis(self.deregister_timeout_ms)
    }
}

fn parse_env<T>(field: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field,
        reason: format!("{raw:?}: {e}"),
    })
}
