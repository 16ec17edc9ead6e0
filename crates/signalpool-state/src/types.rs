//! Records shared between pods through the coordination store.
//!
//! Each pod writes only its own [`PodRecord`] and [`QueueMetricSample`];
//! [`ScalingDecision`] is written by whichever pod wins the scaling lock.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Unique identifier of a pod in the pool.
pub type PodId = String;

// ── Membership ─────────────────────────────────────────────────────

/// Status of a pod as seen by its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodStatus {
    Active,
    /// Alive but reporting local backpressure.
    Overloaded,
    /// Shutting down; stops receiving new work.
    Draining,
    /// Heartbeat older than the TTL. Never written by the pod itself.
    Stale,
}

impl PodStatus {
    /// Whether the ring routes new work to pods in this status.
    pub fn is_routable(self) -> bool {
        matches!(self, PodStatus::Active | PodStatus::Overloaded)
    }
}

/// Load reported with each heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LoadSnapshot {
    /// Fraction of capacity in use, within `[0, 1]`.
    pub load: f64,
    pub queue_size: u64,
    /// Work items completed per second.
    pub processing_rate: f64,
    /// Local backpressure signal at the time of the heartbeat.
    pub overloaded: bool,
}

/// A pod's membership record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodRecord {
    pub pod_id: PodId,
    pub status: PodStatus,
    /// Epoch millis of the last heartbeat. Strictly increasing.
    pub last_heartbeat: u64,
    pub load: f64,
    pub queue_size: u64,
    pub processing_rate: f64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub registered_at: u64,
}

impl PodRecord {
    pub fn new(pod_id: impl Into<PodId>, metadata: HashMap<String, String>, now: u64) -> Self {
        Self {
            pod_id: pod_id.into(),
            status: PodStatus::Active,
            last_heartbeat: now,
            load: 0.0,
            queue_size: 0,
            processing_rate: 0.0,
            metadata,
            registered_at: now,
        }
    }

    /// Whether the last heartbeat is older than `ttl` at `now`.
    pub fn is_expired(&self, now: u64, ttl: Duration) -> bool {
        now.saturating_sub(self.last_heartbeat) > ttl.as_millis() as u64
    }

    /// Status as any reader should interpret it: STALE once expired.
    pub fn effective_status(&self, now: u64, ttl: Duration) -> PodStatus {
        if self.is_expired(now, ttl) {
            PodStatus::Stale
        } else {
            self.status
        }
    }
}

// ── Metrics ────────────────────────────────────────────────────────

/// One sampling tick of a pod's work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetricSample {
    pub pod_id: PodId,
    pub queue_size: u64,
    /// Work items completed per second over the last tick.
    pub processing_rate: f64,
    /// CPU utilisation fraction.
    pub cpu: f64,
    /// Memory utilisation fraction.
    pub mem: f64,
    /// Epoch millis.
    pub timestamp: u64,
}

/// Pool-wide view of the latest live samples.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsAggregate {
    pub total_queue_size: u64,
    pub total_processing_rate: f64,
    pub per_pod: BTreeMap<PodId, QueueMetricSample>,
    /// Registered pods left out because their sample is missing or too old.
    #[serde(default)]
    pub silent: Vec<PodId>,
    pub computed_at: u64,
}

impl MetricsAggregate {
    /// Number of pods that contributed a live sample.
    pub fn reporting_pods(&self) -> usize {
        self.per_pod.len()
    }
}

// ── Scaling ────────────────────────────────────────────────────────

/// Direction of a scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
    Hold,
}

impl ScaleDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ScaleDirection::Up => "up",
            ScaleDirection::Down => "down",
            ScaleDirection::Hold => "hold",
        }
    }
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scaling intent published for the external orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub requested_by: PodId,
    pub direction: ScaleDirection,
    pub reason: String,
    pub metrics_snapshot: MetricsAggregate,
    /// Active pods at decision time.
    pub active_pods: usize,
    /// Epoch millis.
    pub timestamp: u64,
    /// Seconds the record stays in the store.
    pub ttl_secs: u64,
}

// ── Encoding ───────────────────────────────────────────────────────

pub fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialize(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialize(e.to_string()))
}
