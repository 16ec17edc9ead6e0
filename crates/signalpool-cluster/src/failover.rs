//! Failover detection by membership diffing.
//!
//! There is no handoff protocol: when a pod stops heartbeating its record
//! expires, the next scan on every peer drops it from the router, and the
//! rebuilt ring hands its keys to the neighbouring pods.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use signalpool_state::{PodId, PodStatus, StoreResult};

use crate::membership::MembershipRegistry;
use crate::router::RingRouter;

/// What changed between two scans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverReport {
    /// Pods that are live now and were not live at the previous scan.
    pub joined: Vec<PodId>,
    /// Pods whose heartbeat expired since the previous scan.
    pub stale: Vec<PodId>,
    /// Pods whose record disappeared (graceful deregistration or a peer's reap).
    pub departed: Vec<PodId>,
    /// Long-expired records this scan deleted.
    pub reaped: Vec<PodId>,
    pub ring_version: u64,
    pub ring_changed: bool,
}

impl FailoverReport {
    pub fn is_quiet(&self) -> bool {
        self.joined.is_empty()
            && self.stale.is_empty()
            && self.departed.is_empty()
            && self.reaped.is_empty()
            && !self.ring_changed
    }
}

pub struct FailoverDetector {
    registry: Arc<MembershipRegistry>,
    router: Arc<RingRouter>,
    reap_after: Duration,
    previous: Mutex<BTreeMap<PodId, PodStatus>>,
}

impl FailoverDetector {
    pub fn new(registry: Arc<MembershipRegistry>, router: Arc<RingRouter>) -> Self {
        Self {
            registry,
            router,
            reap_after: Duration::from_secs(300),
            previous: Mutex::new(BTreeMap::new()),
        }
    }

    /// How long a record may stay STALE before it is deleted.
    pub fn with_reap_after(mut self, reap_after: Duration) -> Self {
        self.reap_after = reap_after;
        self
    }

    /// Diff the current membership against the previous scan and update
    /// the router. A store failure leaves the previous state untouched.
    pub async fn scan(&self) -> StoreResult<FailoverReport> {
        let snapshot = self.registry.snapshot().await?;
        let now = snapshot.taken_at;
        let reap_threshold =
            (self.registry.heartbeat_ttl() + self.reap_after).as_millis() as u64;

        let mut report = FailoverReport::default();
        let mut current: BTreeMap<PodId, PodStatus> = BTreeMap::new();
        for record in &snapshot.active {
            current.insert(record.pod_id.clone(), record.status);
        }

        for record in &snapshot.stale {
            if now.saturating_sub(record.last_heartbeat) > reap_threshold {
                match self.registry.reap(&record.pod_id).await {
                    Ok(true) => {
                        report.reaped.push(record.pod_id.clone());
                        continue;
                    }
                    // A peer reaped it first.
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(pod_id = %record.pod_id, error = %e, "failed to reap expired record");
                    }
                }
            }
            current.insert(record.pod_id.clone(), PodStatus::Stale);
        }

        let mut previous = self.previous.lock().await;
        for (pod_id, status) in &current {
            let was = previous.get(pod_id).copied();
            let live_now = *status != PodStatus::Stale;
            let live_before = was.is_some_and(|s| s != PodStatus::Stale);
            if live_now && !live_before {
                report.joined.push(pod_id.clone());
            } else if !live_now && was != Some(PodStatus::Stale) {
                report.stale.push(pod_id.clone());
            }
        }
        for pod_id in previous.keys() {
            if !current.contains_key(pod_id) && !report.reaped.contains(pod_id) {
                report.departed.push(pod_id.clone());
            }
        }
        *previous = current;
        drop(previous);

        report.ring_changed = self.router.observe(&snapshot.active);
        report.ring_version = self.router.version();

        for pod_id in &report.stale {
            warn!(%pod_id, "pod heartbeat expired, its keys move to surviving pods");
        }
        if report.is_quiet() {
            debug!(version = report.ring_version, "failover scan: no change");
        } else {
            info!(
                joined = ?report.joined,
                stale = ?report.stale,
                departed = ?report.departed,
                reaped = ?report.reaped,
                version = report.ring_version,
                "membership change detected"
            );
        }
        Ok(report)
    }
}
