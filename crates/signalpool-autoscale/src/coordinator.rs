//! Scaling coordinator — evaluates the pool aggregate and publishes at most
//! one decision per debounce window.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use signalpool_core::PoolConfig;
use signalpool_state::{
    Keyspace, MetricsAggregate, PodId, PodRecord, ScaleDirection, ScalingDecision, SharedClock,
    SharedStore, StoreResult, decode, encode,
};

/// Shortest lock lifetime, so a zero debounce window still serializes
/// concurrent publishers.
const MIN_LOCK_TTL: Duration = Duration::from_secs(1);

/// Thresholds for the decision rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub queue_capacity_per_pod: u64,
    /// Fraction of capacity below which the pool is over-provisioned.
    pub scale_down_ratio: f64,
    pub debounce_window: Duration,
    pub min_pods: u32,
    pub max_pods: u32,
    pub decision_ttl: Duration,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for ScalingPolicy {
    fn from(config: &PoolConfig) -> Self {
        Self {
            queue_capacity_per_pod: config.queue_capacity_per_pod,
            scale_down_ratio: config.scale_down_ratio,
            debounce_window: config.debounce_window(),
            min_pods: config.min_pods,
            max_pods: config.max_pods,
            decision_ttl: config.decision_ttl(),
        }
    }
}

/// Proof that this pod holds the scaling lock.
///
/// Only a successful `SET NX` on the lock key constructs one, so the
/// phases that write a decision cannot be reached without it.
#[derive(Debug, PartialEq)]
pub struct HeldLock {
    key: String,
    acquired_at: u64,
}

impl HeldLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn acquired_at(&self) -> u64 {
        self.acquired_at
    }
}

/// One step of a publish cycle. Between cycles the coordinator is idle and
/// holds no phase at all.
#[derive(Debug, PartialEq)]
pub enum CyclePhase {
    Evaluating(ScalingDecision),
    LockAcquired {
        lock: HeldLock,
        decision: ScalingDecision,
    },
    Deciding {
        lock: HeldLock,
        decision: ScalingDecision,
    },
    Published(ScalingDecision),
    LockDenied,
}

impl CyclePhase {
    pub fn name(&self) -> &'static str {
        match self {
            CyclePhase::Evaluating(_) => "evaluating",
            CyclePhase::LockAcquired { .. } => "lock_acquired",
            CyclePhase::Deciding { .. } => "deciding",
            CyclePhase::Published(_) => "published",
            CyclePhase::LockDenied => "lock_denied",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a publish cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// Nothing to publish.
    Hold,
    /// A decision in the same direction was published at `last_at`,
    /// less than a debounce window ago.
    Debounced { last_at: u64 },
    /// Another pod holds the scaling lock.
    LockDenied,
    Published(ScalingDecision),
}

enum Transition {
    Next(CyclePhase),
    Done(PublishOutcome),
}

/// Routable pods, and how many of them have a live sample in the aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PoolLoad {
    routable: usize,
    reporting: usize,
    reported_queue: u64,
}

impl PoolLoad {
    fn of(aggregate: &MetricsAggregate, membership: &[PodRecord]) -> Self {
        let mut load = PoolLoad {
            routable: 0,
            reporting: 0,
            reported_queue: 0,
        };
        for record in membership.iter().filter(|r| r.status.is_routable()) {
            load.routable += 1;
            if let Some(sample) = aggregate.per_pod.get(&record.pod_id) {
                load.reporting += 1;
                load.reported_queue += sample.queue_size;
            }
        }
        load
    }

    /// Mean queue over the pods that reported. Silent pods are unknown,
    /// not empty.
    fn per_pod_queue(&self) -> f64 {
        self.reported_queue as f64 / self.reporting.max(1) as f64
    }

    fn silent(&self) -> usize {
        self.routable - self.reporting
    }
}

/// A threshold breach and when it started.
#[derive(Debug, Clone, Copy)]
struct Breach {
    direction: ScaleDirection,
    since: u64,
}

pub struct ScalingCoordinator {
    pod_id: PodId,
    store: SharedStore,
    keys: Keyspace,
    clock: SharedClock,
    policy: ScalingPolicy,
    breach: Mutex<Option<Breach>>,
}

impl ScalingCoordinator {
    pub fn new(
        pod_id: impl Into<PodId>,
        store: SharedStore,
        keys: Keyspace,
        clock: SharedClock,
        policy: ScalingPolicy,
    ) -> Self {
        Self {
            pod_id: pod_id.into(),
            store,
            keys,
            clock,
            policy,
            breach: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    /// Direction the pool should move in, given the latest aggregate and
    /// the live membership.
    ///
    /// The per-pod queue is averaged over routable pods that reported a
    /// sample. DOWN also needs every routable pod to have reported. A breach
    /// must persist for `debounce_window` across calls before it turns into
    /// UP or DOWN.
    pub fn evaluate(
        &self,
        aggregate: &MetricsAggregate,
        membership: &[PodRecord],
    ) -> ScaleDirection {
        let now = self.clock.now_millis();
        let load = PoolLoad::of(aggregate, membership);
        let mut breach = self.breach.lock().unwrap_or_else(PoisonError::into_inner);

        if load.routable == 0 || load.reporting == 0 {
            *breach = None;
            return ScaleDirection::Hold;
        }

        let candidate = match load.per_pod_queue() {
            q if q > self.policy.queue_capacity_per_pod as f64 => Some(ScaleDirection::Up),
            q if q < self.scale_down_level() => Some(ScaleDirection::Down),
            _ => None,
        };

        let direction = match candidate {
            Some(ScaleDirection::Down) if load.silent() > 0 => {
                debug!(
                    pod_id = %self.pod_id,
                    silent = load.silent(),
                    "pool looks idle but some pods are silent"
                );
                None
            }
            other => other,
        };
        let Some(direction) = direction else {
            *breach = None;
            return ScaleDirection::Hold;
        };

        let since = match *breach {
            Some(b) if b.direction == direction => b.since,
            _ => {
                debug!(pod_id = %self.pod_id, %direction, "threshold breach started");
                *breach = Some(Breach {
                    direction,
                    since: now,
                });
                now
            }
        };

        let sustained =
            now.saturating_sub(since) >= self.policy.debounce_window.as_millis() as u64;
        if !sustained {
            return ScaleDirection::Hold;
        }

        let active = load.routable;
        match direction {
            ScaleDirection::Up if active < self.policy.max_pods as usize => ScaleDirection::Up,
            ScaleDirection::Down if active > self.policy.min_pods as usize => ScaleDirection::Down,
            _ => {
                debug!(
                    pod_id = %self.pod_id,
                    %direction,
                    active,
                    "breach sustained but pool at its bound"
                );
                ScaleDirection::Hold
            }
        }
    }

    /// Evaluate, and publish if the pool should move.
    pub async fn run_cycle(
        &self,
        aggregate: &MetricsAggregate,
        membership: &[PodRecord],
    ) -> StoreResult<PublishOutcome> {
        let direction = self.evaluate(aggregate, membership);
        if direction == ScaleDirection::Hold {
            return Ok(PublishOutcome::Hold);
        }
        let decision = self.decision(direction, aggregate, &PoolLoad::of(aggregate, membership));
        self.attempt_publish(decision).await
    }

    /// Take the scaling lock and write `decision`, unless a decision of
    /// the same direction is still within its debounce window or another
    /// pod holds the lock. Losing the lock is not an error.
    pub async fn attempt_publish(
        &self,
        decision: ScalingDecision,
    ) -> StoreResult<PublishOutcome> {
        let mut phase = CyclePhase::Evaluating(decision);
        loop {
            let from = phase.name();
            match self.advance(phase).await? {
                Transition::Next(next) => {
                    debug!(pod_id = %self.pod_id, from, to = next.name(), "scaling cycle");
                    phase = next;
                }
                Transition::Done(outcome) => return Ok(outcome),
            }
        }
    }

    /// The decision currently published for the orchestrator.
    pub async fn latest_decision(&self) -> StoreResult<Option<ScalingDecision>> {
        match self.store.get(&self.keys.scale_decision()).await? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn advance(&self, phase: CyclePhase) -> StoreResult<Transition> {
        let transition = match phase {
            CyclePhase::Evaluating(decision) => {
                if decision.direction == ScaleDirection::Hold {
                    return Ok(Transition::Done(PublishOutcome::Hold));
                }
                if let Some(last_at) = self.debounced_since(decision.direction).await? {
                    return Ok(Transition::Done(PublishOutcome::Debounced { last_at }));
                }
                match self.try_lock().await? {
                    Some(lock) => Transition::Next(CyclePhase::LockAcquired { lock, decision }),
                    None => Transition::Next(CyclePhase::LockDenied),
                }
            }

            CyclePhase::LockAcquired { lock, decision } => {
                // The last decision may have landed between the first check
                // and the lock.
                match self.debounced_since(decision.direction).await? {
                    Some(last_at) => Transition::Done(PublishOutcome::Debounced { last_at }),
                    None => Transition::Next(CyclePhase::Deciding { lock, decision }),
                }
            }

            CyclePhase::Deciding { lock, decision } => {
                self.write_decision(&lock, &decision).await?;
                Transition::Next(CyclePhase::Published(decision))
            }

            CyclePhase::Published(decision) => {
                *self.breach.lock().unwrap_or_else(PoisonError::into_inner) = None;
                info!(
                    pod_id = %self.pod_id,
                    direction = %decision.direction,
                    active_pods = decision.active_pods,
                    reason = %decision.reason,
                    "scaling decision published"
                );
                Transition::Done(PublishOutcome::Published(decision))
            }

            CyclePhase::LockDenied => {
                debug!(pod_id = %self.pod_id, "scaling lock held by another pod");
                Transition::Done(PublishOutcome::LockDenied)
            }
        };
        Ok(transition)
    }

    /// Timestamp of the last decision in `direction` if it is still within
    /// the debounce window.
    async fn debounced_since(&self, direction: ScaleDirection) -> StoreResult<Option<u64>> {
        let Some(bytes) = self.store.get(&self.keys.last_decision(direction)).await? else {
            return Ok(None);
        };
        let last: ScalingDecision = match decode(&bytes) {
            Ok(last) => last,
            Err(e) => {
                warn!(%direction, error = %e, "unreadable last decision, ignoring");
                return Ok(None);
            }
        };

        let now = self.clock.now_millis();
        let window = self.policy.debounce_window.as_millis() as u64;
        Ok((now.saturating_sub(last.timestamp) < window).then_some(last.timestamp))
    }

    async fn try_lock(&self) -> StoreResult<Option<HeldLock>> {
        let key = self.keys.scale_lock();
        let ttl = self.policy.debounce_window.max(MIN_LOCK_TTL);
        let acquired = self
            .store
            .set_nx_with_ttl(&key, self.pod_id.as_bytes(), ttl)
            .await?;
        Ok(acquired.then(|| HeldLock {
            key,
            acquired_at: self.clock.now_millis(),
        }))
    }

    /// Write the decision record and the per-direction debounce marker.
    /// The lock is left to expire on its own.
    async fn write_decision(
        &self,
        lock: &HeldLock,
        decision: &ScalingDecision,
    ) -> StoreResult<()> {
        let value = encode(decision)?;
        let decision_ttl = Duration::from_secs(decision.ttl_secs);
        self.store
            .set_with_ttl(&self.keys.scale_decision(), &value, decision_ttl)
            .await?;
        self.store
            .set_with_ttl(
                &self.keys.last_decision(decision.direction),
                &value,
                decision_ttl.max(self.policy.debounce_window),
            )
            .await?;
        debug!(
            pod_id = %self.pod_id,
            lock = %lock.key,
            acquired_at = lock.acquired_at,
            "decision written"
        );
        Ok(())
    }

    fn decision(
        &self,
        direction: ScaleDirection,
        aggregate: &MetricsAggregate,
        load: &PoolLoad,
    ) -> ScalingDecision {
        let per_pod = load.per_pod_queue();
        let (reporting, active_pods) = (load.reporting, load.routable);
        let reason = match direction {
            ScaleDirection::Up => format!(
                "queue {per_pod:.1}/pod above capacity {} across {reporting} of {active_pods} pods",
                self.policy.queue_capacity_per_pod
            ),
            ScaleDirection::Down => format!(
                "queue {per_pod:.1}/pod below {:.1} across {reporting} of {active_pods} pods",
                self.scale_down_level()
            ),
            ScaleDirection::Hold => "within thresholds".to_string(),
        };

        ScalingDecision {
            requested_by: self.pod_id.clone(),
            direction,
            reason,
            metrics_snapshot: aggregate.clone(),
            active_pods,
            timestamp: self.clock.now_millis(),
            ttl_secs: self.policy.decision_ttl.as_secs(),
        }
    }

    fn scale_down_level(&self) -> f64 {
        self.policy.queue_capacity_per_pod as f64 * self.policy.scale_down_ratio
    }
}
