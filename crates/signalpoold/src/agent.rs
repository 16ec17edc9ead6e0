//! Pod agent — runs one pod's share of pool coordination.
//!
//! The agent:
//! 1. Registers the pod and loads the current ring
//! 2. Runs four independent timers: heartbeat, metric sampling and
//!    publication, scaling evaluation, and failover scan
//! 3. On shutdown marks the pod DRAINING, then deregisters within
//!    `deregister_timeout` and stops regardless of the outcome
//!
//! Every tick is also callable directly, which is how the in-process
//! simulations drive many agents against one store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use signalpool_autoscale::{PublishOutcome, ScalingCoordinator, ScalingPolicy};
use signalpool_cluster::{
    FailoverDetector, FailoverReport, MembershipRegistry, RingError, RingRouter,
};
use signalpool_core::PoolConfig;
use signalpool_metrics::{BackpressureConfig, BackpressureMonitor, QueueGauge};
use signalpool_state::{
    Keyspace, LoadSnapshot, PodId, PodRecord, QueueMetricSample, SharedClock, SharedStore,
    StoreResult,
};

pub struct PodAgent {
    pod_id: PodId,
    config: PoolConfig,
    clock: SharedClock,
    metadata: HashMap<String, String>,
    registry: Arc<MembershipRegistry>,
    router: Arc<RingRouter>,
    monitor: BackpressureMonitor,
    coordinator: ScalingCoordinator,
    failover: FailoverDetector,
    gauge: QueueGauge,
}

impl PodAgent {
    pub fn new(
        pod_id: impl Into<PodId>,
        config: PoolConfig,
        store: SharedStore,
        clock: SharedClock,
    ) -> Self {
        let pod_id = pod_id.into();
        let keys = Keyspace::new(config.namespace.clone());

        let registry = Arc::new(
            MembershipRegistry::new(store.clone(), keys.clone(), clock.clone())
                .with_heartbeat_ttl(config.heartbeat_ttl()),
        );
        let router = Arc::new(RingRouter::new(
            pod_id.clone(),
            registry.clone(),
            config.virtual_nodes_per_pod,
        ));
        let monitor = BackpressureMonitor::new(
            pod_id.clone(),
            store.clone(),
            keys.clone(),
            clock.clone(),
            BackpressureConfig::from(&config),
        );
        let coordinator = ScalingCoordinator::new(
            pod_id.clone(),
            store,
            keys,
            clock.clone(),
            ScalingPolicy::from(&config),
        );
        let failover = FailoverDetector::new(registry.clone(), router.clone())
            .with_reap_after(config.stale_reap_after());
        let gauge = QueueGauge::new(clock.now_millis());

        Self {
            pod_id,
            config,
            clock,
            metadata: HashMap::new(),
            registry,
            router,
            monitor,
            coordinator,
            failover,
            gauge,
        }
    }

    /// Metadata published with the membership record.
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn registry(&self) -> &MembershipRegistry {
        &self.registry
    }

    pub fn router(&self) -> &RingRouter {
        &self.router
    }

    pub fn monitor(&self) -> &BackpressureMonitor {
        &self.monitor
    }

    pub fn coordinator(&self) -> &ScalingCoordinator {
        &self.coordinator
    }

    /// Counters the admission layer updates as work moves through the pod.
    pub fn gauge(&self) -> &QueueGauge {
        &self.gauge
    }

    /// Owner of `key` on the current ring.
    pub fn assign(&self, key: &str) -> Result<PodId, RingError> {
        self.router.assign(key)
    }

    pub fn should_handle(&self, key: &str) -> bool {
        self.router.should_handle(key)
    }

    // ── Ticks ──────────────────────────────────────────────────────

    /// Register this pod and load the ring.
    pub async fn start(&self) -> StoreResult<PodRecord> {
        let record = self.registry.register(&self.pod_id, self.metadata.clone()).await?;
        self.router.refresh().await;
        info!(pod_id = %self.pod_id, ring = self.router.members().len(), "pod agent started");
        Ok(record)
    }

    /// Write a heartbeat carrying the latest local load.
    pub async fn heartbeat_tick(&self) -> StoreResult<PodRecord> {
        let load = self.load_snapshot();
        self.registry.heartbeat(&self.pod_id, load).await
    }

    /// Sample the local queue into the window and publish the sample.
    pub async fn sample_tick(&self) -> StoreResult<QueueMetricSample> {
        let sample = self.gauge.sample(&self.pod_id, self.clock.now_millis());
        self.monitor.record_local_metrics(sample.clone());
        self.monitor.publish_metrics(&sample).await?;
        Ok(sample)
    }

    /// Read the aggregate and live membership, then run one scaling cycle.
    pub async fn evaluation_tick(&self) -> StoreResult<PublishOutcome> {
        let aggregate = self.monitor.aggregate().await?;
        let membership = self.registry.snapshot().await?;
        self.coordinator.run_cycle(&aggregate, &membership.active).await
    }

    /// Diff membership and update the ring.
    pub async fn failover_tick(&self) -> StoreResult<FailoverReport> {
        self.failover.scan().await
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Run every timer until `shutdown` flips to true, then leave the pool.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if let Err(e) = self.start().await {
            // The first heartbeat registers the pod once the store is back.
            warn!(pod_id = %self.pod_id, error = %e, "initial registration failed");
        }

        let heartbeat = {
            let agent = self.clone();
            tokio::spawn(every(
                "heartbeat",
                self.config.heartbeat_interval(),
                shutdown.clone(),
                move || {
                    let agent = agent.clone();
                    async move {
                        if let Err(e) = agent.heartbeat_tick().await {
                            warn!(pod_id = %agent.pod_id, error = %e, "heartbeat failed");
                        }
                    }
                },
            ))
        };

        let sampling = {
            let agent = self.clone();
            tokio::spawn(every(
                "sampling",
                self.config.sampling_interval(),
                shutdown.clone(),
                move || {
                    let agent = agent.clone();
                    async move {
                        if let Err(e) = agent.sample_tick().await {
                            warn!(pod_id = %agent.pod_id, error = %e, "metrics publish failed");
                        }
                    }
                },
            ))
        };

        let evaluation = {
            let agent = self.clone();
            tokio::spawn(every(
                "evaluation",
                self.config.evaluation_interval(),
                shutdown.clone(),
                move || {
                    let agent = agent.clone();
                    async move { agent.log_evaluation().await }
                },
            ))
        };

        let failover = {
            let agent = self.clone();
            tokio::spawn(every(
                "failover",
                self.config.heartbeat_interval(),
                shutdown.clone(),
                move || {
                    let agent = agent.clone();
                    async move {
                        if let Err(e) = agent.failover_tick().await {
                            warn!(
                                pod_id = %agent.pod_id,
                                error = %e,
                                "failover scan failed, keeping cached ring"
                            );
                        }
                    }
                },
            ))
        };

        for (name, handle) in [
            ("heartbeat", heartbeat),
            ("sampling", sampling),
            ("evaluation", evaluation),
            ("failover", failover),
        ] {
            if let Err(e) = handle.await {
                warn!(
                    pod_id = %self.pod_id,
                    task = name,
                    error = %e,
                    "timer task ended abnormally"
                );
            }
        }

        self.leave().await;
        Ok(())
    }

    /// Mark DRAINING, then deregister within `deregister_timeout`. Failures
    /// are logged; TTL expiry removes the pod from peers' rings anyway.
    pub async fn leave(&self) {
        if let Err(e) = self.registry.mark_draining(&self.pod_id).await {
            warn!(pod_id = %self.pod_id, error = %e, "failed to mark pod draining");
        }

        let timeout = self.config.deregister_timeout();
        match tokio::time::timeout(timeout, self.registry.deregister(&self.pod_id)).await {
            Ok(Ok(_)) => info!(pod_id = %self.pod_id, "pod left the pool"),
            Ok(Err(e)) => warn!(
                pod_id = %self.pod_id,
                error = %e,
                "deregister failed, record will expire"
            ),
            Err(_) => warn!(
                pod_id = %self.pod_id,
                timeout_ms = timeout.as_millis() as u64,
                "deregister timed out, record will expire"
            ),
        }
    }

    async fn log_evaluation(&self) {
        match self.evaluation_tick().await {
            Ok(PublishOutcome::Published(d)) => {
                info!(pod_id = %self.pod_id, direction = %d.direction, "scale decision issued");
            }
            Ok(outcome) => debug!(pod_id = %self.pod_id, ?outcome, "scaling cycle finished"),
            Err(e) => warn!(pod_id = %self.pod_id, error = %e, "scaling evaluation failed"),
        }
    }

    fn load_snapshot(&self) -> LoadSnapshot {
        let capacity = self.config.queue_capacity_per_pod.max(1) as f64;
        let overloaded = self.monitor.check_local_backpressure();
        match self.monitor.latest() {
            Some(sample) => LoadSnapshot {
                load: (sample.queue_size as f64 / capacity).clamp(0.0, 1.0),
                queue_size: sample.queue_size,
                processing_rate: sample.processing_rate,
                overloaded,
            },
            None => LoadSnapshot {
                overloaded,
                ..LoadSnapshot::default()
            },
        }
    }
}

/// Call `tick` every `period` until `shutdown` becomes true or its sender
/// is dropped. The first tick fires immediately.
async fn every<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(task = name, period_ms = period.as_millis() as u64, "timer started");

    while !*shutdown.borrow() {
        tokio::select! {
            _ = interval.tick() => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!(task = name, "timer stopped");
}
