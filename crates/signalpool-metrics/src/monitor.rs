//! Backpressure monitor — local overload detection and the pool-wide
//! queue aggregate.
//!
//! Local backpressure is judged from this pod's own sample window only.
//! The aggregate is read from the store, so every pod that reads at the
//! same moment computes the same totals.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use signalpool_core::PoolConfig;
use signalpool_state::{
    Keyspace, MetricsAggregate, PodId, QueueMetricSample, SharedClock, SharedStore, StoreResult,
    decode, encode,
};

use crate::window::SampleWindow;

/// Thresholds the monitor works with.
#[derive(Debug, Clone, PartialEq)]
pub struct BackpressureConfig {
    /// Latest queue size above which the pod is overloaded outright.
    pub queue_threshold: u64,
    /// Consecutive samples that must show a declining rate under a
    /// non-shrinking queue. At least 2.
    pub trend_samples: usize,
    pub sample_window: Duration,
    /// Lifetime of a published sample; older samples are silent.
    pub metrics_ttl: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for BackpressureConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            queue_threshold: config.backpressure_queue_threshold,
            trend_samples: config.backpressure_trend_samples,
            sample_window: config.sample_window(),
            metrics_ttl: config.metrics_ttl(),
        }
    }
}

pub struct BackpressureMonitor {
    pod_id: PodId,
    store: SharedStore,
    keys: Keyspace,
    clock: SharedClock,
    config: BackpressureConfig,
    window: Mutex<SampleWindow>,
    last_aggregate: RwLock<Option<MetricsAggregate>>,
}

impl BackpressureMonitor {
    pub fn new(
        pod_id: impl Into<PodId>,
        store: SharedStore,
        keys: Keyspace,
        clock: SharedClock,
        config: BackpressureConfig,
    ) -> Self {
        let window = SampleWindow::new(config.sample_window);
        Self {
            pod_id: pod_id.into(),
            store,
            keys,
            clock,
            config,
            window: Mutex::new(window),
            last_aggregate: RwLock::new(None),
        }
    }

    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Append a local sample to the window.
    pub fn record_local_metrics(&self, sample: QueueMetricSample) {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if !window.push(sample) {
            debug!(pod_id = %self.pod_id, "dropped out-of-order sample");
        }
    }

    /// Newest local sample.
    pub fn latest(&self) -> Option<QueueMetricSample> {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest()
            .cloned()
    }

    /// Whether this pod is under backpressure: the latest queue exceeds the
    /// threshold, or the processing rate fell at every step of the last
    /// `trend_samples` samples while the queue did not shrink.
    pub fn check_local_backpressure(&self) -> bool {
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(latest) = window.latest() else {
            return false;
        };
        if latest.queue_size > self.config.queue_threshold {
            return true;
        }

        let tail = window.tail(self.config.trend_samples.max(2));
        !tail.is_empty()
            && tail.windows(2).all(|pair| {
                pair[1].processing_rate < pair[0].processing_rate
                    && pair[1].queue_size >= pair[0].queue_size
            })
    }

    /// Publish `sample` under this pod's metrics key with `metrics_ttl`.
    pub async fn publish_metrics(&self, sample: &QueueMetricSample) -> StoreResult<()> {
        let value = encode(sample)?;
        self.store
            .set_with_ttl(&self.keys.metrics(&self.pod_id), &value, self.config.metrics_ttl)
            .await?;
        debug!(pod_id = %self.pod_id, queue = sample.queue_size, "metrics published");
        Ok(())
    }

    /// Sum the latest live sample of every registered pod.
    ///
    /// Pods with no sample, an unreadable sample, or one older than
    /// `metrics_ttl` are listed in `silent` and contribute nothing.
    pub async fn aggregate(&self) -> StoreResult<MetricsAggregate> {
        let now = self.clock.now_millis();
        let ttl_ms = self.config.metrics_ttl.as_millis() as u64;

        let mut pods: Vec<PodId> = self
            .store
            .hash_get_all(&self.keys.members())
            .await?
            .into_keys()
            .collect();
        pods.sort();

        let metric_keys: Vec<String> = pods.iter().map(|p| self.keys.metrics(p)).collect();
        let values = self.store.get_many(&metric_keys).await?;

        let mut aggregate = MetricsAggregate {
            computed_at: now,
            ..MetricsAggregate::default()
        };
        for (pod_id, value) in pods.into_iter().zip(values) {
            let sample = match value.map(|bytes| decode::<QueueMetricSample>(&bytes)) {
                Some(Ok(sample)) if now.saturating_sub(sample.timestamp) <= ttl_ms => sample,
                Some(Err(e)) => {
                    warn!(%pod_id, error = %e, "unreadable metrics sample");
                    aggregate.silent.push(pod_id);
                    continue;
                }
                _ => {
                    aggregate.silent.push(pod_id);
                    continue;
                }
            };
            aggregate.total_queue_size += sample.queue_size;
            aggregate.total_processing_rate += sample.processing_rate;
            aggregate.per_pod.insert(pod_id, sample);
        }

        debug!(
            reporting = aggregate.reporting_pods(),
            silent = aggregate.silent.len(),
            total_queue = aggregate.total_queue_size,
            "metrics aggregated"
        );
        *self.last_aggregate.write().await = Some(aggregate.clone());
        Ok(aggregate)
    }

    /// The last aggregate computed successfully.
    pub async fn last_aggregate(&self) -> Option<MetricsAggregate> {
        self.last_aggregate.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use signalpool_state::*;

    use crate::window::sample;

    fn config() -> BackpressureConfig {
        BackpressureConfig {
            queue_threshold: 200,
            trend_samples: 3,
            sample_window: Duration::from_secs(60),
            metrics_ttl: Duration::from_secs(10),
        }
    }

    fn monitor(pod_id: &str, store: &MemoryStore, clock: &ManualClock) -> BackpressureMonitor {
        BackpressureMonitor::new(
            pod_id,
            Arc::new(store.clone()),
            Keyspace::default(),
            Arc::new(clock.clone()),
            config(),
        )
    }

    async fn register(store: &MemoryStore, pods: &[&str]) {
        let fields: Vec<(String, Vec<u8>)> = pods
            .iter()
            .map(|p| {
                let record = PodRecord::new(*p, Default::default(), 0);
                (p.to_string(), encode(&record).unwrap())
            })
            .collect();
        store
            .hash_set_all(&Keyspace::default().members(), &fields)
            .await
            .unwrap();
    }

    fn pod_sample(pod_id: &str, timestamp: u64, queue_size: u64, rate: f64) -> QueueMetricSample {
        QueueMetricSample {
            pod_id: pod_id.to_string(),
            ..sample(timestamp, queue_size, rate)
        }
    }

    #[test]
    fn steady_decline_is_backpressure() {
        let clock = ManualClock::new(0);
        let m = monitor("pod-1", &MemoryStore::with_clock(Arc::new(clock.clone())), &clock);

        m.record_local_metrics(sample(0, 50, 40.0));
        m.record_local_metrics(sample(5_000, 60, 30.0));
        assert!(!m.check_local_backpressure(), "two samples are not a trend");

        m.record_local_metrics(sample(10_000, 60, 20.0));
        assert!(m.check_local_backpressure());
    }

    #[test]
    fn transient_spike_is_not_backpressure() {
        let clock = ManualClock::new(0);
        let m = monitor("pod-1", &MemoryStore::with_clock(Arc::new(clock.clone())), &clock);

        m.record_local_metrics(sample(0, 50, 40.0));
        m.record_local_metrics(sample(5_000, 50, 40.0));
        m.record_local_metrics(sample(10_000, 150, 25.0));
        assert!(!m.check_local_backpressure());

        m.record_local_metrics(sample(15_000, 40, 41.0));
        assert!(!m.check_local_backpressure());
    }

    #[test]
    fn draining_queue_with_falling_rate_is_not_backpressure() {
        let clock = ManualClock::new(0);
        let m = monitor("pod-1", &MemoryStore::with_clock(Arc::new(clock.clone())), &clock);

        m.record_local_metrics(sample(0, 90, 40.0));
        m.record_local_metrics(sample(5_000, 60, 30.0));
        m.record_local_metrics(sample(10_000, 30, 20.0));
        assert!(!m.check_local_backpressure());
    }

    #[test]
    fn queue_over_threshold_is_backpressure() {
        let clock = ManualClock::new(0);
        let m = monitor("pod-1", &MemoryStore::with_clock(Arc::new(clock.clone())), &clock);
        assert!(!m.check_local_backpressure());

        m.record_local_metrics(sample(0, 201, 100.0));
        assert!(m.check_local_backpressure());
    }

    #[tokio::test]
    async fn aggregate_sums_live_samples() {
        let clock = ManualClock::new(100_000);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        register(&store, &["pod-1", "pod-2"]).await;

        let m1 = monitor("pod-1", &store, &clock);
        let m2 = monitor("pod-2", &store, &clock);
        m1.publish_metrics(&pod_sample("pod-1", 100_000, 120, 12.5))
            .await
            .unwrap();
        m2.publish_metrics(&pod_sample("pod-2", 100_000, 30, 7.5))
            .await
            .unwrap();

        let agg = m1.aggregate().await.unwrap();
        assert_eq!(agg.total_queue_size, 150);
        assert_eq!(agg.total_processing_rate, 20.0);
        assert_eq!(agg.reporting_pods(), 2);
        assert!(agg.silent.is_empty());
        assert_eq!(m1.last_aggregate().await, Some(agg.clone()));

        // Every pod computes the same totals.
        let from_peer = m2.aggregate().await.unwrap();
        assert_eq!(from_peer.per_pod, agg.per_pod);
    }

    #[tokio::test]
    async fn silent_pods_are_excluded_not_zeroed() {
        let clock = ManualClock::new(0);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        register(&store, &["pod-1", "pod-2", "pod-3"]).await;

        let m1 = monitor("pod-1", &store, &clock);
        let m2 = monitor("pod-2", &store, &clock);
        m2.publish_metrics(&pod_sample("pod-2", 0, 80, 4.0))
            .await
            .unwrap();

        // pod-2's sample expires before pod-1 publishes.
        clock.set(15_000);
        m1.publish_metrics(&pod_sample("pod-1", 15_000, 10, 1.0))
            .await
            .unwrap();

        let agg = m1.aggregate().await.unwrap();
        assert_eq!(agg.total_queue_size, 10);
        assert_eq!(agg.reporting_pods(), 1);
        assert_eq!(agg.silent, vec!["pod-2", "pod-3"]);
    }

    #[tokio::test]
    async fn old_sample_still_in_store_is_silent() {
        let clock = ManualClock::new(50_000);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        register(&store, &["pod-1"]).await;

        // The key is fresh but the sample inside it is from long ago.
        let m1 = monitor("pod-1", &store, &clock);
        m1.publish_metrics(&pod_sample("pod-1", 1_000, 500, 1.0))
            .await
            .unwrap();

        let agg = m1.aggregate().await.unwrap();
        assert_eq!(agg.total_queue_size, 0);
        assert_eq!(agg.silent, vec!["pod-1"]);
    }

    #[tokio::test]
    async fn failed_aggregate_keeps_last_good() {
        let clock = ManualClock::new(0);
        let store = Arc::new(FaultyStore::new(MemoryStore::with_clock(Arc::new(
            clock.clone(),
        ))));
        let m = BackpressureMonitor::new(
            "pod-1",
            store.clone(),
            Keyspace::default(),
            Arc::new(clock.clone()),
            config(),
        );
        let first = m.aggregate().await.unwrap();

        store.set_failing(true);
        assert!(m.aggregate().await.is_err());
        assert!(m.publish_metrics(&sample(0, 1, 1.0)).await.is_err());
        assert_eq!(m.last_aggregate().await, Some(first));
    }

    #[test]
    fn config_follows_pool_config() {
        let pool = PoolConfig {
            sampling_interval_s: 4,
            metrics_ttl_s: None,
            backpressure_queue_threshold: 75,
            ..PoolConfig::default()
        };
        let cfg = BackpressureConfig::from(&pool);
        assert_eq!(cfg.metrics_ttl, Duration::from_secs(8));
        assert_eq!(cfg.queue_threshold, 75);
    }
}
