//! signalpool-metrics — work-queue observability for the pod pool.
//!
//! Each pod samples its own queue, keeps a short time-pruned history to
//! detect local backpressure, and publishes its latest sample with a TTL so
//! every peer can compute the same pool-wide aggregate.
//!
//! # Architecture
//!
//! ```text
//! QueueGauge
//!   ├── enqueue() / dequeue() / complete() ← admission layer, lock-free
//!   └── sample() → QueueMetricSample for one tick
//!
//! BackpressureMonitor
//!   ├── record_local_metrics() → SampleWindow (pruned by age)
//!   ├── check_local_backpressure() → threshold or declining-rate trend
//!   ├── publish_metrics() → {ns}:metrics:{pod_id} with metrics_ttl
//!   └── aggregate() → MetricsAggregate over every registered pod
//! ```

pub mod gauge;
pub mod monitor;
pub mod window;

pub use gauge::QueueGauge;
pub use monitor::{BackpressureConfig, BackpressureMonitor};
pub use window::SampleWindow;
