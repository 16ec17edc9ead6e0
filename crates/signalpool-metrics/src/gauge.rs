//! Queue gauge — lock-free counters updated on the admission hot path.

use std::sync::atomic::{AtomicU64, Ordering};

use signalpool_state::QueueMetricSample;

/// Work-queue counters for one pod.
///
/// `enqueue`/`dequeue` track the waiting depth; `complete` counts finished
/// items since the previous [`QueueGauge::sample`].
#[derive(Debug)]
pub struct QueueGauge {
    depth: AtomicU64,
    completed: AtomicU64,
    last_sample_at: AtomicU64,
    /// f64 bits.
    cpu: AtomicU64,
    /// f64 bits.
    mem: AtomicU64,
}

impl QueueGauge {
    /// Create a gauge whose first rate window starts at `now_millis`.
    pub fn new(now_millis: u64) -> Self {
        Self {
            depth: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            last_sample_at: AtomicU64::new(now_millis),
            cpu: AtomicU64::new(0f64.to_bits()),
            mem: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn enqueue(&self) {
        self.depth.fetch_add(1, Ordering::Relaxed);
    }

    /// An item left the queue. Never underflows.
    pub fn dequeue(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| d.checked_sub(1));
    }

    pub fn complete(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Latest host utilisation fractions, reported with the next sample.
    pub fn set_utilisation(&self, cpu: f64, mem: f64) {
        self.cpu
            .store(cpu.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        self.mem
            .store(mem.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Close the current window and turn it into a sample.
    /// `processing_rate` is completions per second since the last sample.
    pub fn sample(&self, pod_id: &str, now_millis: u64) -> QueueMetricSample {
        let completed = self.completed.swap(0, Ordering::Relaxed);
        let since = self.last_sample_at.swap(now_millis, Ordering::Relaxed);
        let elapsed_ms = now_millis.saturating_sub(since);
        let processing_rate = if elapsed_ms == 0 {
            0.0
        } else {
            completed as f64 * 1000.0 / elapsed_ms as f64
        };

        QueueMetricSample {
            pod_id: pod_id.to_string(),
            queue_size: self.depth(),
            processing_rate,
            cpu: f64::from_bits(self.cpu.load(Ordering::Relaxed)),
            mem: f64::from_bits(self.mem.load(Ordering::Relaxed)),
            timestamp: now_millis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn depth_never_underflows() {
        let gauge = QueueGauge::new(0);
        gauge.dequeue();
        assert_eq!(gauge.depth(), 0);
        gauge.enqueue();
        gauge.enqueue();
        gauge.dequeue();
        assert_eq!(gauge.depth(), 1);
    }

    #[test]
    fn sample_computes_rate_and_resets_window() {
        let gauge = QueueGauge::new(0);
        for _ in 0..50 {
            gauge.enqueue();
        }
        for _ in 0..20 {
            gauge.dequeue();
            gauge.complete();
        }
        gauge.set_utilisation(0.75, 1.5);

        let s = gauge.sample("pod-1", 5_000);
        assert_eq!(s.queue_size, 30);
        assert_eq!(s.processing_rate, 4.0);
        assert_eq!(s.cpu, 0.75);
        assert_eq!(s.mem, 1.0);
        assert_eq!(s.timestamp, 5_000);

        let s = gauge.sample("pod-1", 10_000);
        assert_eq!(s.processing_rate, 0.0);
        assert_eq!(s.queue_size, 30);
    }

    #[test]
    fn zero_elapsed_window_reports_zero_rate() {
        let gauge = QueueGauge::new(1_000);
        gauge.complete();
        assert_eq!(gauge.sample("pod-1", 1_000).processing_rate, 0.0);
    }

    #[test]
    fn concurrent_updates_are_counted() {
        let gauge = Arc::new(QueueGauge::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gauge = Arc::clone(&gauge);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        gauge.enqueue();
                        gauge.complete();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let s = gauge.sample("pod-1", 1_000);
        assert_eq!(s.queue_size, 4_000);
        assert_eq!(s.processing_rate, 4_000.0);
    }
}
