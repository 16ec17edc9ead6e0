//! Sliding window of local queue samples, pruned by age rather than count.

use std::collections::VecDeque;
use std::time::Duration;

use signalpool_state::QueueMetricSample;

#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<QueueMetricSample>,
    span: Duration,
}

impl SampleWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            span,
        }
    }

    /// Append a sample and drop everything older than `span` relative to
    /// it. A sample stamped earlier than the newest one is ignored.
    pub fn push(&mut self, sample: QueueMetricSample) -> bool {
        if self
            .samples
            .back()
            .is_some_and(|last| sample.timestamp < last.timestamp)
        {
            return false;
        }

        let horizon = sample
            .timestamp
            .saturating_sub(self.span.as_millis() as u64);
        self.samples.push_back(sample);
        while self
            .samples
            .front()
            .is_some_and(|oldest| oldest.timestamp < horizon)
        {
            self.samples.pop_front();
        }
        true
    }

    pub fn latest(&self) -> Option<&QueueMetricSample> {
        self.samples.back()
    }

    /// The newest `n` samples, oldest first. Empty if fewer are held.
    pub fn tail(&self, n: usize) -> Vec<&QueueMetricSample> {
        if n == 0 || self.samples.len() < n {
            return Vec::new();
        }
        self.samples.iter().skip(self.samples.len() - n).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn span(&self) -> Duration {
        self.span
    }
}

#[cfg(test)]
pub(crate) fn sample(timestamp: u64, queue_size: u64, processing_rate: f64) -> QueueMetricSample {
    QueueMetricSample {
        pod_id: "pod-1".to_string(),
        queue_size,
        processing_rate,
        cpu: 0.4,
        mem: 0.3,
        timestamp,
    }
}
