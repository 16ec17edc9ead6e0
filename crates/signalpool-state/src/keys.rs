//! Key layout in the coordination store.
//!
//! Every key is prefixed with the pool namespace so several pools can
//! share one store:
//!
//! ```text
//! {ns}:members              hash, field = pod_id, value = PodRecord
//! {ns}:metrics:{pod_id}     value with TTL, QueueMetricSample
//! {ns}:scale:lock           SET NX lock guarding decision publication
//! {ns}:scale:decision       latest ScalingDecision (read by the orchestrator)
//! {ns}:scale:last:{dir}     last decision per direction (debounce)
//! ```

use crate::types::ScaleDirection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    namespace: String,
}

impl Keyspace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn members(&self) -> String {
        format!("{}:members", self.namespace)
    }

    pub fn metrics(&self, pod_id: &str) -> String {
        format!("{}:metrics:{pod_id}", self.namespace)
    }

    pub fn scale_lock(&self) -> String {
        format!("{}:scale:lock", self.namespace)
    }

    pub fn scale_decision(&self) -> String {
        format!("{}:scale:decision", self.namespace)
    }

    pub fn last_decision(&self, direction: ScaleDirection) -> String {
        format!("{}:scale:last:{}", self.namespace, direction.as_str())
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("signalpool")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_carry_namespace() {
        let keys = Keyspace::new("greeks");
        assert_eq!(keys.members(), "greeks:members");
        assert_eq!(keys.metrics("pod-a"), "greeks:metrics:pod-a");
        assert_eq!(keys.scale_lock(), "greeks:scale:lock");
        assert_eq!(keys.scale_decision(), "greeks:scale:decision");
        assert_eq!(
            keys.last_decision(ScaleDirection::Up),
            "greeks:scale:last:up"
        );
    }
}
