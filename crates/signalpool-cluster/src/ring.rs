//! Consistent hash ring with virtual nodes.
//!
//! Ring positions and key hashes are the first eight bytes of SHA-256, so
//! the mapping is identical on every pod, every build, and every platform.
//! Building from the same pod set (in any order) always yields the same
//! ring; when two virtual nodes collide, the smaller pod id keeps the slot.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use signalpool_state::PodId;

use crate::error::RingError;

/// Default virtual nodes per pod.
pub const DEFAULT_VIRTUAL_NODES: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRing {
    ring: BTreeMap<u64, PodId>,
    pods: Vec<PodId>,
    virtual_nodes: usize,
}

impl HashRing {
    /// Build a ring over `active_pods`. Duplicates are ignored.
    pub fn build<I, S>(active_pods: I, virtual_nodes: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let virtual_nodes = virtual_nodes.max(1);
        let mut pods: Vec<PodId> = active_pods
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect();
        pods.sort();
        pods.dedup();

        let mut ring = BTreeMap::new();
        for pod in &pods {
            for vnode in 0..virtual_nodes {
                let position = hash_position(format!("{pod}#{vnode}").as_bytes());
                // Pods are visited in sorted order, so the first writer of
                // a colliding slot is the smallest id.
                ring.entry(position).or_insert_with(|| pod.clone());
            }
        }

        Self {
            ring,
            pods,
            virtual_nodes,
        }
    }

    pub fn empty() -> Self {
        Self::build(std::iter::empty::<&str>(), DEFAULT_VIRTUAL_NODES)
    }

    /// Owner of `key`: the pod at the first position ≥ hash(key), wrapping
    /// around to the start of the ring.
    pub fn assign(&self, key: &str) -> Result<&str, RingError> {
        let hash = hash_position(key.as_bytes());
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, pod)| pod.as_str())
            .ok_or(RingError::NoAvailablePod)
    }

    pub fn is_owned_by(&self, key: &str, pod_id: &str) -> bool {
        self.assign(key).is_ok_and(|owner| owner == pod_id)
    }

    /// Pods on the ring, sorted.
    pub fn pods(&self) -> &[PodId] {
        &self.pods
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }
}

/// Ring position of arbitrary bytes.
pub fn hash_position(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}
