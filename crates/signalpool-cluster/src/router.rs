//! Ring router — the cached, lazily rebuilt view of the ring a pod routes
//! with.
//!
//! The router keeps the last routable membership it saw and a version
//! counter that only moves when that set changes. The ring itself is
//! rebuilt on the first lookup after a version change, so a burst of
//! membership updates costs one build. If the store cannot be read the
//! router keeps answering from the cached ring.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use signalpool_state::{PodId, PodRecord};

use crate::error::RingError;
use crate::membership::MembershipRegistry;
use crate::ring::HashRing;

#[derive(Debug, Default)]
struct RouterState {
    members: BTreeSet<PodId>,
    version: u64,
    built: Option<(u64, Arc<HashRing>)>,
}

pub struct RingRouter {
    pod_id: PodId,
    registry: Arc<MembershipRegistry>,
    virtual_nodes: usize,
    state: RwLock<RouterState>,
}

impl RingRouter {
    pub fn new(
        pod_id: impl Into<PodId>,
        registry: Arc<MembershipRegistry>,
        virtual_nodes: usize,
    ) -> Self {
        Self {
            pod_id: pod_id.into(),
            registry,
            virtual_nodes: virtual_nodes.max(1),
            state: RwLock::new(RouterState::default()),
        }
    }

    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    /// Record the routable subset of `records`. Returns true when the
    /// membership changed.
    pub fn observe(&self, records: &[PodRecord]) -> bool {
        let members: BTreeSet<PodId> = records
            .iter()
            .filter(|r| r.status.is_routable())
            .map(|r| r.pod_id.clone())
            .collect();

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.members == members {
            return false;
        }

        let joined = members.difference(&state.members).count();
        let left = state.members.difference(&members).count();
        state.members = members;
        state.version += 1;
        info!(
            pod_id = %self.pod_id,
            version = state.version,
            members = state.members.len(),
            joined,
            left,
            "ring membership changed"
        );
        true
    }

    /// Re-read live membership from the registry. On a store failure the
    /// cached membership is kept and `false` is returned.
    pub async fn refresh(&self) -> bool {
        let registry = &self.registry;
        let now = registry.clock().now_millis();
        match registry.list_active(now, registry.heartbeat_ttl()).await {
            Ok(active) => self.observe(&active),
            Err(e) => {
                warn!(
                    pod_id = %self.pod_id,
                    error = %e,
                    "membership read failed, routing with cached ring"
                );
                false
            }
        }
    }

    /// Current membership version. Starts at 0 before anything is observed.
    pub fn version(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version
    }

    /// Routable pods, sorted.
    pub fn members(&self) -> Vec<PodId> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .iter()
            .cloned()
            .collect()
    }

    /// The ring for the current version, building it if needed.
    pub fn ring(&self) -> Arc<HashRing> {
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if let Some((version, ring)) = &state.built {
                if *version == state.version {
                    return Arc::clone(ring);
                }
            }
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have rebuilt while we waited for the lock.
        if let Some((version, ring)) = &state.built {
            if *version == state.version {
                return Arc::clone(ring);
            }
        }

        let ring = Arc::new(HashRing::build(&state.members, self.virtual_nodes));
        debug!(
            pod_id = %self.pod_id,
            version = state.version,
            pods = ring.len(),
            "ring rebuilt"
        );
        state.built = Some((state.version, Arc::clone(&ring)));
        ring
    }

    /// Whether the current ring was built for the current version.
    pub fn is_built(&self) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        matches!(&state.built, Some((version, _)) if *version == state.version)
    }

    /// Owner of `key`.
    pub fn assign(&self, key: &str) -> Result<PodId, RingError> {
        self.ring().assign(key).map(str::to_string)
    }

    /// Whether this pod owns `key`.
    pub fn should_handle(&self, key: &str) -> bool {
        self.ring().is_owned_by(key, &self.pod_id)
    }
}
