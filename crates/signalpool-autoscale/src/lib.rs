//! signalpool-autoscale — pool-wide scaling intent.
//!
//! Every pod evaluates the same aggregate, but only the pod that wins the
//! `SET NX` scaling lock publishes a decision. The coordinator never acts
//! on the decision; an external orchestrator reads it from the store.
//!
//! # Decision rule
//!
//! ```text
//! per_pod = total_queue_size / active_pods
//!
//! UP    if per_pod > queue_capacity_per_pod                      for ≥ debounce_window
//!       and active_pods < max_pods
//! DOWN  if per_pod < queue_capacity_per_pod * scale_down_ratio   for ≥ debounce_window
//!       and active_pods > min_pods
//! HOLD  otherwise (including zero active or zero reporting pods)
//! ```
//!
//! # Publish cycle
//!
//! ```text
//! IDLE → EVALUATING ─┬→ LOCK_ACQUIRED → DECIDING → PUBLISHED → IDLE
//!                    └→ LOCK_DENIED → IDLE
//! ```
//!
//! A decision of the same direction is debounced for `debounce_window`
//! after the last one, checked against the store before taking the lock.

pub mod coordinator;

pub use coordinator::{CyclePhase, HeldLock, PublishOutcome, ScalingCoordinator, ScalingPolicy};
