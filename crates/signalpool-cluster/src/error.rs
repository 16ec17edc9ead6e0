use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingError {
    /// The ring has no members. The admission layer decides whether to
    /// queue, retry later, or reject.
    #[error("no available pod to own key")]
    NoAvailablePod,
}
