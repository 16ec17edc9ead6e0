//! Error types for coordination store operations.

use thiserror::Error;

/// Result type alias for coordination store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the operation. Transient:
    /// callers degrade to their last-known-good view.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl StoreError {
    /// Whether retrying on a later tick may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
