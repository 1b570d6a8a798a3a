//! Error types for datastore operations.

use thiserror::Error;

/// Result type alias for datastore operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur when talking to the shared datastore.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The datastore connection is down; the operation was not attempted.
    #[error("datastore offline")]
    Offline,

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("datastore backend error: {0}")]
    Backend(String),
}
