//! Dispatcher error types.

use thiserror::Error;

/// Result type alias for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors surfaced to the external caller of a dispatcher.
///
/// RPC failures never appear here: the dispatcher swallows them and
/// falls back to the local consumer.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatcher was shut down.
    #[error("dispatcher is closed")]
    Closed,

    /// The consumer rejected the request (match, seat, or workload
    /// errors propagate through here).
    #[error("consumer error: {0}")]
    Consumer(#[source] anyhow::Error),

    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
