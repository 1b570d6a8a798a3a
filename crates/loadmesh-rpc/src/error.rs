//! RPC transport error types.

use thiserror::Error;

use loadmesh_store::StoreError;

/// Result type alias for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors observable by an RPC caller.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The publish reached zero subscribers: the peer is gone.
    #[error("no subscriber listening for peer {0}")]
    NoSuchPeer(String),

    /// No response arrived before the call deadline.
    #[error("call to peer {0} timed out")]
    CallTimeout(String),

    /// The remote handler ran and failed.
    #[error("remote handler failed: {0}")]
    Handler(String),

    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The local node was disconnected while the call was pending.
    #[error("rpc node disconnected")]
    Disconnected,
}
