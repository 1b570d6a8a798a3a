//! loadmesh-rpc — request/response calls over shared pub/sub.
//!
//! Nodes are anonymous to each other except for their opaque ids; a
//! call is a publish to the callee's request channel, and the response
//! comes back on the caller's result channel, matched by correlation
//! id. Peer liveness is probed by the publish itself: a delivery count
//! of zero means nobody is listening and the call fails immediately
//! with [`RpcError::NoSuchPeer`], leaving the dispatcher to decide
//! what happens next.
//!
//! # Channels
//!
//! ```text
//! RPC:{pool}:{node}          requests addressed to `node`
//! RPC:{pool}:{node}:result   responses to calls `node` initiated
//! ```

pub mod envelope;
pub mod error;
pub mod node;

pub use envelope::{decode_payload, Request, Response, UNDEFINED_SENTINEL};
pub use error::{RpcError, RpcResult};
pub use node::{RequestHandler, RpcNode, DEFAULT_CALL_TIMEOUT};
