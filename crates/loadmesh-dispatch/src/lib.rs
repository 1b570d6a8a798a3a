//! loadmesh-dispatch — the front door of a node.
//!
//! The dispatcher exposes `consume` to the local caller and routes
//! each request to the lowest-loaded node in the pool: itself when it
//! holds the minimum (ties always stay local), a peer over the RPC
//! transport otherwise. Any RPC failure (vanished peer, timeout,
//! remote handler error) falls back to the local consumer, logged but
//! never surfaced.
//!
//! [`Node`] assembles the whole stack for one process: id, RPC node,
//! load registry, scheduler, dispatcher. Components never hold each
//! other's internals; the node wires them with channels (the
//! scheduler's load watch feeds the registry's reporter, the RPC
//! request handler feeds the local consumer).
//!
//! # Architecture
//!
//! ```text
//! caller ─► Dispatcher
//!             ├── Consumer (local scheduler)        ◄── RPC handler
//!             ├── LoadRegistry (peer loads, online flag)
//!             └── RpcNode (calls to lower-loaded peers)
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod node;

pub use config::NodeConfig;
pub use dispatcher::{Consumer, Dispatcher};
pub use error::{DispatchError, DispatchResult};
pub use node::Node;
