//! loadmesh-store — the shared-datastore seam.
//!
//! Every other loadmesh crate talks to the datastore through the
//! [`Datastore`] trait: a key/value store with TTLs, suffix-glob key
//! listing, and pub/sub where `publish` reports how many subscribers
//! the message reached. Connection health is exposed as a `watch`
//! channel of [`ConnectionState`] so consumers can degrade to
//! local-only operation while the store is unreachable.
//!
//! [`MemoryStore`] is the in-process backend: it implements the full
//! contract (TTL expiry, delivery counting, dedicated subscription
//! receivers) and adds a test control to force offline/online
//! transitions. The whole test suite runs on it.

pub mod contract;
pub mod error;
pub mod memory;

pub use contract::{ConnectionState, Datastore, Subscription};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
