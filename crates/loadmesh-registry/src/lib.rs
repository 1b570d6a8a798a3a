//! loadmesh-registry — approximate knowledge of every peer's load.
//!
//! Each node writes its own load under a TTL'd key and reads everyone
//! else's back with a throttled list+multi-get. Readings are allowed
//! to be stale: the TTL evicts nodes that stopped reporting, and the
//! one-second throttles bound datastore traffic no matter how fast the
//! consumer's load changes.
//!
//! # Key layout
//!
//! ```text
//! RDB:{pool}:{node} = <decimal load>   (TTL = report interval)
//! ```

pub mod error;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::{LoadRegistry, FETCH_THROTTLE, REPORT_THROTTLE};
