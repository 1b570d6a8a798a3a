//! The workload contract.
//!
//! The domain workload (game room, session host, whatever owns the
//! live resources) stays outside this crate; the scheduler only needs
//! a factory that declares seat bounds and builds one workload per
//! job, and a terminate call that resolves when the job is drainable.
//! Everything else (player traffic, room rules, transport clients) is
//! the workload's business.

use std::sync::Arc;

use async_trait::async_trait;

use crate::job::JobHandle;

/// Seat-count bounds a workload class declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeatBounds {
    /// Capacity used when a request does not ask for a specific count.
    pub default: u32,
    pub min: u32,
    pub max: u32,
}

impl SeatBounds {
    /// Bounds admitting exactly one capacity.
    pub fn exact(seats: u32) -> Self {
        Self {
            default: seats,
            min: seats,
            max: seats,
        }
    }

    pub fn contains(&self, seats: u32) -> bool {
        seats >= self.min && seats <= self.max
    }
}

/// One running unit of work owned by a job.
///
/// The workload signals its natural end by emitting
/// [`crate::JobEvent::Ended`] on its job handle.
#[async_trait]
pub trait Workload: Send + Sync {
    /// Ask the workload to wind down; resolves when the job is
    /// drainable: its own end has fired or every occupant has left.
    ///
    /// [`JobHandle::drained`] implements exactly that wait for
    /// workloads with no extra teardown of their own.
    async fn terminate(&self);
}

/// Builds workloads for newly created jobs.
#[async_trait]
pub trait WorkloadFactory: Send + Sync {
    fn seat_bounds(&self) -> SeatBounds;

    /// Create the workload backing `job`. The handle is the
    /// workload's only channel back into the fabric.
    async fn create(&self, job: JobHandle) -> anyhow::Result<Arc<dyn Workload>>;
}
