//! Scheduler error types.

use thiserror::Error;

/// Result type alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur while matching, reserving, or creating jobs.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler (or a dispatcher in front of it) was shut down.
    #[error("scheduler is closed")]
    Closed,

    /// No job matched and the policy forbids creating one.
    #[error("no job matches the request")]
    NoMatch,

    #[error("requested seat count {requested} outside [{min}, {max}]")]
    BadSeatCount { requested: u32, min: u32, max: u32 },

    /// A reservation was attempted on a job with no free seat. Seat
    /// accounting should make this unreachable; it is surfaced for
    /// operators, not callers.
    #[error("job {job} has no free seat")]
    SeatUnavailable { job: String },

    /// A player arrived without a live reservation (e.g. after the
    /// hold timer released the seat).
    #[error("no reservation held for player {player} in job {job}")]
    NoReservation { job: String, player: String },

    #[error("workload creation failed: {0}")]
    Workload(#[source] anyhow::Error),
}
