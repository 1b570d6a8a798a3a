//! The scheduler: match requests to jobs, create under a budget,
//! drain on close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::capabilities::JobCapability;
use crate::error::{SchedulerError, SchedulerResult};
use crate::job::{JobEvent, JobHandle, DEFAULT_RESERVATION_HOLD};
use crate::workload::{Workload, WorkloadFactory};

/// How a request that matches no existing job is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreatePolicy {
    /// Create a new job, gated by the concurrency budget.
    #[default]
    AutoCreate,
    /// Fail the request with [`SchedulerError::NoMatch`].
    Deny,
}

/// Scheduler tuning; defaults match the fabric-wide documented values.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrent job-creation operations.
    pub concurrency: usize,
    /// Reservation lifetime between match and arrival.
    pub reservation_hold: Duration,
    pub create_policy: CreatePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            reservation_hold: DEFAULT_RESERVATION_HOLD,
            create_policy: CreatePolicy::AutoCreate,
        }
    }
}

/// A work request: seat these players somewhere suitable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRequest {
    pub players: Vec<String>,
    /// Property constraints a job must satisfy; also become the
    /// properties of a job created for this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<HashMap<String, Value>>,
    /// Requested capacity for a created job; the workload default
    /// applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seats: Option<u32>,
}

/// The answer: which room the players hold seats in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResponse {
    pub room: String,
}

struct ActiveJob {
    handle: JobHandle,
    workload: Arc<dyn Workload>,
    watcher: JoinHandle<()>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    factory: Arc<dyn WorkloadFactory>,
    capabilities: Vec<Arc<dyn JobCapability>>,
    /// Active jobs in insertion order; matching is first-fit.
    jobs: RwLock<Vec<ActiveJob>>,
    /// Reported load = active job count. Re-signalled on every job-set
    /// or occupancy change so reporters see bursts to coalesce.
    load_tx: watch::Sender<u64>,
    create_gate: Semaphore,
    closed: AtomicBool,
}

/// The node-local consumer; cheap to clone, all clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Build a scheduler over `factory`, attaching each capability in
    /// `capabilities` to every job it creates.
    pub fn new(
        config: SchedulerConfig,
        factory: Arc<dyn WorkloadFactory>,
        capabilities: Vec<Arc<dyn JobCapability>>,
    ) -> Self {
        let (load_tx, _) = watch::channel(0);
        let create_gate = Semaphore::new(config.concurrency);
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                factory,
                capabilities,
                jobs: RwLock::new(Vec::new()),
                load_tx,
                create_gate,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Current load: the number of active jobs.
    pub fn load(&self) -> u64 {
        *self.inner.load_tx.borrow()
    }

    /// Observe load changes; signalled on every job-set or seat
    /// occupancy change.
    pub fn load_watch(&self) -> watch::Receiver<u64> {
        self.inner.load_tx.subscribe()
    }

    /// Handle a work request: seat the players in the first fitting
    /// job, or create one when the policy allows.
    pub async fn consume(&self, request: MatchRequest) -> SchedulerResult<MatchResponse> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Closed);
        }
        let bounds = self.inner.factory.seat_bounds();
        if request.players.is_empty() {
            return Err(SchedulerError::BadSeatCount {
                requested: 0,
                min: 1.max(bounds.min),
                max: bounds.max,
            });
        }

        if let Some(room) = self.try_match(&request).await {
            self.resignal_load().await;
            return Ok(MatchResponse { room });
        }

        match self.inner.config.create_policy {
            CreatePolicy::Deny => Err(SchedulerError::NoMatch),
            CreatePolicy::AutoCreate => self.create_and_reserve(request).await,
        }
    }

    /// Look up an active job by room name.
    pub async fn job(&self, room: &str) -> Option<JobHandle> {
        let jobs = self.inner.jobs.read().await;
        jobs.iter()
            .find(|j| j.handle.name() == room)
            .map(|j| j.handle.clone())
    }

    /// Room names of all active jobs, in insertion order.
    pub async fn rooms(&self) -> Vec<String> {
        let jobs = self.inner.jobs.read().await;
        jobs.iter().map(|j| j.handle.name().to_string()).collect()
    }

    /// Refuse new work and drain: every job is terminated and the
    /// future resolves once all of them have ended or emptied out.
    pub async fn close(&self) -> SchedulerResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::Closed);
        }

        let jobs: Vec<ActiveJob> = {
            let mut jobs = self.inner.jobs.write().await;
            jobs.drain(..).collect()
        };
        info!(draining = jobs.len(), "scheduler closing");

        let mut drains = JoinSet::new();
        for job in jobs {
            job.watcher.abort();
            drains.spawn(async move {
                job.workload.terminate().await;
                job.handle.end().await;
            });
        }
        while drains.join_next().await.is_some() {}

        let _ = self.inner.load_tx.send(0);
        info!("scheduler drained");
        Ok(())
    }

    /// First-fit scan over active jobs; reserves on success.
    async fn try_match(&self, request: &MatchRequest) -> Option<String> {
        let jobs = self.inner.jobs.read().await;
        for job in jobs.iter() {
            if !criteria_match(job.handle.properties(), request.criteria.as_ref()) {
                continue;
            }
            if job
                .handle
                .try_reserve(&request.players, self.inner.config.reservation_hold)
                .await
            {
                debug!(
                    room = %job.handle.name(),
                    players = request.players.len(),
                    "matched existing job"
                );
                return Some(job.handle.name().to_string());
            }
        }
        None
    }

    async fn create_and_reserve(&self, request: MatchRequest) -> SchedulerResult<MatchResponse> {
        let bounds = self.inner.factory.seat_bounds();
        let seats = request.seats.unwrap_or(bounds.default);
        if !bounds.contains(seats) || (request.players.len() as u32) > seats {
            return Err(SchedulerError::BadSeatCount {
                requested: seats,
                min: bounds.min,
                max: bounds.max,
            });
        }

        let _permit = self
            .inner
            .create_gate
            .acquire()
            .await
            .map_err(|_| SchedulerError::Closed)?;

        // The wait for a permit may have outlasted a close, or a
        // concurrent creation may already fit this request.
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Closed);
        }
        if let Some(room) = self.try_match(&request).await {
            self.resignal_load().await;
            return Ok(MatchResponse { room });
        }

        let room = loadmesh_id::job_name();
        let properties = request.criteria.clone().unwrap_or_default();
        let handle = JobHandle::new(room.clone(), seats, properties);
        let workload = self
            .inner
            .factory
            .create(handle.clone())
            .await
            .map_err(SchedulerError::Workload)?;

        for capability in &self.inner.capabilities {
            let _ = capability.attach(&handle);
        }

        // Seats are reserved before the job is registered, so the next
        // load report never advertises room that is already promised.
        if !handle
            .try_reserve(&request.players, self.inner.config.reservation_hold)
            .await
        {
            warn!(%room, "fresh job rejected its first reservation");
            return Err(SchedulerError::SeatUnavailable { job: room });
        }

        let watcher = tokio::spawn(watch_job(
            self.clone(),
            handle.clone(),
            Arc::clone(&workload),
        ));
        {
            let mut jobs = self.inner.jobs.write().await;
            jobs.push(ActiveJob {
                handle,
                workload,
                watcher,
            });
            let _ = self.inner.load_tx.send(jobs.len() as u64);
        }

        info!(%room, seats, "created job");
        Ok(MatchResponse { room })
    }

    async fn remove_job(&self, room: &str) {
        let mut jobs = self.inner.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|j| j.handle.name() != room);
        if jobs.len() != before {
            info!(%room, remaining = jobs.len(), "job removed");
            let _ = self.inner.load_tx.send(jobs.len() as u64);
        }
    }

    /// Re-announce the current load after an occupancy change.
    async fn resignal_load(&self) {
        let jobs = self.inner.jobs.read().await;
        let _ = self.inner.load_tx.send(jobs.len() as u64);
    }
}

/// Per-job watcher: turns job events into scheduler bookkeeping.
async fn watch_job(scheduler: Scheduler, handle: JobHandle, workload: Arc<dyn Workload>) {
    let mut events = handle.subscribe();
    loop {
        match events.recv().await {
            Ok(JobEvent::Ended) => {
                scheduler.remove_job(handle.name()).await;
                workload.terminate().await;
                break;
            }
            Ok(
                JobEvent::Joined { .. }
                | JobEvent::Left { .. }
                | JobEvent::ReservationExpired { .. },
            ) => {
                scheduler.resignal_load().await;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

fn criteria_match(
    properties: &HashMap<String, Value>,
    criteria: Option<&HashMap<String, Value>>,
) -> bool {
    match criteria {
        None => true,
        Some(wanted) => wanted
            .iter()
            .all(|(key, value)| properties.get(key) == Some(value)),
    }
}
