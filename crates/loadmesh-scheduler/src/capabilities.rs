//! Capabilities composed onto jobs.
//!
//! A capability is a free-standing observer attached to a job at
//! creation time: it owns its own state, watches the job's event bus
//! (or polls it), and acts through the public [`JobHandle`] surface.
//! Composition is a list on the scheduler, not a subclass hierarchy.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::job::{JobEvent, JobHandle};

/// Default cadence of the idle reaper's occupancy poll.
pub const DEFAULT_AUTO_DESTROY_INTERVAL: Duration = Duration::from_secs(10);

/// A lifecycle observer attachable to any job.
pub trait JobCapability: Send + Sync {
    /// Spawn this capability's watcher for `job`.
    fn attach(&self, job: &JobHandle) -> JoinHandle<()>;
}

/// Emits [`JobEvent::Full`] once when occupants reach capacity, then
/// stops watching.
pub struct FullNotifier;

impl JobCapability for FullNotifier {
    fn attach(&self, job: &JobHandle) -> JoinHandle<()> {
        let job = job.clone();
        tokio::spawn(async move {
            let mut events = job.subscribe();
            loop {
                match events.recv().await {
                    Ok(JobEvent::Joined { .. }) => {
                        if job.occupant_count().await >= job.capacity() {
                            debug!(job = %job.name(), "job reached capacity");
                            job.notify_full();
                            break;
                        }
                    }
                    Ok(JobEvent::Ended) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                }
            }
        })
    }
}

/// Ends a job after two consecutive observations with no occupants and
/// no reservations.
///
/// Two observations are required so a job is not destroyed inside the
/// transient zero window between matching and arrival.
pub struct IdleReaper {
    pub interval: Duration,
}

impl Default for IdleReaper {
    fn default() -> Self {
        Self {
            interval: DEFAULT_AUTO_DESTROY_INTERVAL,
        }
    }
}

impl JobCapability for IdleReaper {
    fn attach(&self, job: &JobHandle) -> JoinHandle<()> {
        let job = job.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            let mut idle_streak = 0u32;
            loop {
                tokio::time::sleep(interval).await;
                if job.has_ended().await {
                    break;
                }
                let seated = job.occupant_count().await + job.reservation_count().await;
                if seated == 0 {
                    idle_streak += 1;
                    if idle_streak >= 2 {
                        debug!(job = %job.name(), "reaping idle job");
                        job.end().await;
                        break;
                    }
                } else {
                    idle_streak = 0;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const HOLD: Duration = Duration::from_secs(10);

    fn job(capacity: u32) -> JobHandle {
        JobHandle::new("testjob000".to_string(), capacity, HashMap::new())
    }

    async fn seat(job: &JobHandle, player: &str) {
        assert!(job.try_reserve(&[player.to_string()], HOLD).await);
        job.join(player).await.unwrap();
    }

    #[tokio::test]
    async fn full_notifier_fires_once_at_capacity() {
        let j = job(2);
        let mut events = j.subscribe();
        let watcher = FullNotifier.attach(&j);

        seat(&j, "p1").await;
        seat(&j, "p2").await;
        watcher.await.unwrap();

        // The watcher is gone; later churn back to capacity cannot
        // re-emit.
        j.leave("p2").await;
        seat(&j, "p3").await;

        let mut saw_full = 0;
        while let Ok(event) = events.try_recv() {
            if event == JobEvent::Full {
                saw_full += 1;
            }
        }
        assert_eq!(saw_full, 1);
    }

    #[tokio::test]
    async fn full_notifier_stops_on_ended() {
        let j = job(2);
        let watcher = FullNotifier.attach(&j);
        tokio::task::yield_now().await;
        j.end().await;
        watcher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_reaper_needs_two_consecutive_observations() {
        let j = job(2);
        let interval = Duration::from_secs(10);
        let watcher = IdleReaper { interval }.attach(&j);

        // First observation sees the job empty...
        tokio::time::advance(interval + Duration::from_millis(1)).await;
        assert!(!j.has_ended().await);

        // ...a reservation lands before the second: streak resets.
        assert!(j.try_reserve(&["p1".to_string()], Duration::from_secs(60)).await);
        tokio::time::advance(interval).await;
        assert!(!j.has_ended().await);

        // Seat clears; two more empty observations end the job.
        j.join("p1").await.unwrap();
        j.leave("p1").await;
        tokio::time::advance(interval).await;
        assert!(!j.has_ended().await);
        tokio::time::advance(interval).await;
        watcher.await.unwrap();
        assert!(j.has_ended().await);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_reaper_stops_when_job_ends_naturally() {
        let j = job(2);
        let interval = Duration::from_secs(10);
        let watcher = IdleReaper { interval }.attach(&j);

        j.end().await;
        tokio::time::advance(interval + Duration::from_millis(1)).await;
        watcher.await.unwrap();
    }
}
