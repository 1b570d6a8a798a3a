//! Jobs: seats, reservations, and the per-job event bus.
//!
//! A [`JobHandle`] is the shared, cloneable face of one active job.
//! All seat state lives behind a single mutex, so a check-and-reserve
//! is atomic and the invariant `occupants + reservations <= capacity`
//! holds at every step. Reservations carry a unique token; the hold
//! timer only releases the exact reservation it was armed for, which
//! makes expiry idempotent and immune to reuse races.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

/// Capacity of each job's event bus. Subscribers that fall further
/// behind observe an overflow instead of silently losing order.
const EVENT_BUFFER: usize = 64;

/// Default reservation lifetime.
pub const DEFAULT_RESERVATION_HOLD: Duration = Duration::from_secs(10);

/// Everything observable about a job, on one bus.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Joined { player: String },
    Left { player: String },
    /// A hold timer released an unclaimed seat.
    ReservationExpired { player: String },
    /// Emitted by the [`crate::FullNotifier`] capability at capacity.
    Full,
    /// The job finished; it is drainable and will be removed.
    Ended,
    /// Domain traffic relayed by the workload.
    Custom {
        event_id: String,
        sender: String,
        payload: Value,
    },
}

struct Reservation {
    /// Guards the hold timer against releasing a successor
    /// reservation for the same player.
    token: String,
    expires_at: Instant,
}

struct JobState {
    open: bool,
    ended: bool,
    occupants: HashSet<String>,
    reservations: HashMap<String, Reservation>,
}

struct JobInner {
    name: String,
    capacity: u32,
    properties: HashMap<String, Value>,
    state: Mutex<JobState>,
    events: broadcast::Sender<JobEvent>,
}

/// Shared handle to one active job.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<JobInner>,
}

impl JobHandle {
    pub fn new(name: String, capacity: u32, properties: HashMap<String, Value>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(JobInner {
                name,
                capacity,
                properties,
                state: Mutex::new(JobState {
                    open: true,
                    ended: false,
                    occupants: HashSet::new(),
                    reservations: HashMap::new(),
                }),
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Static properties the job was created with; match criteria are
    /// evaluated against these.
    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.inner.properties
    }

    pub async fn is_open(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.open && !state.ended
    }

    pub async fn has_ended(&self) -> bool {
        self.inner.state.lock().await.ended
    }

    /// Open or close the job for matching. Ending is separate and
    /// one-way.
    pub async fn set_open(&self, open: bool) {
        self.inner.state.lock().await.open = open;
    }

    pub async fn occupant_count(&self) -> u32 {
        self.inner.state.lock().await.occupants.len() as u32
    }

    pub async fn reservation_count(&self) -> u32 {
        self.inner.state.lock().await.reservations.len() as u32
    }

    /// When `player`'s reservation lapses, if one is held.
    pub async fn reservation_deadline(&self, player: &str) -> Option<Instant> {
        self.inner
            .state
            .lock()
            .await
            .reservations
            .get(player)
            .map(|r| r.expires_at)
    }

    /// Seats neither occupied nor held by a reservation.
    pub async fn free_seats(&self) -> u32 {
        let state = self.inner.state.lock().await;
        free_in(&state, self.inner.capacity)
    }

    /// Atomically reserve seats for all `players`, or none of them.
    ///
    /// Returns `false` when the job is closed, a player is already
    /// seated or holding a reservation, or there is not enough room.
    /// Hold timers are armed after the seats are accounted.
    pub async fn try_reserve(&self, players: &[String], hold: Duration) -> bool {
        let mut armed = Vec::with_capacity(players.len());
        {
            let mut state = self.inner.state.lock().await;
            if !state.open || state.ended {
                return false;
            }
            if free_in(&state, self.inner.capacity) < players.len() as u32 {
                return false;
            }
            if players
                .iter()
                .any(|p| state.occupants.contains(p) || state.reservations.contains_key(p))
            {
                return false;
            }

            let expires_at = Instant::now() + hold;
            for player in players {
                let token = loadmesh_id::random_id(loadmesh_id::DEFAULT_ID_LEN);
                state.reservations.insert(
                    player.clone(),
                    Reservation {
                        token: token.clone(),
                        expires_at,
                    },
                );
                armed.push((player.clone(), token));
            }
        }
        for (player, token) in armed {
            self.arm_hold_timer(player, token, hold);
        }
        true
    }

    /// Reserve a single seat; [`SchedulerError::SeatUnavailable`] when
    /// the job cannot take it.
    pub async fn reserve(&self, player: &str, hold: Duration) -> SchedulerResult<()> {
        let players = [player.to_string()];
        if self.try_reserve(&players, hold).await {
            Ok(())
        } else {
            Err(SchedulerError::SeatUnavailable {
                job: self.inner.name.clone(),
            })
        }
    }

    /// A player arrives: consume their reservation and seat them.
    pub async fn join(&self, player: &str) -> SchedulerResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            if state.ended {
                return Err(SchedulerError::Closed);
            }
            if state.reservations.remove(player).is_none() {
                return Err(SchedulerError::NoReservation {
                    job: self.inner.name.clone(),
                    player: player.to_string(),
                });
            }
            state.occupants.insert(player.to_string());
        }
        let _ = self.inner.events.send(JobEvent::Joined {
            player: player.to_string(),
        });
        Ok(())
    }

    /// A player departs. Returns whether they were seated.
    pub async fn leave(&self, player: &str) -> bool {
        let removed = self.inner.state.lock().await.occupants.remove(player);
        if removed {
            let _ = self.inner.events.send(JobEvent::Left {
                player: player.to_string(),
            });
        }
        removed
    }

    /// Mark the job finished and announce it. Idempotent.
    pub async fn end(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.ended {
                return;
            }
            state.ended = true;
            state.open = false;
        }
        debug!(job = %self.inner.name, "job ended");
        let _ = self.inner.events.send(JobEvent::Ended);
    }

    /// Announce that the job reached capacity (used by the
    /// [`crate::FullNotifier`] capability).
    pub fn notify_full(&self) {
        let _ = self.inner.events.send(JobEvent::Full);
    }

    /// Relay a domain event onto the job's bus.
    pub fn emit_custom(&self, event_id: &str, sender: &str, payload: Value) {
        let _ = self.inner.events.send(JobEvent::Custom {
            event_id: event_id.to_string(),
            sender: sender.to_string(),
            payload,
        });
    }

    /// Raw subscription to every job event.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Filtered subscription over the job's custom events.
    ///
    /// Absent filter fields mean "any"; `timeout` bounds the whole
    /// subscription, after which the stream only yields
    /// [`EventStreamError::TimedOut`].
    pub fn subscribe_filtered(
        &self,
        filter: EventFilter,
        timeout: Option<Duration>,
    ) -> FilteredEvents {
        FilteredEvents {
            rx: self.inner.events.subscribe(),
            filter,
            deadline: timeout.map(|d| Instant::now() + d),
        }
    }

    /// Resolve when the job is drainable: it has ended, or no
    /// occupants remain.
    pub async fn drained(&self) {
        let mut events = self.subscribe();
        loop {
            {
                let state = self.inner.state.lock().await;
                if state.ended || state.occupants.is_empty() {
                    return;
                }
            }
            match events.recv().await {
                Ok(JobEvent::Ended) => return,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    fn arm_hold_timer(&self, player: String, token: String, hold: Duration) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            let expired = {
                let mut state = inner.state.lock().await;
                match state.reservations.get(&player) {
                    Some(r) if r.token == token => {
                        state.reservations.remove(&player);
                        true
                    }
                    // Consumed by a join or superseded by a newer
                    // reservation; nothing to release.
                    _ => false,
                }
            };
            if expired {
                debug!(job = %inner.name, %player, "reservation expired");
                let _ = inner.events.send(JobEvent::ReservationExpired { player });
            }
        });
    }
}

fn free_in(state: &JobState, capacity: u32) -> u32 {
    capacity.saturating_sub(state.occupants.len() as u32 + state.reservations.len() as u32)
}

/// Filter over custom events; `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_id: Option<String>,
    pub sender: Option<String>,
}

impl EventFilter {
    fn matches(&self, event: &JobEvent) -> bool {
        match event {
            JobEvent::Custom {
                event_id, sender, ..
            } => {
                self.event_id
                    .as_deref()
                    .map_or(true, |want| want == event_id.as_str())
                    && self
                        .sender
                        .as_deref()
                        .map_or(true, |want| want == sender.as_str())
            }
            _ => false,
        }
    }
}

/// Terminal conditions of a filtered event stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventStreamError {
    /// The subscriber fell behind; the count is how many events were
    /// dropped.
    #[error("event stream overflowed, {0} events dropped")]
    Overflow(u64),

    #[error("subscription timed out")]
    TimedOut,

    #[error("event stream closed")]
    Closed,
}

/// A bounded, filtered view of a job's custom events.
pub struct FilteredEvents {
    rx: broadcast::Receiver<JobEvent>,
    filter: EventFilter,
    deadline: Option<Instant>,
}

impl FilteredEvents {
    /// Next matching event, or the stream's terminal condition.
    pub async fn next(&mut self) -> Result<JobEvent, EventStreamError> {
        loop {
            let received = match self.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => return Err(EventStreamError::TimedOut),
                },
                None => self.rx.recv().await,
            };
            match received {
                Ok(event) if self.filter.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(EventStreamError::Overflow(n))
                }
                Err(broadcast::error::RecvError::Closed) => return Err(EventStreamError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HOLD: Duration = Duration::from_secs(10);

    fn job(capacity: u32) -> JobHandle {
        JobHandle::new("testjob000".to_string(), capacity, HashMap::new())
    }

    fn players(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn reserve_then_join_consumes_the_hold() {
        let j = job(2);
        assert!(j.try_reserve(&players(&["p1"]), HOLD).await);
        assert_eq!(j.reservation_count().await, 1);
        assert_eq!(j.free_seats().await, 1);
        assert!(j.reservation_deadline("p1").await.is_some());

        j.join("p1").await.unwrap();
        assert_eq!(j.reservation_count().await, 0);
        assert_eq!(j.occupant_count().await, 1);
        assert_eq!(j.free_seats().await, 1);
    }

    #[tokio::test]
    async fn seat_accounting_never_exceeds_capacity() {
        let j = job(3);
        assert!(j.try_reserve(&players(&["p1", "p2"]), HOLD).await);
        j.join("p1").await.unwrap();

        // One occupant + one reservation; only one seat left.
        assert!(!j.try_reserve(&players(&["p3", "p4"]), HOLD).await);
        assert!(j.try_reserve(&players(&["p3"]), HOLD).await);
        assert_eq!(j.free_seats().await, 0);
        assert!(!j.try_reserve(&players(&["p5"]), HOLD).await);
    }

    #[tokio::test]
    async fn group_reservation_is_all_or_nothing() {
        let j = job(2);
        assert!(!j.try_reserve(&players(&["p1", "p2", "p3"]), HOLD).await);
        assert_eq!(j.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_player_cannot_double_book() {
        let j = job(4);
        assert!(j.try_reserve(&players(&["p1"]), HOLD).await);
        assert!(!j.try_reserve(&players(&["p1"]), HOLD).await);

        j.join("p1").await.unwrap();
        assert!(!j.try_reserve(&players(&["p1"]), HOLD).await);
    }

    #[tokio::test]
    async fn closed_job_rejects_reservations() {
        let j = job(2);
        j.set_open(false).await;
        assert!(!j.try_reserve(&players(&["p1"]), HOLD).await);

        j.set_open(true).await;
        j.end().await;
        assert!(!j.try_reserve(&players(&["p1"]), HOLD).await);
    }

    #[tokio::test(start_paused = true)]
    async fn hold_timer_releases_the_seat() {
        let j = job(1);
        let mut events = j.subscribe();
        assert!(j.try_reserve(&players(&["p1"]), HOLD).await);

        tokio::time::advance(HOLD + Duration::from_millis(1)).await;
        assert_eq!(j.reservation_count().await, 0);
        assert_eq!(j.free_seats().await, 1);
        assert_eq!(
            events.recv().await.unwrap(),
            JobEvent::ReservationExpired {
                player: "p1".to_string()
            }
        );

        // Late arrival must not silently re-occupy the released seat.
        let err = j.join("p1").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoReservation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn join_before_expiry_defuses_the_timer() {
        let j = job(1);
        assert!(j.try_reserve(&players(&["p1"]), HOLD).await);
        tokio::time::advance(Duration::from_secs(5)).await;
        j.join("p1").await.unwrap();

        tokio::time::advance(HOLD).await;
        assert_eq!(j.occupant_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_cannot_release_a_successor_reservation() {
        let j = job(1);
        assert!(j.try_reserve(&players(&["p1"]), HOLD).await);
        tokio::time::advance(Duration::from_secs(2)).await;
        j.join("p1").await.unwrap();
        j.leave("p1").await;

        // New reservation for the same player; the first timer fires
        // at t=10s and must not touch it.
        assert!(j.try_reserve(&players(&["p1"]), HOLD).await);
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(j.reservation_count().await, 1);

        // Its own timer releases it at t=12s.
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(j.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn end_is_idempotent_and_emits_once() {
        let j = job(2);
        let mut events = j.subscribe();
        j.end().await;
        j.end().await;

        assert_eq!(events.recv().await.unwrap(), JobEvent::Ended);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn filtered_subscription_selects_custom_events() {
        let j = job(2);
        let mut stream = j.subscribe_filtered(
            EventFilter {
                event_id: Some("chat".to_string()),
                sender: None,
            },
            None,
        );

        j.emit_custom("move", "p1", json!({"x": 1}));
        j.emit_custom("chat", "p2", json!("hello"));

        let event = stream.next().await.unwrap();
        assert_eq!(
            event,
            JobEvent::Custom {
                event_id: "chat".to_string(),
                sender: "p2".to_string(),
                payload: json!("hello"),
            }
        );
    }

    #[tokio::test]
    async fn filtered_subscription_ignores_lifecycle_events() {
        let j = job(2);
        let mut stream = j.subscribe_filtered(EventFilter::default(), None);

        assert!(j.try_reserve(&players(&["p1"]), HOLD).await);
        j.join("p1").await.unwrap();
        j.emit_custom("ping", "p1", Value::Null);

        let event = stream.next().await.unwrap();
        assert!(matches!(event, JobEvent::Custom { event_id, .. } if event_id == "ping"));
    }

    #[tokio::test]
    async fn filtered_subscription_filters_by_sender() {
        let j = job(2);
        let mut stream = j.subscribe_filtered(
            EventFilter {
                event_id: None,
                sender: Some("p2".to_string()),
            },
            None,
        );

        j.emit_custom("chat", "p1", json!("not this one"));
        j.emit_custom("chat", "p2", json!("this one"));

        let event = stream.next().await.unwrap();
        assert!(matches!(event, JobEvent::Custom { sender, .. } if sender == "p2"));
    }

    #[tokio::test(start_paused = true)]
    async fn filtered_subscription_times_out() {
        let j = job(2);
        let mut stream =
            j.subscribe_filtered(EventFilter::default(), Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(stream.next().await.unwrap_err(), EventStreamError::TimedOut);
        // The stream stays cancelled.
        assert_eq!(stream.next().await.unwrap_err(), EventStreamError::TimedOut);
    }

    #[tokio::test]
    async fn overflow_is_signalled_not_silent() {
        let j = job(2);
        let mut stream = j.subscribe_filtered(EventFilter::default(), None);

        for i in 0..(EVENT_BUFFER + 8) {
            j.emit_custom("flood", "p1", json!(i));
        }
        assert!(matches!(
            stream.next().await,
            Err(EventStreamError::Overflow(_))
        ));
    }

    #[tokio::test]
    async fn drained_resolves_when_last_occupant_leaves() {
        let j = job(2);
        assert!(j.try_reserve(&players(&["p1"]), HOLD).await);
        j.join("p1").await.unwrap();

        let waiter = {
            let j = j.clone();
            tokio::spawn(async move { j.drained().await })
        };
        tokio::task::yield_now().await;
        j.leave("p1").await;
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn drained_resolves_on_end() {
        let j = job(2);
        assert!(j.try_reserve(&players(&["p1"]), HOLD).await);
        j.join("p1").await.unwrap();

        let waiter = {
            let j = j.clone();
            tokio::spawn(async move { j.drained().await })
        };
        tokio::task::yield_now().await;
        j.end().await;
        waiter.await.unwrap();
    }
}
