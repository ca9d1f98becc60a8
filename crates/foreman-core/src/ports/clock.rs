//! Clock port.
//!
//! The core never reads a real clock or starts a real timer directly; every
//! `now`, tick and deadline goes through this trait so tests can substitute
//! a virtual clock.
//!
//! Implementations:
//! - **TokioClock**: production. Under a paused tokio test runtime the whole
//!   dispatcher runs on virtual time with no further wiring.
//! - **ManualClock**: explicit virtual clock; time moves only via
//!   [`ManualClock::advance`].

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Monotonic "now" plus delayed wakeups.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic now, used for scheduling and interval math.
    fn now(&self) -> Instant;

    /// Wall-clock now, used only at logging/metadata boundaries.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Resolve after `duration` of clock time has passed.
    async fn sleep(&self, duration: Duration);

    /// Resolve once the clock reaches `deadline`.
    async fn sleep_until(&self, deadline: Instant);

    /// Reconstruct the wall time of a monotonic instant.
    fn wall_time(&self, at: Instant) -> DateTime<Utc> {
        let now = self.now();
        if at <= now {
            self.now_utc() - chrono::Duration::from_std(now - at).unwrap_or_default()
        } else {
            self.now_utc() + chrono::Duration::from_std(at - now).unwrap_or_default()
        }
    }
}

/// Production clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

struct Sleeper {
    due: Duration,
    tx: oneshot::Sender<()>,
}

struct ManualState {
    elapsed: Duration,
    sleepers: Vec<Sleeper>,
}

/// Virtual clock for deterministic tests.
///
/// `now()` is a fixed base instant plus the accumulated offset; sleepers are
/// parked on oneshot channels and released by [`advance`](Self::advance).
/// A dropped sleep future just leaves a dead sender behind, which is ignored.
pub struct ManualClock {
    base: Instant,
    base_utc: DateTime<Utc>,
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            base_utc: Utc::now(),
            state: Mutex::new(ManualState {
                elapsed: Duration::ZERO,
                sleepers: Vec::new(),
            }),
        }
    }

    /// Move the clock forward, waking every sleeper whose deadline passed.
    pub fn advance(&self, duration: Duration) {
        let fired: Vec<Sleeper> = {
            let mut state = self.state.lock().unwrap();
            state.elapsed += duration;
            let elapsed = state.elapsed;

            let (due, keep): (Vec<Sleeper>, Vec<Sleeper>) = state
                .sleepers
                .drain(..)
                .partition(|sleeper| sleeper.due <= elapsed);
            state.sleepers = keep;
            due
        };

        // Wake outside the lock.
        for sleeper in fired {
            let _ = sleeper.tx.send(());
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.state.lock().unwrap().elapsed
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let elapsed = self.state.lock().unwrap().elapsed;
        self.base_utc + chrono::Duration::from_std(elapsed).unwrap_or_default()
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let rx = {
            let mut state = self.state.lock().unwrap();
            let due = state.elapsed + duration;
            let (tx, rx) = oneshot::channel();
            state.sleepers.push(Sleeper { due, tx });
            rx
        };
        let _ = rx.await;
    }

    async fn sleep_until(&self, deadline: Instant) {
        let rx = {
            let mut state = self.state.lock().unwrap();
            let due = deadline.saturating_duration_since(self.base);
            if due <= state.elapsed {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.sleepers.push(Sleeper { due, tx });
            rx
        };
        let _ = rx.await;
    }
}
