//! Time sources and one-shot timers.
//!
//! All scheduling in racestream (reconnect backoff, batch flushes) is
//! expressed as deadlines against a [`Clock`], so the state machines can be
//! driven by a [`ManualClock`] in tests and by [`SystemClock`] at runtime.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

/// A source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds.
    fn now_ms(&self) -> u64;
}

/// Shared, injectable clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at `start_ms`.
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Lifecycle of a one-shot [`Timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerState {
    /// Nothing scheduled.
    #[default]
    Idle,
    /// Will fire once the clock reaches `deadline_ms`.
    Scheduled {
        /// Absolute deadline in milliseconds.
        deadline_ms: u64,
    },
    /// Fired; behaves like `Idle` for scheduling purposes.
    Fired,
}

/// A cancellable one-shot timer driven by explicit polling.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    state: TimerState,
}

impl Timer {
    /// Create an idle timer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TimerState {
        self.state
    }

    /// Whether a deadline is pending.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        matches!(self.state, TimerState::Scheduled { .. })
    }

    /// The pending deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<u64> {
        match self.state {
            TimerState::Scheduled { deadline_ms } => Some(deadline_ms),
            TimerState::Idle | TimerState::Fired => None,
        }
    }

    /// Schedule the timer unless it is already pending.
    ///
    /// Returns `true` if a new deadline was set.
    pub fn schedule(&mut self, now_ms: u64, delay: Duration) -> bool {
        if self.is_scheduled() {
            return false;
        }
        self.reschedule(now_ms, delay);
        true
    }

    /// Schedule the timer, replacing any pending deadline.
    pub fn reschedule(&mut self, now_ms: u64, delay: Duration) {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.state = TimerState::Scheduled {
            deadline_ms: now_ms.saturating_add(delay_ms),
        };
    }

    /// Cancel a pending deadline. Returns `true` if one was pending.
    pub fn cancel(&mut self) -> bool {
        let was_scheduled = self.is_scheduled();
        self.state = TimerState::Idle;
        was_scheduled
    }

    /// Fire the timer if its deadline has passed.
    ///
    /// Returns `true` exactly once per scheduled deadline.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        match self.state {
            TimerState::Scheduled { deadline_ms } if now_ms >= deadline_ms => {
                self.state = TimerState::Fired;
                true
            }
            _ => false,
        }
    }
}
