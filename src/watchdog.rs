//! Enumeration progress watchdog.
//!
//! The watchdog is the one recovery path for every failure the enumerator does not handle
//! itself: whenever enumeration stops making progress for longer than the interval, the host
//! forces it back to the start and resets the bus.
//!
//! The watchdog only uses atomics, so it can live in a `static` and be ticked from a timer
//! interrupt while the host is polled from the main loop.

use crate::enumerator::EnumerationState;
use crate::time::{duration_micros, Instant};
use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};

/// Interval used by [`Watchdog::new`].
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

// Set in `state` while armed. The remaining bits hold the deadline in microseconds.
const ARMED: u64 = 1 << 63;

/// A progress timer for the enumerator.
pub struct Watchdog {
    interval: AtomicU64,
    // Deadline and armed flag in one word, so that a tick racing a feed sees either the old
    // deadline and fails to disarm, or the new one.
    state: AtomicU64,
    fired: AtomicBool,
}

impl Watchdog {
    /// Creates a disarmed watchdog with the default interval.
    pub const fn new() -> Watchdog {
        Watchdog {
            interval: AtomicU64::new(DEFAULT_INTERVAL.as_secs() * 1_000_000),
            state: AtomicU64::new(0),
            fired: AtomicBool::new(false),
        }
    }

    /// Gets the interval.
    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.interval.load(Ordering::Relaxed))
    }

    /// Sets the interval. Takes effect the next time the watchdog is fed.
    pub fn set_interval(&self, interval: Duration) {
        self.interval
            .store(duration_micros(interval), Ordering::Relaxed);
    }

    /// Whether the watchdog is armed.
    pub fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) & ARMED != 0
    }

    /// When the watchdog fires unless fed, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        let state = self.state.load(Ordering::Acquire);

        if state & ARMED != 0 {
            Some(Instant::from_micros(state & !ARMED))
        } else {
            None
        }
    }

    fn armed_state(&self, now: Instant) -> u64 {
        let deadline = now.as_micros().saturating_add(self.interval.load(Ordering::Relaxed));
        ARMED | deadline.min(!ARMED)
    }

    /// Restarts the interval from `now` and arms the watchdog.
    pub fn feed(&self, now: Instant) {
        self.state.store(self.armed_state(now), Ordering::Release);
    }

    /// Arms the watchdog if it is not armed already. An armed watchdog keeps its deadline.
    pub fn arm(&self, now: Instant) {
        let _ = self.state.compare_exchange(
            0,
            self.armed_state(now),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Disarms the watchdog.
    pub fn disarm(&self) {
        self.state.store(0, Ordering::Release);
    }

    /// Checks the deadline. Returns true, and latches the fired flag, the first time it is found
    /// to have passed. May be called from an interrupt handler.
    ///
    /// The watchdog is only disarmed if it still holds the deadline that was checked, so a feed
    /// that lands in between always wins.
    pub fn tick(&self, now: Instant) -> bool {
        let state = self.state.load(Ordering::Acquire);

        if state & ARMED == 0 || now.as_micros() < state & !ARMED {
            return false;
        }

        if self
            .state
            .compare_exchange(state, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.fired.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Returns and clears the fired flag.
    pub fn take_fired(&self) -> bool {
        self.fired.swap(false, Ordering::AcqRel)
    }

    /// Updates the watchdog for an enumerator transition from `prev` to `next`.
    ///
    /// Idle, reset and the configured state need no supervision. Any forward transition restarts
    /// the interval. Falling back or into [`Failed`](EnumerationState::Failed) does not, so a
    /// device that keeps failing is reset one interval after its last real progress.
    pub fn observe(&self, prev: EnumerationState, next: EnumerationState, now: Instant) {
        match next {
            EnumerationState::Idle | EnumerationState::AwaitReset | EnumerationState::Ready => {
                self.disarm()
            }
            _ if next.is_progress_from(prev) => self.feed(now),
            _ => self.arm(now),
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Watchdog::new()
    }
}
