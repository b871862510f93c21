//! Start-of-frame scheduling.
//!
//! The host must emit a SOF at the start of every (micro)frame while the bus is active, otherwise
//! full-speed devices enter suspend after 3 ms of idle. The [`FrameTimer`] only decides *when* a
//! marker is due; the [`TransactionEngine`](crate::transaction::TransactionEngine) transmits it
//! between packets, which bounds the delay caused by an in-flight transaction to one attempt.

use crate::time::{duration_micros, Instant};
use crate::Speed;
use core::time::Duration;

/// Full/low-speed frame period.
pub const FRAME_PERIOD: Duration = Duration::from_millis(1);

/// High-speed microframe period.
pub const MICROFRAME_PERIOD: Duration = Duration::from_micros(125);

/// Tracks frame timing and the 11-bit frame number.
#[derive(Clone, Debug)]
pub struct FrameTimer {
    running: bool,
    period: Duration,
    next_due: Instant,
    frame: u16,
    microframe: u8,
    high_speed: bool,
    emitted: u32,
}

impl FrameTimer {
    /// Creates a stopped timer.
    pub const fn new() -> FrameTimer {
        FrameTimer {
            running: false,
            period: FRAME_PERIOD,
            next_due: Instant::from_micros(0),
            frame: 0,
            microframe: 0,
            high_speed: false,
            emitted: 0,
        }
    }

    /// Starts generating frames at `speed`, with the first marker due immediately. The frame
    /// number carries on from where it stopped, so a resumed device sees no jump back to zero.
    pub fn start(&mut self, speed: Speed, now: Instant) {
        let high_speed = speed == Speed::High;
        if !high_speed {
            self.microframe = 0;
        }

        self.high_speed = high_speed;
        self.period = if high_speed {
            MICROFRAME_PERIOD
        } else {
            FRAME_PERIOD
        };
        self.next_due = now;
        self.emitted = 0;
        self.running = true;
    }

    /// Stops generating frames (bus reset, suspend or disconnect).
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Whether frames are being generated.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The length of one (micro)frame at the current speed.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of markers emitted since [`start`](FrameTimer::start). Unlike the frame number
    /// this restarts from zero.
    pub fn emitted(&self) -> u32 {
        self.emitted
    }

    /// The current 11-bit frame number.
    pub fn frame_number(&self) -> u16 {
        self.frame
    }

    /// If a marker is due at `now`, advances the schedule and returns the frame number to put in
    /// it. Markers missed by more than one period are coalesced into one carrying the number of
    /// the (micro)frame `now` falls in, so a long stall neither produces a burst of back-to-back
    /// markers nor lets the frame number fall behind the elapsed time.
    pub fn poll(&mut self, now: Instant) -> Option<u16> {
        if !self.running || now < self.next_due {
            return None;
        }

        let period = duration_micros(self.period).max(1);
        let missed = duration_micros(now - self.next_due) / period;

        self.advance(missed);
        let frame = self.frame;
        self.advance(1);

        self.next_due = self.next_due + Duration::from_micros((missed + 1) * period);
        self.emitted = self.emitted.wrapping_add(1);

        Some(frame)
    }

    fn advance(&mut self, periods: u64) {
        let frames = if self.high_speed {
            let microframes = self.microframe as u64 + periods;
            self.microframe = (microframes % 8) as u8;
            microframes / 8
        } else {
            periods
        };

        self.frame = ((self.frame as u64 + frames) & 0x07ff) as u16;
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        FrameTimer::new()
    }
}
