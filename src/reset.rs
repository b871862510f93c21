//! Bus reset and speed negotiation.
//!
//! A reset is a sequence spread over many [`poll`](ResetController::poll) calls:
//!
//! 1. Wait for a device to attach (J or K idle for the debounce interval).
//! 2. Drive SE0. A high-speed capable device answers with a chirp K of at least 1 ms.
//! 3. If a chirp K was seen, answer with alternating K/J chirps until the reset interval ends; the
//!    device switches to high-speed once it has seen three K/J pairs.
//! 4. Release the bus and report the negotiated speed.

use crate::phy::{BusDrive, LineState, UsbPhy};
use crate::session::Session;
use crate::time::Instant;
use crate::{Result, Speed, UsbError};
use core::time::Duration;

/// Bus state as seen by the host.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusState {
    /// Nothing attached, or attach not yet debounced.
    Disconnected,
    /// Host is driving bus reset.
    Resetting,
    /// Device chirp seen, high-speed handshake in progress.
    SpeedDetect,
    /// Reset complete, bus operating at the given speed.
    Idle(Speed),
    /// No start-of-frame markers are sent, the device is suspended.
    Suspended,
}

/// Timing parameters of the reset sequence. The defaults follow USB 2.0 section 7.1.7; tests may
/// shrink them to shorten simulated time.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ResetTiming {
    /// A connect must be stable for this long before reset starts (TATTDB).
    pub attach_debounce: Duration,

    /// Give up waiting for a connect after this long.
    pub attach_timeout: Duration,

    /// Total time the bus is held in reset, including the chirp handshake (TDRSTR).
    pub reset_duration: Duration,

    /// A device chirp K must be held at least this long to count (TFILT).
    pub chirp_filter: Duration,

    /// A device chirp K starting later than this into the reset is ignored.
    pub chirp_window: Duration,

    /// Length of each host K or J chirp.
    pub host_chirp_step: Duration,

    /// How long resume K is driven before the bus returns to idle (TDRSMDN).
    pub resume_duration: Duration,
}

impl ResetTiming {
    /// Timing per the USB 2.0 specification for a root port.
    pub const fn standard() -> ResetTiming {
        ResetTiming {
            attach_debounce: Duration::from_millis(100),
            attach_timeout: Duration::from_millis(500),
            reset_duration: Duration::from_millis(50),
            chirp_filter: Duration::from_micros(3),
            chirp_window: Duration::from_millis(7),
            host_chirp_step: Duration::from_micros(50),
            resume_duration: Duration::from_millis(20),
        }
    }
}

impl Default for ResetTiming {
    fn default() -> Self {
        ResetTiming::standard()
    }
}

/// Result of a completed reset or resume sequence.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResetOutcome {
    /// Reset completed and the device operates at this speed.
    Speed(Speed),
    /// No device attached within the attach timeout.
    NoDevice,
    /// Resume signalling completed and the bus is active again.
    Resumed,
}

#[derive(Copy, Clone, Debug)]
enum Phase {
    Idle,
    AwaitAttach {
        since: Instant,
        stable: Option<(LineState, Instant)>,
    },
    Reset {
        started: Instant,
        low_speed: bool,
        k_since: Option<Instant>,
        chirp_seen: bool,
    },
    HostChirp {
        started: Instant,
        next_step: Instant,
        k: bool,
    },
    Resume {
        until: Instant,
        speed: Speed,
    },
}

/// Drives bus reset, the high-speed chirp handshake and suspend/resume.
pub struct ResetController {
    timing: ResetTiming,
    phase: Phase,
    suspended_speed: Option<Speed>,
}

impl ResetController {
    /// Creates an idle controller.
    pub fn new(timing: ResetTiming) -> ResetController {
        ResetController {
            timing,
            phase: Phase::Idle,
            suspended_speed: None,
        }
    }

    /// Gets the timing parameters.
    pub fn timing(&self) -> &ResetTiming {
        &self.timing
    }

    /// Whether a reset or resume sequence is in progress.
    pub fn is_busy(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }

    /// Starts a bus reset. Starts a new session in `session`, so that anything still referring to
    /// the previous one is recognised as stale.
    ///
    /// Calling this while a reset is already in progress does nothing and returns `false`; the
    /// reset in progress keeps its original timing.
    pub fn reset<P: UsbPhy + ?Sized>(&mut self, phy: &mut P, session: &mut Session) -> bool {
        if matches!(
            self.phase,
            Phase::AwaitAttach { .. } | Phase::Reset { .. } | Phase::HostChirp { .. }
        ) {
            return false;
        }

        let epoch = session.begin();
        usb_debug!("reset: begin session {}", epoch.value());

        phy.drive(BusDrive::Idle);
        session.bus_state = BusState::Disconnected;
        self.suspended_speed = None;
        self.phase = Phase::AwaitAttach {
            since: phy.now(),
            stable: None,
        };

        true
    }

    /// Advances the reset sequence. Returns the outcome once the sequence completes.
    pub fn poll<P: UsbPhy + ?Sized>(&mut self, phy: &mut P, session: &mut Session) -> Option<ResetOutcome> {
        let now = phy.now();

        match self.phase {
            Phase::Idle => None,

            Phase::AwaitAttach { since, stable } => {
                // Applies to a bouncing line as well as to SE0
                if now - since >= self.timing.attach_timeout {
                    usb_debug!("reset: no device");
                    self.phase = Phase::Idle;
                    session.bus_state = BusState::Disconnected;
                    return Some(ResetOutcome::NoDevice);
                }

                let line = phy.line_state();

                match (line, stable) {
                    (LineState::J, Some((prev, t))) | (LineState::K, Some((prev, t)))
                        if prev == line =>
                    {
                        if now - t >= self.timing.attach_debounce {
                            let low_speed = line == LineState::K;
                            usb_debug!("reset: attach ({}), driving SE0", low_speed);

                            phy.drive(BusDrive::Reset);
                            session.bus_state = BusState::Resetting;
                            self.phase = Phase::Reset {
                                started: now,
                                low_speed,
                                k_since: None,
                                chirp_seen: false,
                            };
                        }
                        None
                    }
                    (LineState::J, _) | (LineState::K, _) => {
                        self.phase = Phase::AwaitAttach {
                            since,
                            stable: Some((line, now)),
                        };
                        None
                    }
                    _ => {
                        self.phase = Phase::AwaitAttach {
                            since,
                            stable: None,
                        };
                        None
                    }
                }
            }

            Phase::Reset {
                started,
                low_speed,
                k_since,
                chirp_seen,
            } => {
                let elapsed = now - started;

                if elapsed >= self.timing.reset_duration {
                    let speed = if low_speed { Speed::Low } else { Speed::Full };
                    return Some(self.finish(phy, session, speed));
                }

                if low_speed {
                    return None;
                }

                let line = phy.line_state();
                let mut k_since = k_since;
                let mut chirp_seen = chirp_seen;

                if line == LineState::K {
                    let since = *k_since.get_or_insert(now);
                    if !chirp_seen
                        && now - since >= self.timing.chirp_filter
                        && since - started <= self.timing.chirp_window
                    {
                        usb_debug!("reset: device chirp K");
                        chirp_seen = true;
                    }
                } else if chirp_seen {
                    // Device chirp ended, answer with K/J pairs until the reset interval is over.
                    session.bus_state = BusState::SpeedDetect;
                    phy.drive(BusDrive::ChirpK);
                    self.phase = Phase::HostChirp {
                        started,
                        next_step: now + self.timing.host_chirp_step,
                        k: true,
                    };
                    return None;
                } else {
                    k_since = None;
                }

                self.phase = Phase::Reset {
                    started,
                    low_speed,
                    k_since,
                    chirp_seen,
                };
                None
            }

            Phase::HostChirp {
                started,
                next_step,
                k,
            } => {
                if now - started >= self.timing.reset_duration {
                    return Some(self.finish(phy, session, Speed::High));
                }

                if now >= next_step {
                    let k = !k;
                    phy.drive(if k { BusDrive::ChirpK } else { BusDrive::ChirpJ });
                    self.phase = Phase::HostChirp {
                        started,
                        next_step: next_step + self.timing.host_chirp_step,
                        k,
                    };
                }
                None
            }

            Phase::Resume { until, speed } => {
                if now < until {
                    return None;
                }

                usb_debug!("reset: resumed");
                phy.drive(BusDrive::Idle);
                session.bus_state = BusState::Idle(speed);
                self.phase = Phase::Idle;
                Some(ResetOutcome::Resumed)
            }
        }
    }

    fn finish<P: UsbPhy + ?Sized>(&mut self, phy: &mut P, session: &mut Session, speed: Speed) -> ResetOutcome {
        usb_debug!("reset: complete, speed {:?}", speed);

        phy.drive(BusDrive::Idle);
        phy.set_speed(speed);
        session.speed = Some(speed);
        session.bus_state = BusState::Idle(speed);
        self.phase = Phase::Idle;

        ResetOutcome::Speed(speed)
    }

    /// Stops bus activity. The caller stops start-of-frame generation.
    ///
    /// # Errors
    ///
    /// * [`InvalidState`](crate::UsbError::InvalidState) - The bus is not idle.
    pub fn suspend(&mut self, session: &mut Session) -> Result<()> {
        match (self.phase, session.bus_state) {
            (Phase::Idle, BusState::Idle(speed)) => {
                usb_debug!("reset: suspend");
                self.suspended_speed = Some(speed);
                session.bus_state = BusState::Suspended;
                Ok(())
            }
            _ => Err(UsbError::InvalidState),
        }
    }

    /// Starts resume signalling. [`poll`](ResetController::poll) reports
    /// [`ResetOutcome::Resumed`] when the bus is active again.
    ///
    /// # Errors
    ///
    /// * [`InvalidState`](crate::UsbError::InvalidState) - The bus is not suspended.
    pub fn resume<P: UsbPhy + ?Sized>(&mut self, phy: &mut P, session: &mut Session) -> Result<()> {
        let speed = match (self.phase, session.bus_state, self.suspended_speed) {
            (Phase::Idle, BusState::Suspended, Some(speed)) => speed,
            _ => return Err(UsbError::InvalidState),
        };

        usb_debug!("reset: resume");
        phy.drive(BusDrive::Resume);
        self.suspended_speed = None;
        self.phase = Phase::Resume {
            until: phy.now() + self.timing.resume_duration,
            speed,
        };

        Ok(())
    }

    /// Checks for a disconnect on an idle full- or low-speed bus. High-speed idle is SE0 and needs
    /// the PHY's envelope detector instead, so it is not checked here.
    pub fn check_disconnect<P: UsbPhy + ?Sized>(&mut self, phy: &mut P, session: &mut Session) -> bool {
        match (self.phase, session.bus_state) {
            (Phase::Idle, BusState::Idle(Speed::Full))
            | (Phase::Idle, BusState::Idle(Speed::Low)) => {
                if phy.line_state() == LineState::Se0 {
                    usb_debug!("reset: disconnect");
                    session.bus_state = BusState::Disconnected;
                    session.begin();
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}
