//! Timestamps of the free-running microsecond timer exposed by the PHY.

use core::ops::{Add, Sub};
use core::time::Duration;

/// A point in time, in microseconds since an arbitrary epoch chosen by the
/// [`UsbPhy`](crate::phy::UsbPhy) implementation.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Instant(u64);

impl Instant {
    /// Creates an instant from a raw microsecond count.
    pub const fn from_micros(micros: u64) -> Instant {
        Instant(micros)
    }

    /// Gets the raw microsecond count.
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_add(duration_micros(rhs)))
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        self.saturating_duration_since(rhs)
    }
}

/// Converts a duration into whole microseconds, rounding sub-microsecond remainders up so that
/// short intervals are never shortened.
pub(crate) fn duration_micros(d: Duration) -> u64 {
    let micros = d.as_micros();
    let micros = if d.subsec_nanos() % 1000 != 0 {
        micros + 1
    } else {
        micros
    };

    if micros > u64::MAX as u128 {
        u64::MAX
    } else {
        micros as u64
    }
}
