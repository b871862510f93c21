//! The per-connection session context shared by reference between the host components.

use crate::reset::BusState;
use crate::Speed;

/// Identifies one bus session. Incremented on every reset, so that results produced for an earlier
/// session can be recognised and discarded.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Epoch(u32);

impl Epoch {
    /// The raw counter value.
    pub fn value(self) -> u32 {
        self.0
    }

    fn next(self) -> Epoch {
        Epoch(self.0.wrapping_add(1))
    }
}

/// Which logical owner may issue transactions on the bus. A
/// [`DeviceHandle`](crate::class::DeviceHandle) refuses to issue anything unless the owner is
/// [`Class`](BusOwner::Class).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusOwner {
    /// The enumerator, from reset until the device is configured.
    Enumerator,
    /// The class driver, once enumeration has completed.
    Class,
}

/// Bus and device state for the current connection.
///
/// Only the [`ResetController`](crate::reset::ResetController) changes `bus_state` and `speed`,
/// and only the [`Enumerator`](crate::enumerator::Enumerator) changes `address` and `owner`.
#[derive(Clone, Debug)]
pub struct Session {
    epoch: Epoch,
    pub(crate) bus_state: BusState,
    pub(crate) speed: Option<Speed>,
    pub(crate) address: u8,
    pub(crate) owner: BusOwner,
}

impl Session {
    /// Creates the context for a disconnected bus.
    pub const fn new() -> Session {
        Session {
            epoch: Epoch(0),
            bus_state: BusState::Disconnected,
            speed: None,
            address: 0,
            owner: BusOwner::Enumerator,
        }
    }

    /// The current session epoch.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Whether `epoch` identifies the current session.
    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.epoch == epoch
    }

    /// The current bus state.
    pub fn bus_state(&self) -> BusState {
        self.bus_state
    }

    /// The negotiated speed, if a device has been reset successfully.
    pub fn speed(&self) -> Option<Speed> {
        self.speed
    }

    /// The address the device currently responds to.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The current bus owner.
    pub fn owner(&self) -> BusOwner {
        self.owner
    }

    /// Starts a new session: bumps the epoch and forgets everything learned about the device.
    pub(crate) fn begin(&mut self) -> Epoch {
        self.epoch = self.epoch.next();
        self.speed = None;
        self.address = 0;
        self.owner = BusOwner::Enumerator;
        self.epoch
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}
