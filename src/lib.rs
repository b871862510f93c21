//! Host-side USB 2.0 protocol core for embedded hosts.
//!
//! This crate drives a single directly attached device from bus reset to a configured state:
//!
//! * [`reset`] performs bus reset and the high-speed chirp handshake,
//! * [`transaction`] builds token, data and handshake packets, generates start-of-frame markers
//!   and retries transient failures,
//! * [`descriptor`] parses and re-serializes standard descriptors,
//! * [`enumerator`] sequences the standard requests that assign an address and select a
//!   configuration,
//! * [`watchdog`] forces the whole sequence back to the start if it stops making progress.
//!
//! Everything is driven from [`UsbHost::poll`](host::UsbHost::poll), which should be called
//! periodically from the main loop or a timer interrupt. Hardware support is added by implementing
//! the [`UsbPhy`](phy::UsbPhy) trait. Once enumeration completes, the resulting
//! [`EndpointMap`](endpoint::EndpointMap) and a transaction handle are handed to a
//! [`ClassDriver`](class::ClassDriver).

#![no_std]
#![warn(missing_docs)]

#[macro_use]
mod macros;

/// A USB stack error.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// The device kept responding NAK beyond the retry budget.
    Nak,

    /// The device responded STALL. This is a protocol-level rejection and is never retried by the
    /// transaction engine.
    Stall,

    /// The device did not produce a valid response within the transaction time budget.
    Timeout,

    /// A malformed response was received (bad PID, bit stuffing violation, babble).
    BusError,

    /// A descriptor was structurally invalid.
    Parse(ParseError),

    /// No device was detected on the bus.
    NoDevice,

    /// The operation is not valid in the current state.
    InvalidState,

    /// A buffer was too small for the data.
    BufferOverflow,

    /// The operation belongs to a session that has since been reset.
    StaleSession,

    /// An invalid endpoint address was used.
    InvalidEndpoint,

    /// The operation cannot complete yet. Try again on a later poll.
    WouldBlock,
}

impl From<ParseError> for UsbError {
    fn from(err: ParseError) -> Self {
        UsbError::Parse(err)
    }
}

/// Result type used throughout this crate.
pub type Result<T> = core::result::Result<T, UsbError>;

/// Direction of USB traffic. Note that in the USB standard the direction is always indicated from
/// the perspective of the host, which is also the side this crate implements.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbDirection {
    /// Host to device (OUT)
    Out = 0x00,
    /// Device to host (IN)
    In = 0x80,
}

impl From<u8> for UsbDirection {
    fn from(value: u8) -> Self {
        if value & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }
}

/// Signalling speed of the attached device. Negotiated during bus reset and fixed until the next
/// reset.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    /// 1.5 Mb/s
    Low,
    /// 12 Mb/s
    Full,
    /// 480 Mb/s
    High,
}

impl Speed {
    /// Largest max packet size a bulk endpoint may declare at this speed.
    pub fn max_bulk_packet_size(self) -> u16 {
        match self {
            Speed::Low => 8,
            Speed::Full => 64,
            Speed::High => 512,
        }
    }
}

pub mod capture;
pub mod class;
pub mod control;
mod control_pipe;
mod crc;
pub mod descriptor;
pub mod endpoint;
pub mod enumerator;
pub mod host;
pub mod packet;
pub mod phy;
pub mod reset;
pub mod session;
pub mod sof;
pub mod time;
pub mod transaction;
pub mod watchdog;

pub use crate::descriptor::ParseError;

/// Prelude for applications that wire a PHY and class drivers into a host.
pub mod prelude {
    pub use crate::class::ClassDriver;
    pub use crate::enumerator::EnumerationState;
    pub use crate::host::{PollResult, UsbHost, UsbHostBuilder};
    pub use crate::phy::UsbPhy;
    pub use crate::reset::BusState;
    pub use crate::watchdog::Watchdog;
    pub use crate::{Speed, UsbError};
}

/// Prelude for class driver implementors.
pub mod class_prelude {
    pub use crate::class::{ClassDriver, DeviceHandle};
    pub use crate::control::{Recipient, Request, RequestType};
    pub use crate::descriptor::{DeviceDescriptor, InterfaceDescriptor};
    pub use crate::endpoint::{EndpointAddress, EndpointInfo, EndpointMap, EndpointType};
    pub use crate::phy::UsbPhy;
    pub use crate::transaction::TransactionResult;
    pub use crate::{Result, UsbDirection, UsbError};
}
