use crate::time::Instant;
use crate::{Result, Speed};
use core::time::Duration;

/// A trait for host-capable USB transceivers. Implement this to add support for a new hardware
/// platform.
///
/// The PHY is owned by the [`UsbHost`](crate::host::UsbHost) and only ever accessed from its
/// single flow of control, so methods take `&mut self`. Packets handed to and returned from the
/// PHY start with the PID byte and end with the CRC field, if any. SYNC and EOP framing, bit
/// stuffing and NRZI encoding are the PHY's responsibility.
pub trait UsbPhy {
    /// Gets the current time from a free-running microsecond timer. Must be monotonic.
    fn now(&self) -> Instant;

    /// Samples the current differential line state. Only used by the
    /// [`ResetController`](crate::reset::ResetController) for attach detection and the high-speed
    /// chirp handshake.
    fn line_state(&mut self) -> LineState;

    /// Sets what the host drives onto the bus. [`BusDrive::Idle`] releases the bus so that normal
    /// packet traffic and line state sampling is possible.
    fn drive(&mut self, drive: BusDrive);

    /// Switches the transceiver to the negotiated signalling speed. Called once per reset, after
    /// the chirp handshake has completed.
    fn set_speed(&mut self, speed: Speed);

    /// Transmits a single packet.
    ///
    /// # Errors
    ///
    /// * [`BusError`](crate::UsbError::BusError) - The PHY could not put the packet on the bus.
    ///
    /// Implementations may also return other errors if applicable.
    fn transmit(&mut self, packet: &[u8]) -> Result<()>;

    /// Waits for a single packet from the device for at most `timeout` and copies it into `buf`.
    ///
    /// The timeout covers bus turnaround only; implementations should return
    /// [`RxResult::Timeout`] as soon as it elapses without the start of a packet.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> RxResult;
}

/// Differential line state as sampled by the transceiver, named in full-speed terms.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LineState {
    /// Single-ended zero. Nothing attached, bus reset, or high-speed idle.
    Se0,
    /// D+ high. Full-speed idle.
    J,
    /// D- high. Low-speed idle, chirp K, or resume signalling.
    K,
    /// Both lines high. Illegal.
    Se1,
}

/// What the host drives onto the bus.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusDrive {
    /// The bus is released for normal traffic.
    Idle,
    /// Bus reset (SE0).
    Reset,
    /// High-speed chirp K.
    ChirpK,
    /// High-speed chirp J.
    ChirpJ,
    /// Resume signalling (K).
    Resume,
}

/// Outcome of [`UsbPhy::receive`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxResult {
    /// A packet of the given length was received into the buffer.
    Packet(usize),

    /// Nothing was received within the timeout.
    Timeout,

    /// Something was received, but the PHY flagged it as malformed (bit stuffing violation, missing
    /// EOP, buffer overrun).
    Error,
}
