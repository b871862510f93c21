//! Packet capture.
//!
//! [`CapturePhy`] sits between the host and a real PHY and records every packet in either
//! direction as a pcap stream with the USB 2.0 link type, which Wireshark and Packetry can open.

use crate::phy::{BusDrive, LineState, RxResult, UsbPhy};
use crate::time::Instant;
use crate::{Result, Speed};
use core::time::Duration;

/// pcap magic number for nanosecond timestamps.
pub const PCAP_NSEC_MAGIC: u32 = 0xa1b2_3c4d;

/// pcap link type for raw USB 2.0 packets (PID through CRC).
pub const LINKTYPE_USB_2_0: u32 = 288;

/// Snapshot length written to the file header.
pub const SNAPLEN: u32 = 65535;

/// Length of the pcap global header.
pub const HEADER_LEN: usize = 24;

/// Length of the per-record header.
pub const RECORD_HEADER_LEN: usize = 16;

/// The pcap global header.
pub fn file_header() -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];

    h[0..4].copy_from_slice(&PCAP_NSEC_MAGIC.to_le_bytes());
    h[4..6].copy_from_slice(&2u16.to_le_bytes()); // version major
    h[6..8].copy_from_slice(&4u16.to_le_bytes()); // version minor
    // thiszone and sigfigs stay zero
    h[16..20].copy_from_slice(&SNAPLEN.to_le_bytes());
    h[20..24].copy_from_slice(&LINKTYPE_USB_2_0.to_le_bytes());

    h
}

/// The header of one pcap record holding `len` bytes captured at `at`.
pub fn record_header(at: Instant, len: usize) -> [u8; RECORD_HEADER_LEN] {
    let micros = at.as_micros();
    let secs = (micros / 1_000_000) as u32;
    let nanos = ((micros % 1_000_000) * 1000) as u32;
    let len = len as u32;

    let mut h = [0u8; RECORD_HEADER_LEN];
    h[0..4].copy_from_slice(&secs.to_le_bytes());
    h[4..8].copy_from_slice(&nanos.to_le_bytes());
    h[8..12].copy_from_slice(&len.to_le_bytes()); // captured length
    h[12..16].copy_from_slice(&len.to_le_bytes()); // original length

    h
}

/// A [`UsbPhy`] decorator that writes a pcap transcript of all packet traffic to `sink`.
///
/// The sink is called with consecutive chunks of the pcap stream, starting with the file header
/// when the decorator is created.
pub struct CapturePhy<P: UsbPhy, W: FnMut(&[u8])> {
    inner: P,
    sink: W,
    packets: u32,
}

impl<P: UsbPhy, W: FnMut(&[u8])> CapturePhy<P, W> {
    /// Wraps `inner` and writes the pcap file header to `sink`.
    pub fn new(inner: P, mut sink: W) -> CapturePhy<P, W> {
        sink(&file_header());

        CapturePhy {
            inner,
            sink,
            packets: 0,
        }
    }

    /// Number of packets captured.
    pub fn packets(&self) -> u32 {
        self.packets
    }

    /// Gets the wrapped PHY.
    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Gets the wrapped PHY mutably.
    pub fn inner_mut(&mut self) -> &mut P {
        &mut self.inner
    }

    /// Unwraps the PHY and the sink.
    pub fn into_parts(self) -> (P, W) {
        (self.inner, self.sink)
    }

    fn record(&mut self, packet: &[u8]) {
        if packet.is_empty() {
            return;
        }

        let at = self.inner.now();
        (self.sink)(&record_header(at, packet.len()));
        (self.sink)(packet);
        self.packets = self.packets.wrapping_add(1);
    }
}

impl<P: UsbPhy, W: FnMut(&[u8])> UsbPhy for CapturePhy<P, W> {
    fn now(&self) -> Instant {
        self.inner.now()
    }

    fn line_state(&mut self) -> LineState {
        self.inner.line_state()
    }

    fn drive(&mut self, drive: BusDrive) {
        self.inner.drive(drive)
    }

    fn set_speed(&mut self, speed: Speed) {
        self.inner.set_speed(speed)
    }

    fn transmit(&mut self, packet: &[u8]) -> Result<()> {
        self.record(packet);
        self.inner.transmit(packet)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> RxResult {
        let res = self.inner.receive(buf, timeout);

        if let RxResult::Packet(len) = res {
            let len = len.min(buf.len());
            self.record(&buf[..len]);
        }

        res
    }
}
