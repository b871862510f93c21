//! Packet codec: token, start-of-frame, data and handshake packets (USB 2.0 section 8.4).

use crate::crc::{crc16, crc5};
use crate::{Result, UsbError};
use core::convert::TryFrom;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Largest data payload handled by this crate: the largest `wMaxPacketSize` of a high-speed
/// interrupt endpoint.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Largest packet on the wire: PID, payload and CRC16.
pub const MAX_WIRE_LEN: usize = MAX_PACKET_SIZE + 3;

/// Packet identifier, including the check nibble.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pid {
    /// Token: host to device data transfer.
    Out = 0xe1,
    /// Token: device to host data transfer.
    In = 0x69,
    /// Token: start of frame marker.
    Sof = 0xa5,
    /// Token: control transfer setup stage.
    Setup = 0x2d,
    /// Data packet, even toggle.
    Data0 = 0xc3,
    /// Data packet, odd toggle.
    Data1 = 0x4b,
    /// Data packet, high-bandwidth isochronous.
    Data2 = 0x87,
    /// Data packet, split and high-bandwidth isochronous.
    MData = 0x0f,
    /// Handshake: accepted.
    Ack = 0xd2,
    /// Handshake: not ready, try again.
    Nak = 0x5a,
    /// Handshake: endpoint halted or request not supported.
    Stall = 0x1e,
    /// Handshake: accepted, but no space for another packet (high speed).
    Nyet = 0x96,
    /// Special: low-speed preamble.
    Pre = 0x3c,
    /// Special: split transaction.
    Split = 0x78,
    /// Special: high-speed flow control probe.
    Ping = 0xb4,
}

impl Pid {
    /// Whether this is a DATA0/DATA1/DATA2/MDATA PID.
    pub fn is_data(self) -> bool {
        matches!(self, Pid::Data0 | Pid::Data1 | Pid::Data2 | Pid::MData)
    }

    /// Whether this is an ACK/NAK/STALL/NYET PID.
    pub fn is_handshake(self) -> bool {
        matches!(self, Pid::Ack | Pid::Nak | Pid::Stall | Pid::Nyet)
    }
}

/// A decoded packet.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Packet<'a> {
    /// SETUP, IN, OUT or PING token.
    Token {
        /// Token PID.
        pid: Pid,
        /// Device address.
        address: u8,
        /// Endpoint number.
        endpoint: u8,
    },
    /// Start of frame with an 11-bit frame number.
    Sof(u16),
    /// Data packet with its payload (CRC stripped).
    Data {
        /// Data PID.
        pid: Pid,
        /// Payload bytes.
        payload: &'a [u8],
    },
    /// Handshake.
    Handshake(Pid),
}

/// Reasons a received packet is rejected by [`decode`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketError {
    /// Zero-length packet (no PID).
    Empty,
    /// PID check nibble mismatch or reserved PID.
    InvalidPid,
    /// Wrong length for the PID.
    Length,
    /// Integrity code mismatch.
    Crc,
}

/// Builds a 3-byte token packet.
pub fn token(pid: Pid, address: u8, endpoint: u8) -> [u8; 3] {
    field_packet(pid, (address as u16 & 0x7f) | ((endpoint as u16 & 0x0f) << 7))
}

/// Builds a 3-byte start-of-frame packet.
pub fn sof(frame: u16) -> [u8; 3] {
    field_packet(Pid::Sof, frame & 0x07ff)
}

fn field_packet(pid: Pid, field: u16) -> [u8; 3] {
    let word = field | ((crc5(field) as u16) << 11);
    let bytes = word.to_le_bytes();

    [pid.into(), bytes[0], bytes[1]]
}

/// Builds a 1-byte handshake packet.
pub fn handshake(pid: Pid) -> [u8; 1] {
    [pid.into()]
}

/// Writes a data packet into `buf` and returns its wire length.
///
/// # Errors
///
/// * [`BufferOverflow`](crate::UsbError::BufferOverflow) - `buf` cannot hold the payload plus
///   PID and CRC.
pub fn data(pid: Pid, payload: &[u8], buf: &mut [u8]) -> Result<usize> {
    let len = payload.len() + 3;
    if len > buf.len() {
        return Err(UsbError::BufferOverflow);
    }

    buf[0] = pid.into();
    buf[1..1 + payload.len()].copy_from_slice(payload);
    buf[1 + payload.len()..len].copy_from_slice(&crc16(payload).to_le_bytes());

    Ok(len)
}

/// Decodes and validates a packet received from the bus.
pub fn decode(buf: &[u8]) -> core::result::Result<Packet<'_>, PacketError> {
    let (&pid, rest) = buf.split_first().ok_or(PacketError::Empty)?;
    let pid = Pid::try_from(pid).map_err(|_| PacketError::InvalidPid)?;

    match pid {
        Pid::Out | Pid::In | Pid::Setup | Pid::Ping | Pid::Sof => {
            if rest.len() != 2 {
                return Err(PacketError::Length);
            }

            let word = u16::from_le_bytes([rest[0], rest[1]]);
            let field = word & 0x07ff;
            if crc5(field) != (word >> 11) as u8 {
                return Err(PacketError::Crc);
            }

            if pid == Pid::Sof {
                Ok(Packet::Sof(field))
            } else {
                Ok(Packet::Token {
                    pid,
                    address: (field & 0x7f) as u8,
                    endpoint: (field >> 7) as u8,
                })
            }
        }
        Pid::Data0 | Pid::Data1 | Pid::Data2 | Pid::MData => {
            if rest.len() < 2 {
                return Err(PacketError::Length);
            }

            let (payload, crc) = rest.split_at(rest.len() - 2);
            if crc16(payload).to_le_bytes() != [crc[0], crc[1]] {
                return Err(PacketError::Crc);
            }

            Ok(Packet::Data { pid, payload })
        }
        Pid::Ack | Pid::Nak | Pid::Stall | Pid::Nyet => {
            if !rest.is_empty() {
                return Err(PacketError::Length);
            }

            Ok(Packet::Handshake(pid))
        }
        Pid::Pre | Pid::Split => Err(PacketError::InvalidPid),
    }
}
