//! Packet integrity codes. Both CRCs are computed LSB-first, seeded with all ones and transmitted
//! inverted (USB 2.0 section 8.3.5).

/// Computes the CRC5 of the 11-bit token field (address and endpoint, or frame number).
pub(crate) fn crc5(field: u16) -> u8 {
    let mut crc: u8 = 0x1f;

    for i in 0..11 {
        let bit = ((field >> i) & 1) as u8;

        if (crc ^ bit) & 1 != 0 {
            crc = (crc >> 1) ^ 0x14;
        } else {
            crc >>= 1;
        }
    }

    !crc & 0x1f
}

/// Computes the CRC16 of a data packet payload.
pub(crate) fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;

    for &byte in data {
        crc ^= byte as u16;

        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xa001;
            } else {
                crc >>= 1;
            }
        }
    }

    !crc
}
