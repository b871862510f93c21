//! Control requests (USB 2.0 section 9.3).

use crate::descriptor::descriptor_type;
use crate::UsbDirection;
use core::convert::TryFrom;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Control request type.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestType {
    /// Request is a USB standard request.
    Standard = 0,
    /// Request is intended for a USB class.
    Class = 1,
    /// Request is vendor-specific.
    Vendor = 2,
    /// Reserved.
    Reserved = 3,
}

/// Control request recipient.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    /// Request is intended for the entire device.
    Device = 0,
    /// Request is intended for an interface. Generally, the `index` field of the request specifies
    /// the interface number.
    Interface = 1,
    /// Request is intended for an endpoint. Generally, the `index` field of the request specifies
    /// the endpoint address.
    Endpoint = 2,
    /// None of the above.
    Other = 3,
    /// Reserved.
    Reserved = 4,
}

/// A control request, as sent in a SETUP packet.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Request {
    /// Direction of the request.
    pub direction: UsbDirection,
    /// Type of the request.
    pub request_type: RequestType,
    /// Recipient of the request.
    pub recipient: Recipient,
    /// Request code. The meaning of the value depends on the previous fields.
    pub request: u8,
    /// Request value. The meaning of the value depends on the previous fields.
    pub value: u16,
    /// Request index. The meaning of the value depends on the previous fields.
    pub index: u16,
    /// Length of the DATA stage. For control OUT transfers this is the exact length of the data the
    /// host sends. For control IN transfers this is the maximum length of data the device may
    /// return.
    pub length: u16,
}

impl Request {
    /// Standard USB control request Get Status
    pub const GET_STATUS: u8 = 0;

    /// Standard USB control request Clear Feature
    pub const CLEAR_FEATURE: u8 = 1;

    /// Standard USB control request Set Feature
    pub const SET_FEATURE: u8 = 3;

    /// Standard USB control request Set Address
    pub const SET_ADDRESS: u8 = 5;

    /// Standard USB control request Get Descriptor
    pub const GET_DESCRIPTOR: u8 = 6;

    /// Standard USB control request Set Descriptor
    pub const SET_DESCRIPTOR: u8 = 7;

    /// Standard USB control request Get Configuration
    pub const GET_CONFIGURATION: u8 = 8;

    /// Standard USB control request Set Configuration
    pub const SET_CONFIGURATION: u8 = 9;

    /// Standard USB control request Get Interface
    pub const GET_INTERFACE: u8 = 10;

    /// Standard USB control request Set Interface
    pub const SET_INTERFACE: u8 = 11;

    /// Standard USB control request Synch Frame
    pub const SYNCH_FRAME: u8 = 12;

    /// Standard USB feature Endpoint Halt for Set/Clear Feature
    pub const FEATURE_ENDPOINT_HALT: u16 = 0;

    /// Standard USB feature Device Remote Wakeup for Set/Clear Feature
    pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;

    /// GET_DESCRIPTOR for a standard descriptor of `descriptor_type` and `index`.
    pub fn get_descriptor(descriptor_type: u8, index: u8, lang_id: u16, length: u16) -> Request {
        Request {
            direction: UsbDirection::In,
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: Request::GET_DESCRIPTOR,
            value: ((descriptor_type as u16) << 8) | index as u16,
            index: lang_id,
            length,
        }
    }

    /// GET_DESCRIPTOR(DEVICE) for the first `length` bytes.
    pub fn get_device_descriptor(length: u16) -> Request {
        Request::get_descriptor(descriptor_type::DEVICE, 0, 0, length)
    }

    /// GET_DESCRIPTOR(CONFIGURATION) for configuration `index`.
    pub fn get_configuration_descriptor(index: u8, length: u16) -> Request {
        Request::get_descriptor(descriptor_type::CONFIGURATION, index, 0, length)
    }

    /// SET_ADDRESS
    pub fn set_address(address: u8) -> Request {
        Request::standard_out(Recipient::Device, Request::SET_ADDRESS, address as u16, 0)
    }

    /// SET_CONFIGURATION
    pub fn set_configuration(value: u8) -> Request {
        Request::standard_out(Recipient::Device, Request::SET_CONFIGURATION, value as u16, 0)
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) for an endpoint address.
    pub fn clear_halt(ep_addr: u8) -> Request {
        Request::standard_out(
            Recipient::Endpoint,
            Request::CLEAR_FEATURE,
            Request::FEATURE_ENDPOINT_HALT,
            ep_addr as u16,
        )
    }

    fn standard_out(recipient: Recipient, request: u8, value: u16, index: u16) -> Request {
        Request {
            direction: UsbDirection::Out,
            request_type: RequestType::Standard,
            recipient,
            request,
            value,
            index,
            length: 0,
        }
    }

    /// Gets the descriptor type and index from the value field of a GET_DESCRIPTOR request.
    pub fn descriptor_type_index(&self) -> (u8, u8) {
        ((self.value >> 8) as u8, self.value as u8)
    }

    /// Encodes the request as the 8-byte SETUP packet payload.
    pub fn to_bytes(&self) -> [u8; 8] {
        let recipient: u8 = self.recipient.into();
        let request_type: u8 = self.request_type.into();
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();

        [
            (self.direction as u8) | (request_type << 5) | (recipient & 0x1f),
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Decodes an 8-byte SETUP packet payload.
    pub fn parse(buf: &[u8; 8]) -> Request {
        let rt = buf[0];

        Request {
            direction: rt.into(),
            request_type: RequestType::try_from((rt >> 5) & 0b11).unwrap_or(RequestType::Reserved),
            recipient: Recipient::try_from(rt & 0b11111).unwrap_or(Recipient::Reserved),
            request: buf[1],
            value: u16::from_le_bytes([buf[2], buf[3]]),
            index: u16::from_le_bytes([buf[4], buf[5]]),
            length: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }
}
