//! Standard descriptors (USB 2.0 section 9.6): parsing, configuration flattening and
//! re-serialization.
//!
//! Parsing is pure: the same bytes always produce the same records, and writing the records back
//! with a [`DescriptorWriter`] reproduces the original bytes.

use crate::endpoint::{EndpointAddress, EndpointInfo, EndpointType};
use crate::{Result, UsbError};

/// Standard descriptor types
#[allow(missing_docs)]
pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const DEVICE_QUALIFIER: u8 = 6;
    pub const OTHER_SPEED_CONFIGURATION: u8 = 7;
    pub const INTERFACE_POWER: u8 = 8;
    pub const OTG: u8 = 9;
    pub const DEBUG: u8 = 10;
    pub const INTERFACE_ASSOCIATION: u8 = 11;
    pub const BOS: u8 = 15;
    pub const CLASS_INTERFACE: u8 = 0x24;
    pub const CLASS_ENDPOINT: u8 = 0x25;
}

/// String descriptor language IDs.
pub mod lang_id {
    /// English (US)
    pub const ENGLISH_US: u16 = 0x0409;
}

/// Class codes used by this crate.
#[allow(missing_docs)]
pub mod class_code {
    pub const PER_INTERFACE: u8 = 0x00;
    pub const AUDIO: u8 = 0x01;
    pub const HID: u8 = 0x03;
    pub const MASS_STORAGE: u8 = 0x08;
    pub const HUB: u8 = 0x09;
    pub const VENDOR_SPECIFIC: u8 = 0xff;
}

/// Maximum number of selected interfaces kept from one configuration.
pub const MAX_INTERFACES: usize = 8;

/// Maximum number of endpoints kept per interface.
pub const MAX_INTERFACE_ENDPOINTS: usize = 16;

/// Reasons a descriptor is rejected.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// The buffer ends before the declared length.
    Truncated,
    /// bLength is too short or does not match the descriptor type.
    InvalidLength,
    /// bDescriptorType is not what the parse context expects.
    UnexpectedType {
        /// Expected type.
        expected: u8,
        /// Type found.
        found: u8,
    },
    /// wTotalLength disagrees with the data returned.
    TotalLengthMismatch,
    /// bMaxPacketSize0 is not 8, 16, 32 or 64.
    InvalidMaxPacketSize,
    /// More selected interfaces than [`MAX_INTERFACES`].
    TooManyInterfaces,
    /// More endpoints in one interface than [`MAX_INTERFACE_ENDPOINTS`].
    TooManyEndpoints,
}

type ParseResult<T> = core::result::Result<T, ParseError>;

/// Which descriptor the caller expects at the start of a buffer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DescriptorKind {
    /// Device descriptor.
    Device,
    /// Configuration descriptor header.
    Configuration,
    /// Interface descriptor.
    Interface,
    /// Endpoint descriptor.
    Endpoint,
}

impl DescriptorKind {
    /// The bDescriptorType value of this kind.
    pub fn descriptor_type(self) -> u8 {
        match self {
            DescriptorKind::Device => descriptor_type::DEVICE,
            DescriptorKind::Configuration => descriptor_type::CONFIGURATION,
            DescriptorKind::Interface => descriptor_type::INTERFACE,
            DescriptorKind::Endpoint => descriptor_type::ENDPOINT,
        }
    }
}

/// A parsed standard descriptor.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Descriptor {
    /// Device descriptor.
    Device(DeviceDescriptor),
    /// Configuration descriptor header.
    Configuration(ConfigDescriptor),
    /// Interface descriptor.
    Interface(InterfaceDescriptor),
    /// Endpoint descriptor.
    Endpoint(EndpointDescriptor),
}

/// Parses the descriptor at the start of `bytes`, which must be of kind `expected`.
pub fn parse(bytes: &[u8], expected: DescriptorKind) -> ParseResult<Descriptor> {
    Ok(match expected {
        DescriptorKind::Device => Descriptor::Device(DeviceDescriptor::parse(bytes)?),
        DescriptorKind::Configuration => Descriptor::Configuration(ConfigDescriptor::parse(bytes)?),
        DescriptorKind::Interface => Descriptor::Interface(InterfaceDescriptor::parse(bytes)?),
        DescriptorKind::Endpoint => Descriptor::Endpoint(EndpointDescriptor::parse(bytes)?),
    })
}

/// Validates the 2-byte header and returns the descriptor body (everything after the header, up
/// to bLength).
fn body<'a>(bytes: &'a [u8], descriptor_type: u8, lengths: &[usize]) -> ParseResult<&'a [u8]> {
    if bytes.len() < 2 {
        return Err(ParseError::Truncated);
    }

    let length = bytes[0] as usize;
    if length < 2 {
        return Err(ParseError::InvalidLength);
    }
    if length > bytes.len() {
        return Err(ParseError::Truncated);
    }
    if bytes[1] != descriptor_type {
        return Err(ParseError::UnexpectedType {
            expected: descriptor_type,
            found: bytes[1],
        });
    }
    if !lengths.contains(&length) {
        return Err(ParseError::InvalidLength);
    }

    Ok(&bytes[2..length])
}

fn le16(b: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([b[i], b[i + 1]])
}

/// Device descriptor.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceDescriptor {
    /// bcdUSB
    pub usb_release: u16,
    /// bDeviceClass
    pub device_class: u8,
    /// bDeviceSubClass
    pub device_sub_class: u8,
    /// bDeviceProtocol
    pub device_protocol: u8,
    /// bMaxPacketSize0
    pub max_packet_size_0: u8,
    /// idVendor
    pub vendor_id: u16,
    /// idProduct
    pub product_id: u16,
    /// bcdDevice
    pub device_release: u16,
    /// iManufacturer
    pub manufacturer: u8,
    /// iProduct
    pub product: u8,
    /// iSerialNumber
    pub serial_number: u8,
    /// bNumConfigurations
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Length of a device descriptor.
    pub const LENGTH: usize = 18;

    /// Parses a complete device descriptor.
    pub fn parse(bytes: &[u8]) -> ParseResult<DeviceDescriptor> {
        let b = body(bytes, descriptor_type::DEVICE, &[Self::LENGTH])?;

        let desc = DeviceDescriptor {
            usb_release: le16(b, 0),
            device_class: b[2],
            device_sub_class: b[3],
            device_protocol: b[4],
            max_packet_size_0: b[5],
            vendor_id: le16(b, 6),
            product_id: le16(b, 8),
            device_release: le16(b, 10),
            manufacturer: b[12],
            product: b[13],
            serial_number: b[14],
            num_configurations: b[15],
        };

        check_max_packet_size_0(desc.max_packet_size_0)?;

        Ok(desc)
    }

    /// Extracts bMaxPacketSize0 from the first 8 bytes of a device descriptor. This is all that is
    /// read before the device has an address, because the control endpoint's packet size is not
    /// known yet.
    pub fn parse_head(bytes: &[u8]) -> ParseResult<u8> {
        if bytes.len() < 8 {
            return Err(ParseError::Truncated);
        }
        if bytes[1] != descriptor_type::DEVICE {
            return Err(ParseError::UnexpectedType {
                expected: descriptor_type::DEVICE,
                found: bytes[1],
            });
        }
        if bytes[0] as usize != Self::LENGTH {
            return Err(ParseError::InvalidLength);
        }

        check_max_packet_size_0(bytes[7])?;

        Ok(bytes[7])
    }

    /// Whether the device declares itself a hub.
    pub fn is_hub(&self) -> bool {
        self.device_class == class_code::HUB
    }
}

fn check_max_packet_size_0(mps: u8) -> ParseResult<()> {
    match mps {
        8 | 16 | 32 | 64 => Ok(()),
        _ => Err(ParseError::InvalidMaxPacketSize),
    }
}

/// Configuration descriptor header.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigDescriptor {
    /// wTotalLength
    pub total_length: u16,
    /// bNumInterfaces
    pub num_interfaces: u8,
    /// bConfigurationValue
    pub configuration_value: u8,
    /// iConfiguration
    pub configuration_string: u8,
    /// bmAttributes
    pub attributes: u8,
    /// bMaxPower, in 2 mA units
    pub max_power: u8,
}

impl ConfigDescriptor {
    /// Length of a configuration descriptor header.
    pub const LENGTH: usize = 9;

    /// Parses a configuration descriptor header.
    pub fn parse(bytes: &[u8]) -> ParseResult<ConfigDescriptor> {
        let b = body(bytes, descriptor_type::CONFIGURATION, &[Self::LENGTH])?;

        let desc = ConfigDescriptor {
            total_length: le16(b, 0),
            num_interfaces: b[2],
            configuration_value: b[3],
            configuration_string: b[4],
            attributes: b[5],
            max_power: b[6],
        };

        if (desc.total_length as usize) < Self::LENGTH {
            return Err(ParseError::TotalLengthMismatch);
        }

        Ok(desc)
    }

    /// Whether the device is self-powered in this configuration.
    pub fn self_powered(&self) -> bool {
        self.attributes & 0x40 != 0
    }
}

/// Interface descriptor.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterfaceDescriptor {
    /// bInterfaceNumber
    pub interface_number: u8,
    /// bAlternateSetting
    pub alternate_setting: u8,
    /// bNumEndpoints
    pub num_endpoints: u8,
    /// bInterfaceClass
    pub interface_class: u8,
    /// bInterfaceSubClass
    pub interface_sub_class: u8,
    /// bInterfaceProtocol
    pub interface_protocol: u8,
    /// iInterface
    pub interface_string: u8,
}

impl InterfaceDescriptor {
    /// Length of an interface descriptor.
    pub const LENGTH: usize = 9;

    /// Parses an interface descriptor.
    pub fn parse(bytes: &[u8]) -> ParseResult<InterfaceDescriptor> {
        let b = body(bytes, descriptor_type::INTERFACE, &[Self::LENGTH])?;

        Ok(InterfaceDescriptor {
            interface_number: b[0],
            alternate_setting: b[1],
            num_endpoints: b[2],
            interface_class: b[3],
            interface_sub_class: b[4],
            interface_protocol: b[5],
            interface_string: b[6],
        })
    }
}

/// Endpoint descriptor.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointDescriptor {
    /// bEndpointAddress
    pub address: EndpointAddress,
    /// bmAttributes
    pub attributes: u8,
    /// wMaxPacketSize, including the high-bandwidth multiplier bits
    pub max_packet_size: u16,
    /// bInterval
    pub interval: u8,
    /// bRefresh and bSynchAddress of the 9-byte audio class variant.
    pub audio: Option<[u8; 2]>,
}

impl EndpointDescriptor {
    /// Length of a standard endpoint descriptor.
    pub const LENGTH: usize = 7;

    /// Length of an audio class endpoint descriptor.
    pub const AUDIO_LENGTH: usize = 9;

    /// Parses an endpoint descriptor.
    pub fn parse(bytes: &[u8]) -> ParseResult<EndpointDescriptor> {
        let b = body(
            bytes,
            descriptor_type::ENDPOINT,
            &[Self::LENGTH, Self::AUDIO_LENGTH],
        )?;

        Ok(EndpointDescriptor {
            address: b[0].into(),
            attributes: b[1],
            max_packet_size: le16(b, 2),
            interval: b[4],
            audio: if b.len() == Self::AUDIO_LENGTH - 2 {
                Some([b[5], b[6]])
            } else {
                None
            },
        })
    }

    /// Transfer type.
    pub fn ep_type(&self) -> EndpointType {
        EndpointType::from_attributes(self.attributes)
    }

    /// Max packet size in bytes, without the high-bandwidth multiplier bits.
    pub fn packet_size(&self) -> u16 {
        self.max_packet_size & 0x07ff
    }

    /// Builds the endpoint map entry for this endpoint in `interface`.
    pub fn info(&self, interface: u8) -> EndpointInfo {
        EndpointInfo {
            interface,
            address: self.address,
            ep_type: self.ep_type(),
            max_packet_size: self.packet_size(),
            interval: self.interval,
        }
    }
}

/// A descriptor of any type, as found in a configuration descriptor blob.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RawDescriptor<'a> {
    /// bDescriptorType
    pub descriptor_type: u8,
    /// The whole descriptor including the header.
    pub bytes: &'a [u8],
}

/// Walks a buffer of concatenated descriptors by their declared lengths.
pub struct DescriptorIter<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> DescriptorIter<'a> {
    /// Creates an iterator over `buf`.
    pub fn new(buf: &'a [u8]) -> DescriptorIter<'a> {
        DescriptorIter { buf, failed: false }
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = ParseResult<RawDescriptor<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }

        if self.buf.len() < 2 {
            self.failed = true;
            return Some(Err(ParseError::Truncated));
        }

        let length = self.buf[0] as usize;
        if length < 2 {
            // Framing is lost, nothing after this can be trusted
            self.failed = true;
            return Some(Err(ParseError::InvalidLength));
        }
        if length > self.buf.len() {
            self.failed = true;
            return Some(Err(ParseError::Truncated));
        }

        let (bytes, rest) = self.buf.split_at(length);
        self.buf = rest;

        Some(Ok(RawDescriptor {
            descriptor_type: bytes[1],
            bytes,
        }))
    }
}

/// A selected interface and its endpoints.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedInterface {
    /// The interface descriptor.
    pub descriptor: InterfaceDescriptor,
    /// Its endpoint descriptors, in order.
    pub endpoints: heapless::Vec<EndpointDescriptor, MAX_INTERFACE_ENDPOINTS>,
}

/// The selected interfaces of a configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedConfiguration {
    /// The configuration header.
    pub descriptor: ConfigDescriptor,
    /// Selected interfaces, in order.
    pub interfaces: heapless::Vec<ParsedInterface, MAX_INTERFACES>,
    /// Number of interface or endpoint descriptors that were skipped because they were malformed.
    pub rejected: u8,
}

/// Parses a full configuration descriptor blob (header followed by interface, endpoint and other
/// descriptors, `wTotalLength` bytes in all).
///
/// Interfaces for which `select` returns false are discarded along with their endpoints.
/// Unknown, class-specific and vendor descriptors are skipped by their declared length. A
/// malformed interface or endpoint descriptor is skipped (an interface together with its
/// endpoints) and counted in `rejected`, without affecting the descriptors parsed before it.
/// Broken framing (a length that overruns the buffer) fails the whole parse.
pub fn parse_configuration(
    bytes: &[u8],
    mut select: impl FnMut(&InterfaceDescriptor) -> bool,
) -> ParseResult<ParsedConfiguration> {
    let descriptor = ConfigDescriptor::parse(bytes)?;

    let total = descriptor.total_length as usize;
    if bytes.len() < total {
        return Err(ParseError::TotalLengthMismatch);
    }

    let mut config = ParsedConfiguration {
        descriptor,
        interfaces: heapless::Vec::new(),
        rejected: 0,
    };

    // Whether endpoints currently belong to a selected interface
    let mut current: Option<usize> = None;

    for raw in DescriptorIter::new(&bytes[ConfigDescriptor::LENGTH..total]) {
        let raw = raw?;

        match raw.descriptor_type {
            descriptor_type::INTERFACE => {
                current = None;

                let iface = match InterfaceDescriptor::parse(raw.bytes) {
                    Ok(iface) => iface,
                    Err(_) => {
                        config.rejected = config.rejected.saturating_add(1);
                        continue;
                    }
                };

                if select(&iface) {
                    config
                        .interfaces
                        .push(ParsedInterface {
                            descriptor: iface,
                            endpoints: heapless::Vec::new(),
                        })
                        .map_err(|_| ParseError::TooManyInterfaces)?;

                    current = Some(config.interfaces.len() - 1);
                }
            }
            descriptor_type::ENDPOINT => {
                let ep = match EndpointDescriptor::parse(raw.bytes) {
                    Ok(ep) => ep,
                    Err(_) => {
                        config.rejected = config.rejected.saturating_add(1);
                        continue;
                    }
                };

                if let Some(i) = current {
                    config.interfaces[i]
                        .endpoints
                        .push(ep)
                        .map_err(|_| ParseError::TooManyEndpoints)?;
                }
            }
            descriptor_type::CONFIGURATION | descriptor_type::DEVICE => {
                return Err(ParseError::UnexpectedType {
                    expected: descriptor_type::INTERFACE,
                    found: raw.descriptor_type,
                });
            }
            _ => {
                // Class-specific, vendor or unknown; skipped by length
            }
        }
    }

    Ok(config)
}

/// Decodes the language ID list of string descriptor zero.
pub fn parse_languages(bytes: &[u8]) -> ParseResult<impl Iterator<Item = u16> + '_> {
    let b = string_body(bytes)?;

    Ok(b.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])))
}

/// Decodes a UTF-16LE string descriptor. Unpaired surrogates are replaced with U+FFFD.
pub fn parse_string<const N: usize>(bytes: &[u8]) -> ParseResult<heapless::String<N>> {
    let b = string_body(bytes)?;
    let units = b.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]]));

    let mut s = heapless::String::new();
    for c in core::char::decode_utf16(units) {
        s.push(c.unwrap_or(core::char::REPLACEMENT_CHARACTER))
            .map_err(|_| ParseError::Truncated)?;
    }

    Ok(s)
}

fn string_body(bytes: &[u8]) -> ParseResult<&[u8]> {
    if bytes.len() < 2 {
        return Err(ParseError::Truncated);
    }

    let length = bytes[0] as usize;
    if length > bytes.len() {
        return Err(ParseError::Truncated);
    }
    if length < 2 || length % 2 != 0 {
        return Err(ParseError::InvalidLength);
    }
    if bytes[1] != descriptor_type::STRING {
        return Err(ParseError::UnexpectedType {
            expected: descriptor_type::STRING,
            found: bytes[1],
        });
    }

    Ok(&bytes[2..length])
}

/// A writer for USB descriptors.
///
/// Emits descriptors back into their wire format. Used to re-serialize parsed records and to build
/// descriptor sets for simulated devices.
pub struct DescriptorWriter<'a> {
    buf: &'a mut [u8],
    position: usize,
    config_start: Option<usize>,
}

impl<'a> DescriptorWriter<'a> {
    /// Creates a writer that writes into `buf`.
    pub fn new(buf: &'a mut [u8]) -> DescriptorWriter<'a> {
        DescriptorWriter {
            buf,
            position: 0,
            config_start: None,
        }
    }

    /// Gets the current position in the buffer, i.e. the number of bytes written so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Writes an arbitrary (usually class-specific) descriptor. The length and type fields are
    /// written automatically, so `descriptor` should only contain the part following them.
    pub fn write(&mut self, descriptor_type: u8, descriptor: &[u8]) -> Result<()> {
        let length = descriptor.len();

        if (self.position + 2 + length) > self.buf.len() || (length + 2) > 255 {
            return Err(UsbError::BufferOverflow);
        }

        self.buf[self.position] = (length + 2) as u8;
        self.buf[self.position + 1] = descriptor_type;

        let start = self.position + 2;

        self.buf[start..start + length].copy_from_slice(descriptor);

        self.position = start + length;

        Ok(())
    }

    /// Writes already encoded descriptor bytes verbatim.
    pub fn raw(&mut self, bytes: &[u8]) -> Result<()> {
        if self.position + bytes.len() > self.buf.len() {
            return Err(UsbError::BufferOverflow);
        }

        self.buf[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();

        Ok(())
    }

    /// Writes a device descriptor.
    pub fn device(&mut self, d: &DeviceDescriptor) -> Result<()> {
        let usb = d.usb_release.to_le_bytes();
        let vid = d.vendor_id.to_le_bytes();
        let pid = d.product_id.to_le_bytes();
        let rel = d.device_release.to_le_bytes();

        self.write(
            descriptor_type::DEVICE,
            &[
                usb[0],
                usb[1], // bcdUSB
                d.device_class,       // bDeviceClass
                d.device_sub_class,   // bDeviceSubClass
                d.device_protocol,    // bDeviceProtocol
                d.max_packet_size_0,  // bMaxPacketSize0
                vid[0],
                vid[1], // idVendor
                pid[0],
                pid[1], // idProduct
                rel[0],
                rel[1], // bcdDevice
                d.manufacturer,       // iManufacturer
                d.product,            // iProduct
                d.serial_number,      // iSerialNumber
                d.num_configurations, // bNumConfigurations
            ],
        )
    }

    /// Writes a configuration descriptor header. The total length is written as given; call
    /// [`end_configuration`](DescriptorWriter::end_configuration) after the interfaces to patch it
    /// with the actual length instead.
    pub fn configuration(&mut self, c: &ConfigDescriptor) -> Result<()> {
        self.config_start = Some(self.position);

        let total = c.total_length.to_le_bytes();

        self.write(
            descriptor_type::CONFIGURATION,
            &[
                total[0],
                total[1], // wTotalLength
                c.num_interfaces,       // bNumInterfaces
                c.configuration_value,  // bConfigurationValue
                c.configuration_string, // iConfiguration
                c.attributes,           // bmAttributes
                c.max_power,            // bMaxPower
            ],
        )
    }

    /// Patches wTotalLength of the last configuration descriptor with the number of bytes written
    /// since its start.
    pub fn end_configuration(&mut self) {
        if let Some(start) = self.config_start.take() {
            let total = ((self.position - start) as u16).to_le_bytes();
            self.buf[start + 2..start + 4].copy_from_slice(&total);
        }
    }

    /// Writes an interface descriptor.
    pub fn interface(&mut self, i: &InterfaceDescriptor) -> Result<()> {
        self.write(
            descriptor_type::INTERFACE,
            &[
                i.interface_number,    // bInterfaceNumber
                i.alternate_setting,   // bAlternateSetting
                i.num_endpoints,       // bNumEndpoints
                i.interface_class,     // bInterfaceClass
                i.interface_sub_class, // bInterfaceSubClass
                i.interface_protocol,  // bInterfaceProtocol
                i.interface_string,    // iInterface
            ],
        )
    }

    /// Writes an endpoint descriptor.
    pub fn endpoint(&mut self, e: &EndpointDescriptor) -> Result<()> {
        let mps = e.max_packet_size.to_le_bytes();
        let addr: u8 = e.address.into();

        match e.audio {
            None => self.write(
                descriptor_type::ENDPOINT,
                &[
                    addr,         // bEndpointAddress
                    e.attributes, // bmAttributes
                    mps[0],
                    mps[1], // wMaxPacketSize
                    e.interval, // bInterval
                ],
            ),
            Some([refresh, synch_address]) => self.write(
                descriptor_type::ENDPOINT,
                &[
                    addr,
                    e.attributes,
                    mps[0],
                    mps[1],
                    e.interval,
                    refresh,       // bRefresh
                    synch_address, // bSynchAddress
                ],
            ),
        }
    }

    /// Writes a string descriptor.
    pub fn string(&mut self, string: &str) -> Result<()> {
        let mut pos = self.position;

        if pos + 2 > self.buf.len() {
            return Err(UsbError::BufferOverflow);
        }

        self.buf[pos] = 0; // length placeholder
        self.buf[pos + 1] = descriptor_type::STRING;

        pos += 2;

        for c in string.encode_utf16() {
            if pos + 2 > self.buf.len() || pos - self.position + 2 > 255 {
                return Err(UsbError::BufferOverflow);
            }

            self.buf[pos..pos + 2].copy_from_slice(&c.to_le_bytes());
            pos += 2;
        }

        self.buf[self.position] = (pos - self.position) as u8;

        self.position = pos;

        Ok(())
    }

    /// Writes string descriptor zero with a list of language IDs.
    pub fn languages(&mut self, lang_ids: &[u16]) -> Result<()> {
        let mut body = [0u8; 252];
        if lang_ids.len() * 2 > body.len() {
            return Err(UsbError::BufferOverflow);
        }

        for (chunk, id) in body.chunks_exact_mut(2).zip(lang_ids) {
            chunk.copy_from_slice(&id.to_le_bytes());
        }

        self.write(descriptor_type::STRING, &body[..lang_ids.len() * 2])
    }
}
