use crate::session::Epoch;
use crate::{Result, UsbDirection, UsbError};
use core::convert::TryFrom;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Maximum number of non-control endpoints on a device: 15 in each direction.
pub const MAX_ENDPOINTS: usize = 30;

/// USB endpoint transfer type. The values of this enum can be directly cast into `u8` to get the
/// bmAttributes transfer type bits.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointType {
    /// Control endpoint. Used for device management. Only the host can initiate requests. Usually
    /// used only endpoint 0.
    Control = 0b00,

    /// Isochronous endpoint. Used for time-critical unreliable data. Never driven by this crate.
    Isochronous = 0b01,

    /// Bulk endpoint. Used for large amounts of best-effort reliable data.
    Bulk = 0b10,

    /// Interrupt endpoint. Used for small amounts of time-critical reliable data.
    Interrupt = 0b11,
}

impl EndpointType {
    /// Extracts the transfer type from a bmAttributes field.
    pub fn from_attributes(attributes: u8) -> EndpointType {
        // Two bits always map to a variant
        EndpointType::try_from(attributes & 0b11).unwrap_or(EndpointType::Control)
    }
}

/// USB endpoint address that contains a direction and number.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointAddress(u8);

impl From<u8> for EndpointAddress {
    #[inline]
    fn from(addr: u8) -> EndpointAddress {
        EndpointAddress(addr)
    }
}

impl From<EndpointAddress> for u8 {
    #[inline]
    fn from(addr: EndpointAddress) -> u8 {
        addr.0
    }
}

impl EndpointAddress {
    const INBITS: u8 = UsbDirection::In as u8;

    /// Constructs a new EndpointAddress with the given number and direction.
    #[inline]
    pub fn from_parts(number: u8, dir: UsbDirection) -> Self {
        EndpointAddress((number & 0x0f) | dir as u8)
    }

    /// Gets the direction part of the address.
    #[inline]
    pub fn direction(&self) -> UsbDirection {
        if (self.0 & Self::INBITS) != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    /// Gets the number part of the endpoint address.
    #[inline]
    pub fn number(&self) -> u8 {
        self.0 & 0x0f
    }
}

/// What a class driver needs to know to drive one endpoint.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointInfo {
    /// Interface number the endpoint belongs to.
    pub interface: u8,
    /// Endpoint address.
    pub address: EndpointAddress,
    /// Transfer type.
    pub ep_type: EndpointType,
    /// Maximum packet size in bytes.
    pub max_packet_size: u16,
    /// Polling interval for interrupt endpoints.
    pub interval: u8,
}

impl EndpointInfo {
    /// Transfer direction.
    pub fn direction(&self) -> UsbDirection {
        self.address.direction()
    }
}

/// The endpoints of the selected interfaces of a configured device, keyed by interface number and
/// endpoint address.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EndpointMap {
    configuration_value: u8,
    epoch: Epoch,
    endpoints: heapless::Vec<EndpointInfo, MAX_ENDPOINTS>,
}

impl EndpointMap {
    pub(crate) fn new(configuration_value: u8, epoch: Epoch) -> EndpointMap {
        EndpointMap {
            configuration_value,
            epoch,
            endpoints: heapless::Vec::new(),
        }
    }

    /// Adds an endpoint.
    ///
    /// # Errors
    ///
    /// * [`InvalidEndpoint`](crate::UsbError::InvalidEndpoint) - The address is already taken
    ///   or refers to endpoint 0.
    /// * [`BufferOverflow`](crate::UsbError::BufferOverflow) - The map is full.
    pub(crate) fn insert(&mut self, info: EndpointInfo) -> Result<()> {
        if info.address.number() == 0 || self.endpoints.iter().any(|e| e.address == info.address) {
            return Err(UsbError::InvalidEndpoint);
        }

        self.endpoints
            .push(info)
            .map_err(|_| UsbError::BufferOverflow)
    }

    /// The bConfigurationValue of the configuration these endpoints belong to.
    pub fn configuration_value(&self) -> u8 {
        self.configuration_value
    }

    /// The session this map was built in. A map from an earlier session must not be used to
    /// issue transactions.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Looks up an endpoint by interface number and address.
    pub fn get(&self, interface: u8, address: EndpointAddress) -> Option<&EndpointInfo> {
        self.endpoints
            .iter()
            .find(|e| e.interface == interface && e.address == address)
    }

    /// Finds the first endpoint of an interface with the given direction and type.
    pub fn find(
        &self,
        interface: u8,
        direction: UsbDirection,
        ep_type: EndpointType,
    ) -> Option<&EndpointInfo> {
        self.endpoints.iter().find(|e| {
            e.interface == interface && e.direction() == direction && e.ep_type == ep_type
        })
    }

    /// Iterates over all endpoints.
    pub fn iter(&self) -> impl Iterator<Item = &EndpointInfo> {
        self.endpoints.iter()
    }

    /// Number of endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether the map has no endpoints.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
