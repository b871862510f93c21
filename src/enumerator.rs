//! The enumeration state machine.
//!
//! Brings a freshly attached device from bus reset to a selected configuration, one small step
//! per [`UsbHost::poll`](crate::host::UsbHost::poll):
//!
//! ```text
//! Idle -> AwaitReset -> DetectSpeed -> FetchDeviceDescHead -> AssignAddress
//!      -> FetchDeviceDescFull -> FetchConfigDesc -> ParseConfig -> SelectConfig -> Ready
//! ```
//!
//! Any step that keeps failing ends in `Failed`. Both terminal states are left only through a
//! reset, either forced by the [`Watchdog`](crate::watchdog::Watchdog) or caused by a disconnect.

use crate::class::{Bus, ClassDriver};
use crate::control::Request;
use crate::control_pipe::CONTROL_BUF_LEN;
use crate::descriptor::{self, ConfigDescriptor, DeviceDescriptor, ParseError};
use crate::endpoint::EndpointMap;
use crate::host::HostConfig;
use crate::phy::UsbPhy;
use crate::reset::{ResetController, ResetOutcome};
use crate::session::{BusOwner, Epoch};
use crate::time::Instant;
use crate::transaction::TransactionLog;
use crate::{Result, Speed, UsbError};
use core::task::Poll;

/// Maximum number of class drivers a host can be polled with.
pub const MAX_CLASSES: usize = 32;

/// Packet size used on endpoint 0 until the device descriptor says otherwise.
const DEFAULT_MAX_PACKET_SIZE_0: u8 = 8;

/// Enumeration progress. The variants are declared in the order they are passed through.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EnumerationState {
    /// Nothing is happening. A reset is started on the next poll.
    Idle,

    /// Waiting for a device to attach and for bus reset to complete.
    AwaitReset,

    /// Speed is known. Waiting for the device to settle after reset.
    DetectSpeed,

    /// Reading the first 8 bytes of the device descriptor at address 0.
    FetchDeviceDescHead,

    /// Assigning the device address.
    AssignAddress,

    /// Reading the full device descriptor.
    FetchDeviceDescFull,

    /// Reading the configuration descriptor header and then the whole configuration.
    FetchConfigDesc,

    /// Parsing the configuration and building the endpoint map.
    ParseConfig,

    /// Selecting the configuration.
    SelectConfig,

    /// The device is configured and owned by the class drivers.
    Ready,

    /// A step failed too many times. Only the watchdog gets the device out of this state.
    Failed,
}

impl EnumerationState {
    /// Whether `self` comes after `prev` in the enumeration sequence. [`Failed`] is not progress.
    ///
    /// [`Failed`]: EnumerationState::Failed
    pub fn is_progress_from(self, prev: EnumerationState) -> bool {
        self != EnumerationState::Failed && self > prev
    }
}

/// Sequences the standard requests that configure a device.
pub struct Enumerator {
    state: EnumerationState,
    config: HostConfig,
    attempts: u8,
    recovery_until: Option<Instant>,
    speed: Option<Speed>,
    max_packet_size_0: u8,
    device: Option<DeviceDescriptor>,
    preferred_configuration: Option<u8>,
    configuration_index: u8,
    config_header: Option<ConfigDescriptor>,
    pending: Option<EndpointMap>,
    endpoints: Option<EndpointMap>,
    claimed: u32,
}

impl Enumerator {
    pub(crate) fn new(config: HostConfig) -> Enumerator {
        Enumerator {
            state: EnumerationState::Idle,
            config,
            attempts: 0,
            recovery_until: None,
            speed: None,
            max_packet_size_0: DEFAULT_MAX_PACKET_SIZE_0,
            device: None,
            preferred_configuration: None,
            configuration_index: 0,
            config_header: None,
            pending: None,
            endpoints: None,
            claimed: 0,
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> EnumerationState {
        self.state
    }

    /// Failed attempts at the current step.
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    /// The speed negotiated by the last reset.
    pub fn speed(&self) -> Option<Speed> {
        self.speed
    }

    /// The device descriptor, once it has been read.
    pub fn device_descriptor(&self) -> Option<&DeviceDescriptor> {
        self.device.as_ref()
    }

    /// The endpoint map. Only available in the [`Ready`](EnumerationState::Ready) state.
    pub fn endpoint_map(&self) -> Option<&EndpointMap> {
        match self.state {
            EnumerationState::Ready => self.endpoints.as_ref(),
            _ => None,
        }
    }

    /// Whether the class driver at `index` of the list passed to poll claimed an interface.
    pub fn is_claimed(&self, index: usize) -> bool {
        index < MAX_CLASSES && self.claimed & (1 << index) != 0
    }

    /// Asks for the configuration with `index` instead of the first one. Takes effect if set
    /// before [`FetchConfigDesc`](EnumerationState::FetchConfigDesc) and persists across resets.
    pub fn prefer_configuration(&mut self, index: Option<u8>) {
        self.preferred_configuration = index;
    }

    /// Forces the state machine back to [`Idle`](EnumerationState::Idle) and forgets everything
    /// about the device.
    pub(crate) fn abort(&mut self) {
        if self.state != EnumerationState::Idle {
            usb_debug!("enum: {:?} -> Idle (abort)", self.state);
        }

        self.state = EnumerationState::Idle;
        self.attempts = 0;
        self.recovery_until = None;
        self.speed = None;
        self.max_packet_size_0 = DEFAULT_MAX_PACKET_SIZE_0;
        self.device = None;
        self.config_header = None;
        self.pending = None;
        self.endpoints = None;
        self.claimed = 0;
    }

    /// Advances enumeration by at most one state.
    pub(crate) fn poll<P: UsbPhy, L: TransactionLog>(
        &mut self,
        bus: &mut Bus<'_, P, L>,
        reset: &mut ResetController,
        outcome: Option<ResetOutcome>,
        classes: &mut [&mut dyn ClassDriver],
    ) {
        match self.state {
            EnumerationState::Idle => {
                reset.reset(bus.phy, bus.session);
                self.transition(EnumerationState::AwaitReset);
            }

            EnumerationState::AwaitReset => match outcome {
                Some(ResetOutcome::Speed(speed)) => {
                    self.speed = Some(speed);
                    self.transition(EnumerationState::DetectSpeed);
                }
                Some(ResetOutcome::NoDevice) => self.transition(EnumerationState::Idle),
                _ => {}
            },

            EnumerationState::DetectSpeed => {
                // Counted in 1 ms frames, so the reset recovery time is the same at every speed
                let markers = match self.speed {
                    Some(Speed::High) => self.config.ready_delay_frames.saturating_mul(8),
                    _ => self.config.ready_delay_frames,
                };

                if bus.engine.frames().emitted() >= markers {
                    self.transition(EnumerationState::FetchDeviceDescHead);
                }
            }

            EnumerationState::FetchDeviceDescHead => {
                let req = Request::get_device_descriptor(8);

                match self.control_in(bus, 0, DEFAULT_MAX_PACKET_SIZE_0, req) {
                    Poll::Pending => {}
                    Poll::Ready(res) => {
                        match res.and_then(|_| self.check_head(bus.pipe.data())) {
                            Ok(mps) => {
                                usb_debug!("enum: bMaxPacketSize0 {}", mps);
                                self.max_packet_size_0 = mps;
                                self.transition(EnumerationState::AssignAddress);
                            }
                            Err(err) => self.fail(err),
                        }
                    }
                }
            }

            EnumerationState::AssignAddress => {
                if let Some(until) = self.recovery_until {
                    if bus.phy.now() >= until {
                        self.recovery_until = None;
                        self.transition(EnumerationState::FetchDeviceDescFull);
                    }
                    return;
                }

                let address = self.config.device_address;
                let req = Request::set_address(address);

                match self.control_out(bus, 0, req) {
                    Poll::Pending => {}
                    Poll::Ready(Ok(())) => {
                        usb_debug!("enum: address {}", address);
                        bus.session.address = address;
                        self.recovery_until = Some(bus.phy.now() + self.config.set_address_recovery);
                    }
                    Poll::Ready(Err(err)) => self.fail(err),
                }
            }

            EnumerationState::FetchDeviceDescFull => {
                let req = Request::get_device_descriptor(DeviceDescriptor::LENGTH as u16);
                let (address, mps) = (bus.session.address(), self.max_packet_size_0);

                match self.control_in(bus, address, mps, req) {
                    Poll::Pending => {}
                    Poll::Ready(res) => {
                        let res = res.and_then(|_| {
                            DeviceDescriptor::parse(bus.pipe.data()).map_err(UsbError::from)
                        });

                        match res {
                            Ok(device) => self.device_found(device, classes),
                            Err(err) => self.fail(err),
                        }
                    }
                }
            }

            EnumerationState::FetchConfigDesc => {
                let (address, mps) = (bus.session.address(), self.max_packet_size_0);
                let index = self.configuration_index;

                let length = match self.config_header {
                    Some(header) => header.total_length,
                    None => ConfigDescriptor::LENGTH as u16,
                };
                let req = Request::get_configuration_descriptor(index, length);

                let res = match self.control_in(bus, address, mps, req) {
                    Poll::Pending => return,
                    Poll::Ready(res) => res,
                };

                let res = res.and_then(|len| match self.config_header {
                    None => {
                        let header = ConfigDescriptor::parse(bus.pipe.data())?;
                        if header.total_length as usize > CONTROL_BUF_LEN {
                            usb_warn!("enum: configuration too large ({})", header.total_length);
                            return Err(UsbError::BufferOverflow);
                        }
                        self.config_header = Some(header);
                        Ok(false)
                    }
                    Some(header) if len == header.total_length as usize => Ok(true),
                    Some(_) => Err(UsbError::Parse(ParseError::TotalLengthMismatch)),
                });

                match res {
                    Ok(true) => self.transition(EnumerationState::ParseConfig),
                    Ok(false) => {}
                    Err(err) => {
                        self.config_header = None;
                        self.fail(err);
                    }
                }
            }

            EnumerationState::ParseConfig => {
                match self.build_map(bus.pipe.data(), bus.session.epoch(), classes) {
                    Ok(map) => {
                        usb_debug!("enum: {} endpoints", map.len());
                        self.pending = Some(map);
                        self.transition(EnumerationState::SelectConfig);
                    }
                    Err(err) => {
                        // Fetch the configuration again
                        self.config_header = None;
                        self.state = EnumerationState::FetchConfigDesc;
                        self.fail(err);
                    }
                }
            }

            EnumerationState::SelectConfig => {
                let value = match &self.pending {
                    Some(map) => map.configuration_value(),
                    None => {
                        self.fail(UsbError::InvalidState);
                        return;
                    }
                };

                let address = bus.session.address();
                match self.control_out(bus, address, Request::set_configuration(value)) {
                    Poll::Pending => {}
                    Poll::Ready(Ok(())) => {
                        bus.engine.reset_toggles();
                        bus.session.owner = BusOwner::Class;
                        self.endpoints = self.pending.take();
                        self.transition(EnumerationState::Ready);
                        self.attach(classes);
                    }
                    Poll::Ready(Err(err)) => self.fail(err),
                }
            }

            EnumerationState::Ready | EnumerationState::Failed => {}
        }
    }

    fn check_head(&self, data: &[u8]) -> Result<u8> {
        let mps = DeviceDescriptor::parse_head(data)?;

        if self.speed == Some(Speed::High) && mps != 64 {
            return Err(UsbError::Parse(ParseError::InvalidMaxPacketSize));
        }

        Ok(mps)
    }

    fn device_found(&mut self, device: DeviceDescriptor, classes: &mut [&mut dyn ClassDriver]) {
        usb_debug!(
            "enum: device {:x}:{:x}, {} configurations",
            device.vendor_id,
            device.product_id,
            device.num_configurations
        );

        if device.num_configurations == 0 {
            self.fail(UsbError::InvalidState);
            return;
        }

        if device.is_hub() {
            usb_warn!("enum: device is a hub, downstream ports are not enumerated");
        }

        let requested = self
            .preferred_configuration
            .or_else(|| classes.iter_mut().find_map(|c| c.configuration(&device)));

        self.configuration_index = match requested {
            Some(index) if index < device.num_configurations => index,
            Some(index) => {
                usb_warn!("enum: no configuration {}, using 0", index);
                0
            }
            None => 0,
        };

        self.device = Some(device);
        self.config_header = None;
        self.transition(EnumerationState::FetchConfigDesc);
    }

    fn build_map(
        &mut self,
        data: &[u8],
        epoch: Epoch,
        classes: &mut [&mut dyn ClassDriver],
    ) -> Result<EndpointMap> {
        let device = self.device.ok_or(UsbError::InvalidState)?;
        let mut claimed = 0u32;

        let parsed = descriptor::parse_configuration(data, |iface| {
            if iface.alternate_setting != 0 {
                return false;
            }

            if classes.is_empty() {
                return true;
            }

            let mut wanted = false;
            for (i, class) in classes.iter_mut().enumerate().take(MAX_CLASSES) {
                if class.probe(&device, iface) {
                    claimed |= 1 << i;
                    wanted = true;
                }
            }
            wanted
        })?;

        if parsed.rejected > 0 {
            usb_warn!("enum: skipped {} malformed descriptors", parsed.rejected);
        }

        let mut map = EndpointMap::new(parsed.descriptor.configuration_value, epoch);
        for iface in parsed.interfaces.iter() {
            for ep in iface.endpoints.iter() {
                map.insert(ep.info(iface.descriptor.interface_number))?;
            }
        }

        self.claimed = claimed;
        Ok(map)
    }

    fn attach(&mut self, classes: &mut [&mut dyn ClassDriver]) {
        let (device, map) = match (&self.device, &self.endpoints) {
            (Some(device), Some(map)) => (device, map),
            _ => return,
        };

        for (i, class) in classes.iter_mut().enumerate().take(MAX_CLASSES) {
            if self.claimed & (1 << i) != 0 {
                class.attach(device, map);
            }
        }
    }

    fn control_in<P: UsbPhy, L: TransactionLog>(
        &mut self,
        bus: &mut Bus<'_, P, L>,
        address: u8,
        max_packet_size: u8,
        req: Request,
    ) -> Poll<Result<usize>> {
        if !bus.pipe.is_active() {
            if let Err(err) = bus.pipe.start_in(bus.session, address, max_packet_size, req) {
                return Poll::Ready(Err(err));
            }
        }

        self.step(bus)
    }

    fn control_out<P: UsbPhy, L: TransactionLog>(
        &mut self,
        bus: &mut Bus<'_, P, L>,
        address: u8,
        req: Request,
    ) -> Poll<Result<()>> {
        if !bus.pipe.is_active() {
            let mps = self.max_packet_size_0;
            if let Err(err) = bus.pipe.start_out(bus.session, address, mps, req, &[]) {
                return Poll::Ready(Err(err));
            }
        }

        self.step(bus).map(|res| res.map(|_| ()))
    }

    fn step<P: UsbPhy, L: TransactionLog>(&mut self, bus: &mut Bus<'_, P, L>) -> Poll<Result<usize>> {
        match bus.pipe.step(bus.engine, bus.phy, bus.session) {
            Err(UsbError::WouldBlock) => Poll::Pending,
            res => Poll::Ready(res),
        }
    }

    fn transition(&mut self, next: EnumerationState) {
        usb_debug!("enum: {:?} -> {:?}", self.state, next);

        if next.is_progress_from(self.state) {
            self.attempts = 0;
        }
        self.state = next;
    }

    fn fail(&mut self, err: UsbError) {
        if err == UsbError::StaleSession {
            self.abort();
            return;
        }

        self.attempts = self.attempts.saturating_add(1);
        usb_warn!(
            "enum: {:?} failed: {:?} (attempt {} of {})",
            self.state,
            err,
            self.attempts,
            self.config.max_attempts
        );

        if self.attempts >= self.config.max_attempts {
            usb_warn!("enum: giving up");
            self.transition(EnumerationState::Failed);
        }
    }
}
