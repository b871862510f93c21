//! The interface between the host core and device class drivers.

use crate::control::Request;
use crate::control_pipe::ControlPipe;
use crate::descriptor::{DeviceDescriptor, InterfaceDescriptor};
use crate::endpoint::{EndpointAddress, EndpointMap};
use crate::phy::UsbPhy;
use crate::session::{BusOwner, Epoch, Session};
use crate::transaction::{DataToggle, Transaction, TransactionEngine, TransactionLog, TransactionResult};
use crate::{Result, Speed, UsbDirection, UsbError};

/// A device class driver. Drivers are offered the interfaces of the attached device while its
/// configuration is parsed and drive their own transfers once enumeration completes.
///
/// All methods have default implementations so that a driver only needs to implement the ones it
/// cares about.
pub trait ClassDriver {
    /// Called once per interface (alternate setting 0) of the configuration being parsed. Return
    /// true to claim the interface; its endpoints then become part of the
    /// [`EndpointMap`](crate::endpoint::EndpointMap).
    fn probe(&mut self, device: &DeviceDescriptor, interface: &InterfaceDescriptor) -> bool {
        let _ = (device, interface);
        false
    }

    /// Called after the full device descriptor has been read. Returning `Some(index)` asks for the
    /// configuration with that index instead of the first one. The first driver to answer wins.
    fn configuration(&mut self, device: &DeviceDescriptor) -> Option<u8> {
        let _ = device;
        None
    }

    /// Called when enumeration has completed and the driver has claimed at least one interface.
    /// The endpoint map stays valid until [`reset`](ClassDriver::reset) is called.
    fn attach(&mut self, device: &DeviceDescriptor, endpoints: &EndpointMap) {
        let _ = (device, endpoints);
    }

    /// Called whenever the device is reset, disconnected or re-enumerated. Everything learned from
    /// the previous session should be forgotten.
    fn reset(&mut self) {}

    /// Called on every host poll while the device is configured and the driver is attached.
    fn poll(&mut self, device: &mut DeviceHandle<'_>) -> Result<()> {
        let _ = device;
        Ok(())
    }
}

/// Mutable access to everything a transaction touches, borrowed from the host for one poll.
pub(crate) struct Bus<'a, P: UsbPhy, L: TransactionLog> {
    pub phy: &'a mut P,
    pub engine: &'a mut TransactionEngine<L>,
    pub session: &'a mut Session,
    pub pipe: &'a mut ControlPipe,
}

/// Type-erased [`Bus`], so that class drivers can be used as trait objects.
pub(crate) trait HostBus {
    fn session(&self) -> &Session;

    fn execute(&mut self, tx: &Transaction) -> TransactionResult;

    fn control_in(&mut self, address: u8, mps: u8, req: Request, buf: &mut [u8]) -> Result<usize>;

    fn control_out(&mut self, address: u8, mps: u8, req: Request, data: &[u8]) -> Result<()>;

    fn toggle(&self, ep_addr: EndpointAddress) -> DataToggle;

    fn clear_toggle(&mut self, ep_addr: EndpointAddress);
}

impl<P: UsbPhy, L: TransactionLog> HostBus for Bus<'_, P, L> {
    fn session(&self) -> &Session {
        self.session
    }

    fn execute(&mut self, tx: &Transaction) -> TransactionResult {
        self.engine.execute(self.phy, self.session, tx)
    }

    fn control_in(&mut self, address: u8, mps: u8, req: Request, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < req.length as usize {
            return Err(UsbError::BufferOverflow);
        }

        self.pipe.start_in(self.session, address, mps, req)?;
        let len = self.pipe.run(self.engine, self.phy, self.session)?;

        buf[..len].copy_from_slice(&self.pipe.data()[..len]);
        Ok(len)
    }

    fn control_out(&mut self, address: u8, mps: u8, req: Request, data: &[u8]) -> Result<()> {
        self.pipe.start_out(self.session, address, mps, req, data)?;
        self.pipe.run(self.engine, self.phy, self.session)?;
        Ok(())
    }

    fn toggle(&self, ep_addr: EndpointAddress) -> DataToggle {
        self.engine.toggle(ep_addr)
    }

    fn clear_toggle(&mut self, ep_addr: EndpointAddress) {
        self.engine.clear_toggle(ep_addr);
    }
}

/// A transaction-issuing handle for the configured device, scoped to its address and endpoints.
///
/// Handles are only given out while the device is configured and cannot outlive the host poll
/// they were created in.
pub struct DeviceHandle<'h> {
    bus: &'h mut dyn HostBus,
    device: &'h DeviceDescriptor,
    endpoints: &'h EndpointMap,
    address: u8,
}

impl<'h> DeviceHandle<'h> {
    pub(crate) fn new(
        bus: &'h mut dyn HostBus,
        device: &'h DeviceDescriptor,
        endpoints: &'h EndpointMap,
    ) -> DeviceHandle<'h> {
        let address = bus.session().address();

        DeviceHandle {
            bus,
            device,
            endpoints,
            address,
        }
    }

    /// The device address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The negotiated speed.
    pub fn speed(&self) -> Option<Speed> {
        self.bus.session().speed()
    }

    /// The current session.
    pub fn epoch(&self) -> Epoch {
        self.bus.session().epoch()
    }

    /// The device descriptor.
    pub fn device(&self) -> &DeviceDescriptor {
        self.device
    }

    /// The endpoints of the claimed interfaces.
    pub fn endpoints(&self) -> &EndpointMap {
        self.endpoints
    }

    /// Checks that something recorded in session `epoch` (usually the epoch of an
    /// [`EndpointMap`] kept since [`ClassDriver::attach`]) still belongs to the current session.
    ///
    /// # Errors
    ///
    /// * [`StaleSession`](crate::UsbError::StaleSession) - The bus has been reset since.
    pub fn check_epoch(&self, epoch: Epoch) -> Result<()> {
        if self.bus.session().is_current(epoch) {
            Ok(())
        } else {
            Err(UsbError::StaleSession)
        }
    }

    /// Executes a single transaction with the device.
    ///
    /// # Errors
    ///
    /// * [`InvalidEndpoint`](crate::UsbError::InvalidEndpoint) - The transaction is for another
    ///   address, or for an endpoint that is not in the endpoint map.
    /// * [`StaleSession`](crate::UsbError::StaleSession) - The endpoint map is from an earlier
    ///   session.
    /// * [`InvalidState`](crate::UsbError::InvalidState) - The bus has been taken back by the
    ///   enumerator.
    pub fn execute(&mut self, tx: &Transaction) -> Result<TransactionResult> {
        self.check_access()?;

        if tx.address() != self.address {
            return Err(UsbError::InvalidEndpoint);
        }

        if tx.endpoint() != 0 {
            let direction = tx.direction();
            if !self
                .endpoints
                .iter()
                .any(|e| e.address.number() == tx.endpoint() && e.direction() == direction)
            {
                return Err(UsbError::InvalidEndpoint);
            }
        }

        Ok(self.bus.execute(tx))
    }

    /// Reads one packet from an IN endpoint into `buf` and returns its length.
    ///
    /// # Errors
    ///
    /// * [`InvalidEndpoint`](crate::UsbError::InvalidEndpoint) - The endpoint is not an IN
    ///   endpoint in the endpoint map.
    /// * [`BufferOverflow`](crate::UsbError::BufferOverflow) - `buf` is smaller than the packet.
    /// * [`Nak`](crate::UsbError::Nak) - No data available.
    pub fn read(&mut self, ep_addr: EndpointAddress, buf: &mut [u8]) -> Result<usize> {
        let max_packet_size = self.lookup(ep_addr, UsbDirection::In)?;

        let tx = Transaction::input(self.address, ep_addr.number(), max_packet_size);
        let payload = self.execute(&tx)?.into_result()?;

        if payload.len() > buf.len() {
            return Err(UsbError::BufferOverflow);
        }

        buf[..payload.len()].copy_from_slice(&payload);
        Ok(payload.len())
    }

    /// Writes one packet to an OUT endpoint.
    ///
    /// # Errors
    ///
    /// * [`InvalidEndpoint`](crate::UsbError::InvalidEndpoint) - The endpoint is not an OUT
    ///   endpoint in the endpoint map.
    /// * [`BufferOverflow`](crate::UsbError::BufferOverflow) - `data` is longer than the
    ///   endpoint's max packet size.
    /// * [`Nak`](crate::UsbError::Nak) - The device cannot accept data right now.
    pub fn write(&mut self, ep_addr: EndpointAddress, data: &[u8]) -> Result<()> {
        let max_packet_size = self.lookup(ep_addr, UsbDirection::Out)?;

        if data.len() > max_packet_size as usize {
            return Err(UsbError::BufferOverflow);
        }

        let tx = Transaction::output(self.address, ep_addr.number(), data)?;
        self.execute(&tx)?.into_result()?;
        Ok(())
    }

    /// Performs a control read on endpoint 0 and returns the number of bytes received.
    pub fn control_in(&mut self, req: Request, buf: &mut [u8]) -> Result<usize> {
        self.check_access()?;

        self.bus
            .control_in(self.address, self.device.max_packet_size_0, req, buf)
    }

    /// Performs a control write on endpoint 0.
    pub fn control_out(&mut self, req: Request, data: &[u8]) -> Result<()> {
        self.check_access()?;

        self.bus
            .control_out(self.address, self.device.max_packet_size_0, req, data)
    }

    /// Clears a halt condition on an endpoint and resets its data toggle.
    pub fn clear_halt(&mut self, ep_addr: EndpointAddress) -> Result<()> {
        self.control_out(Request::clear_halt(ep_addr.into()), &[])?;
        self.bus.clear_toggle(ep_addr);
        Ok(())
    }

    /// The data toggle the next transaction with `ep_addr` will use.
    pub fn toggle(&self, ep_addr: EndpointAddress) -> DataToggle {
        self.bus.toggle(ep_addr)
    }

    // Class drivers may only use the bus once the enumerator has handed it over.
    fn check_access(&self) -> Result<()> {
        if self.bus.session().owner() != BusOwner::Class {
            return Err(UsbError::InvalidState);
        }

        self.check_epoch(self.endpoints.epoch())
    }

    fn lookup(&self, ep_addr: EndpointAddress, direction: UsbDirection) -> Result<u16> {
        self.endpoints
            .iter()
            .find(|e| e.address == ep_addr && e.direction() == direction)
            .map(|e| e.max_packet_size)
            .ok_or(UsbError::InvalidEndpoint)
    }
}
