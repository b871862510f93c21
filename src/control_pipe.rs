use crate::control::Request;
use crate::phy::UsbPhy;
use crate::session::{Epoch, Session};
use crate::transaction::{DataToggle, Transaction, TransactionEngine, TransactionLog};
use crate::{Result, UsbDirection, UsbError};
use core::cmp::min;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum ControlState {
    Idle,
    Setup,
    DataIn,
    DataOut,
    StatusIn,
    StatusOut,
}

// Maximum length of a control transfer data stage in bytes. 512 bytes by default, which holds the
// configuration descriptor of most devices. Define the feature "descriptor-buffer-1024" for
// devices with larger descriptor sets.
#[cfg(not(feature = "descriptor-buffer-1024"))]
pub(crate) const CONTROL_BUF_LEN: usize = 512;
#[cfg(feature = "descriptor-buffer-1024")]
pub(crate) const CONTROL_BUF_LEN: usize = 1024;

/// Runs control transfers on endpoint 0 one stage at a time.
///
/// Every call to [`step`](ControlPipe::step) performs at most one transaction, so time passes
/// between stages. The transfer is bound to the session it was started in and is abandoned if
/// the bus is reset in the meantime.
pub(crate) struct ControlPipe {
    state: ControlState,
    request: Option<Request>,
    address: u8,
    max_packet_size: u8,
    epoch: Epoch,
    toggle: DataToggle,
    buf: [u8; CONTROL_BUF_LEN],
    i: usize,
    len: usize,
}

impl ControlPipe {
    pub fn new() -> ControlPipe {
        ControlPipe {
            state: ControlState::Idle,
            request: None,
            address: 0,
            max_packet_size: 8,
            epoch: Epoch::default(),
            toggle: DataToggle::Data0,
            buf: [0; CONTROL_BUF_LEN],
            i: 0,
            len: 0,
        }
    }

    /// Whether a transfer is in progress.
    pub fn is_active(&self) -> bool {
        self.state != ControlState::Idle
    }

    /// Data received by the last completed IN transfer.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Abandons any transfer in progress.
    pub fn abort(&mut self) {
        self.state = ControlState::Idle;
        self.request = None;
        self.len = 0;
    }

    /// Starts a device-to-host transfer reading at most `req.length` bytes.
    pub fn start_in(
        &mut self,
        session: &Session,
        address: u8,
        max_packet_size: u8,
        req: Request,
    ) -> Result<()> {
        if req.direction != UsbDirection::In {
            return Err(UsbError::InvalidState);
        }

        if req.length as usize > self.buf.len() {
            return Err(UsbError::BufferOverflow);
        }

        self.start(session, address, max_packet_size, req);
        self.len = req.length as usize;
        Ok(())
    }

    /// Starts a host-to-device transfer sending `data`, which must be exactly `req.length` bytes.
    pub fn start_out(
        &mut self,
        session: &Session,
        address: u8,
        max_packet_size: u8,
        req: Request,
        data: &[u8],
    ) -> Result<()> {
        if req.direction != UsbDirection::Out || data.len() != req.length as usize {
            return Err(UsbError::InvalidState);
        }

        if data.len() > self.buf.len() {
            return Err(UsbError::BufferOverflow);
        }

        self.start(session, address, max_packet_size, req);
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }

    fn start(&mut self, session: &Session, address: u8, max_packet_size: u8, req: Request) {
        self.state = ControlState::Setup;
        self.request = Some(req);
        self.address = address;
        self.max_packet_size = max_packet_size;
        self.epoch = session.epoch();
        self.i = 0;
    }

    /// Performs the next stage of the transfer.
    ///
    /// Returns `Err(WouldBlock)` while stages remain and `Ok(len)` with the number of bytes moved
    /// in the data stage once the status stage completes. Any other error ends the transfer.
    ///
    /// # Errors
    ///
    /// * [`StaleSession`](crate::UsbError::StaleSession) - The bus was reset since the transfer
    ///   started. Nothing from the old transfer is kept.
    /// * [`Nak`](crate::UsbError::Nak), [`Stall`](crate::UsbError::Stall),
    ///   [`Timeout`](crate::UsbError::Timeout), [`BusError`](crate::UsbError::BusError) - A stage
    ///   failed.
    pub fn step<P: UsbPhy + ?Sized, L: TransactionLog>(
        &mut self,
        engine: &mut TransactionEngine<L>,
        phy: &mut P,
        session: &Session,
    ) -> Result<usize> {
        let req = match (self.state, self.request) {
            (ControlState::Idle, _) | (_, None) => return Err(UsbError::InvalidState),
            (_, Some(req)) => req,
        };

        if !session.is_current(self.epoch) {
            usb_debug!("control: dropping transfer from session {}", self.epoch.value());
            self.abort();
            return Err(UsbError::StaleSession);
        }

        match self.state {
            ControlState::Setup => {
                let tx = Transaction::setup(self.address, &req.to_bytes());
                self.check(engine.execute(phy, session, &tx).into_result())?;

                self.toggle = DataToggle::Data1;
                self.state = match (req.length, req.direction) {
                    (0, _) => ControlState::StatusIn,
                    (_, UsbDirection::In) => ControlState::DataIn,
                    (_, UsbDirection::Out) => ControlState::DataOut,
                };
            }

            ControlState::DataIn => {
                let tx = Transaction::input(self.address, 0, self.max_packet_size as u16)
                    .with_toggle(self.toggle);
                let payload = self.check(engine.execute(phy, session, &tx).into_result())?;

                let count = min(payload.len(), self.len - self.i);
                self.buf[self.i..self.i + count].copy_from_slice(&payload[..count]);
                self.i += count;
                self.toggle = self.toggle.next();

                // A short packet or the requested length ends the data stage
                if payload.len() < self.max_packet_size as usize || self.i >= self.len {
                    self.len = self.i;
                    self.state = ControlState::StatusOut;
                }
            }

            ControlState::DataOut => {
                let count = min(self.len - self.i, self.max_packet_size as usize);
                let tx = Transaction::output(self.address, 0, &self.buf[self.i..self.i + count]);
                let tx = self.check(tx)?.with_toggle(self.toggle);
                self.check(engine.execute(phy, session, &tx).into_result())?;

                self.i += count;
                self.toggle = self.toggle.next();

                if self.i >= self.len {
                    self.state = ControlState::StatusIn;
                }
            }

            ControlState::StatusIn => {
                let tx = Transaction::input(self.address, 0, 0).with_toggle(DataToggle::Data1);
                self.check(engine.execute(phy, session, &tx).into_result())?;

                return Ok(self.complete());
            }

            ControlState::StatusOut => {
                let tx = self.check(Transaction::output(self.address, 0, &[]))?
                    .with_toggle(DataToggle::Data1);
                self.check(engine.execute(phy, session, &tx).into_result())?;

                return Ok(self.complete());
            }

            ControlState::Idle => return Err(UsbError::InvalidState),
        }

        Err(UsbError::WouldBlock)
    }

    /// Runs the transfer to completion.
    pub fn run<P: UsbPhy + ?Sized, L: TransactionLog>(
        &mut self,
        engine: &mut TransactionEngine<L>,
        phy: &mut P,
        session: &Session,
    ) -> Result<usize> {
        loop {
            match self.step(engine, phy, session) {
                Err(UsbError::WouldBlock) => continue,
                res => return res,
            }
        }
    }

    fn check<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(err) = res {
            usb_debug!("control: stage {:?} failed: {:?}", self.state, err);
            self.abort();
        }
        res
    }

    fn complete(&mut self) -> usize {
        let len = self.i;
        self.state = ControlState::Idle;
        self.request = None;
        len
    }
}
