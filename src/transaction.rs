//! The transaction engine (serial interface engine).
//!
//! A [`Transaction`] is a single token/data/handshake exchange with one endpoint. The
//! [`TransactionEngine`] puts it on the bus, interprets the response and retries transient
//! failures according to its [`RetryPolicy`]. It also owns the [`FrameTimer`] and emits any
//! start-of-frame marker that has become due before every physical attempt.

use crate::endpoint::EndpointAddress;
use crate::packet::{self, Packet, PacketError, Pid, MAX_PACKET_SIZE, MAX_WIRE_LEN};
use crate::phy::{RxResult, UsbPhy};
use crate::reset::BusState;
use crate::session::{Epoch, Session};
use crate::sof::FrameTimer;
use crate::time::Instant;
use crate::{Result, UsbDirection, UsbError};
use core::time::Duration;

/// Payload of a single data packet.
pub type Payload = heapless::Vec<u8, MAX_PACKET_SIZE>;

/// Token type of a transaction.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TokenKind {
    /// SETUP stage of a control transfer. Always DATA0, the device may not NAK.
    Setup,
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

/// Data toggle (DATA0/DATA1) sequence bit.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataToggle {
    /// DATA0
    Data0,
    /// DATA1
    Data1,
}

impl DataToggle {
    /// The data PID carrying this toggle.
    pub fn pid(self) -> Pid {
        match self {
            DataToggle::Data0 => Pid::Data0,
            DataToggle::Data1 => Pid::Data1,
        }
    }

    /// The other toggle.
    pub fn next(self) -> DataToggle {
        match self {
            DataToggle::Data0 => DataToggle::Data1,
            DataToggle::Data1 => DataToggle::Data0,
        }
    }
}

/// A request to move one packet to or from an endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    address: u8,
    endpoint: u8,
    kind: TokenKind,
    toggle: Option<DataToggle>,
    max_len: u16,
    data: Payload,
}

impl Transaction {
    /// A SETUP transaction carrying an 8-byte request.
    pub fn setup(address: u8, request: &[u8; 8]) -> Transaction {
        let mut data = Payload::new();
        // 8 bytes always fit
        let _ = data.extend_from_slice(request);

        Transaction {
            address,
            endpoint: 0,
            kind: TokenKind::Setup,
            toggle: Some(DataToggle::Data0),
            max_len: 8,
            data,
        }
    }

    /// An IN transaction accepting a packet of at most `max_len` bytes, normally the declared max
    /// packet size of the endpoint. Anything longer is babble.
    pub fn input(address: u8, endpoint: u8, max_len: u16) -> Transaction {
        Transaction {
            address,
            endpoint,
            kind: TokenKind::In,
            toggle: None,
            max_len: max_len.min(MAX_PACKET_SIZE as u16),
            data: Payload::new(),
        }
    }

    /// An OUT transaction carrying `data`.
    ///
    /// # Errors
    ///
    /// * [`BufferOverflow`](crate::UsbError::BufferOverflow) - `data` is longer than the largest
    ///   supported packet.
    pub fn output(address: u8, endpoint: u8, data: &[u8]) -> Result<Transaction> {
        let data = Payload::from_slice(data).map_err(|_| UsbError::BufferOverflow)?;

        Ok(Transaction {
            address,
            endpoint,
            kind: TokenKind::Out,
            toggle: None,
            max_len: data.len() as u16,
            data,
        })
    }

    /// Uses an explicit data toggle instead of the engine's per-endpoint toggle tracking. Used for
    /// control transfer stages.
    pub fn with_toggle(mut self, toggle: DataToggle) -> Transaction {
        self.toggle = Some(toggle);
        self
    }

    /// Device address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Endpoint number.
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Token type.
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// OUT/SETUP payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Transfer direction. SETUP counts as OUT.
    pub fn direction(&self) -> UsbDirection {
        match self.kind {
            TokenKind::In => UsbDirection::In,
            _ => UsbDirection::Out,
        }
    }
}

/// Outcome of a transaction. Exactly one per [`TransactionEngine::execute`] call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransactionResult {
    /// The exchange completed. Carries the received payload for IN transactions and is empty for
    /// OUT and SETUP.
    Success(Payload),
    /// The device kept answering NAK beyond the retry budget.
    Nak,
    /// The device answered STALL.
    Stall,
    /// No valid response within the retry budget.
    Timeout,
    /// Malformed responses beyond the retry budget.
    BusError,
}

impl TransactionResult {
    /// The payload-free status of this result.
    pub fn status(&self) -> TransactionStatus {
        match self {
            TransactionResult::Success(_) => TransactionStatus::Success,
            TransactionResult::Nak => TransactionStatus::Nak,
            TransactionResult::Stall => TransactionStatus::Stall,
            TransactionResult::Timeout => TransactionStatus::Timeout,
            TransactionResult::BusError => TransactionStatus::BusError,
        }
    }

    /// Converts into a `Result`, mapping each failure to the matching [`UsbError`].
    pub fn into_result(self) -> Result<Payload> {
        match self {
            TransactionResult::Success(payload) => Ok(payload),
            TransactionResult::Nak => Err(UsbError::Nak),
            TransactionResult::Stall => Err(UsbError::Stall),
            TransactionResult::Timeout => Err(UsbError::Timeout),
            TransactionResult::BusError => Err(UsbError::BusError),
        }
    }
}

/// [`TransactionResult`] without the payload.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransactionStatus {
    /// See [`TransactionResult::Success`].
    Success,
    /// See [`TransactionResult::Nak`].
    Nak,
    /// See [`TransactionResult::Stall`].
    Stall,
    /// See [`TransactionResult::Timeout`].
    Timeout,
    /// See [`TransactionResult::BusError`].
    BusError,
}

/// Engine-level retry budget.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt, for any reason. A single `execute` call never makes more
    /// than `max_retries + 1` physical attempts.
    pub max_retries: u8,

    /// How many of those retries may be spent on malformed responses.
    pub bus_error_retries: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            bus_error_retries: 1,
        }
    }
}

/// One completed transaction, as reported to a [`TransactionLog`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LogEntry {
    /// Session the transaction ran in.
    pub epoch: Epoch,
    /// Completion time.
    pub at: Instant,
    /// Device address.
    pub address: u8,
    /// Endpoint number.
    pub endpoint: u8,
    /// Token type.
    pub kind: TokenKind,
    /// Bytes sent (OUT/SETUP) or received (IN).
    pub len: usize,
    /// Outcome.
    pub status: TransactionStatus,
    /// Physical attempts made.
    pub attempts: u8,
}

/// Passive observer of completed transactions.
pub trait TransactionLog {
    /// Called once per completed transaction.
    fn record(&mut self, entry: &LogEntry);
}

impl TransactionLog for () {
    fn record(&mut self, _entry: &LogEntry) {}
}

/// Keeps the most recent `N` entries.
impl<const N: usize> TransactionLog for heapless::Deque<LogEntry, N> {
    fn record(&mut self, entry: &LogEntry) {
        if self.is_full() {
            self.pop_front();
        }
        let _ = self.push_back(*entry);
    }
}

enum Attempt {
    Done(TransactionResult),
    Nak,
    NoData,
    Malformed,
}

/// Executes transactions on the bus.
pub struct TransactionEngine<L: TransactionLog = ()> {
    policy: RetryPolicy,
    response_timeout: Duration,
    frames: FrameTimer,
    toggle_session: Option<Epoch>,
    toggles: [u16; 2],
    attempts: u32,
    log: L,
    buf: [u8; MAX_WIRE_LEN],
}

impl<L: TransactionLog> TransactionEngine<L> {
    /// Creates an engine.
    pub fn new(policy: RetryPolicy, response_timeout: Duration, log: L) -> TransactionEngine<L> {
        TransactionEngine {
            policy,
            response_timeout,
            frames: FrameTimer::new(),
            toggle_session: None,
            toggles: [0; 2],
            attempts: 0,
            log,
            buf: [0; MAX_WIRE_LEN],
        }
    }

    /// Gets the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Gets the frame timer.
    pub fn frames(&self) -> &FrameTimer {
        &self.frames
    }

    /// Total physical attempts made since creation.
    pub fn physical_attempts(&self) -> u32 {
        self.attempts
    }

    /// Gets the transaction log.
    pub fn log(&self) -> &L {
        &self.log
    }

    /// Gets the transaction log mutably, for example to drain it.
    pub fn log_mut(&mut self) -> &mut L {
        &mut self.log
    }

    /// Resets all non-control data toggles to DATA0. Done on bus reset and by SET_CONFIGURATION.
    pub fn reset_toggles(&mut self) {
        self.toggles = [0; 2];
    }

    /// Resets the data toggle of one endpoint to DATA0, as required after CLEAR_FEATURE(HALT).
    pub fn clear_toggle(&mut self, ep_addr: EndpointAddress) {
        self.toggles[dir_index(ep_addr.direction())] &= !(1 << ep_addr.number());
    }

    /// Gets the next data toggle for a non-control endpoint.
    pub fn toggle(&self, ep_addr: EndpointAddress) -> DataToggle {
        if self.toggles[dir_index(ep_addr.direction())] & (1 << ep_addr.number()) != 0 {
            DataToggle::Data1
        } else {
            DataToggle::Data0
        }
    }

    fn flip_toggle(&mut self, direction: UsbDirection, endpoint: u8) {
        self.toggles[dir_index(direction)] ^= 1 << (endpoint & 0x0f);
    }

    /// Keeps start-of-frame generation in step with the bus and emits a marker if one is due.
    /// Called on every host poll and before every physical attempt.
    pub fn tick<P: UsbPhy + ?Sized>(&mut self, phy: &mut P, session: &Session) {
        match session.bus_state() {
            BusState::Idle(speed) => {
                if !self.frames.is_running() {
                    self.frames.start(speed, phy.now());
                }
                if self.toggle_session != Some(session.epoch()) {
                    self.toggle_session = Some(session.epoch());
                    self.reset_toggles();
                }
            }
            _ => self.frames.stop(),
        }

        if let Some(frame) = self.frames.poll(phy.now()) {
            if phy.transmit(&packet::sof(frame)).is_err() {
                usb_warn!("sof: transmit failed");
            }
        }
    }

    /// Executes a transaction, retrying transient failures, and returns its result.
    ///
    /// NAKs, corrupted or missing data and toggle mismatches are retried without backoff.
    /// Malformed responses are retried at most `bus_error_retries` times. STALL is never retried.
    pub fn execute<P: UsbPhy + ?Sized>(
        &mut self,
        phy: &mut P,
        session: &Session,
        tx: &Transaction,
    ) -> TransactionResult {
        if !matches!(session.bus_state(), BusState::Idle(_)) {
            usb_warn!("transaction: bus not active");
            return self.finish(phy, session, tx, 0, TransactionResult::BusError);
        }

        let mut retries = 0u8;
        let mut bus_errors = 0u8;
        let mut attempts = 0u8;

        loop {
            self.tick(phy, session);

            attempts = attempts.saturating_add(1);
            self.attempts = self.attempts.wrapping_add(1);

            let last = match self.attempt(phy, tx) {
                Attempt::Done(result) => return self.finish(phy, session, tx, attempts, result),
                Attempt::Nak => TransactionResult::Nak,
                Attempt::NoData => TransactionResult::Timeout,
                Attempt::Malformed => {
                    if bus_errors >= self.policy.bus_error_retries {
                        return self.finish(phy, session, tx, attempts, TransactionResult::BusError);
                    }
                    bus_errors += 1;
                    TransactionResult::BusError
                }
            };

            if retries >= self.policy.max_retries {
                return self.finish(phy, session, tx, attempts, last);
            }
            retries += 1;
        }
    }

    fn attempt<P: UsbPhy + ?Sized>(&mut self, phy: &mut P, tx: &Transaction) -> Attempt {
        let token_pid = match tx.kind {
            TokenKind::Setup => Pid::Setup,
            TokenKind::In => Pid::In,
            TokenKind::Out => Pid::Out,
        };

        if phy
            .transmit(&packet::token(token_pid, tx.address, tx.endpoint))
            .is_err()
        {
            return Attempt::Malformed;
        }

        let toggle = tx.toggle.unwrap_or_else(|| {
            self.toggle(EndpointAddress::from_parts(tx.endpoint, tx.direction()))
        });

        match tx.kind {
            TokenKind::In => self.attempt_in(phy, tx, toggle),
            TokenKind::Setup | TokenKind::Out => self.attempt_out(phy, tx, toggle),
        }
    }

    fn attempt_in<P: UsbPhy + ?Sized>(&mut self, phy: &mut P, tx: &Transaction, toggle: DataToggle) -> Attempt {
        let len = match phy.receive(&mut self.buf, self.response_timeout) {
            RxResult::Packet(len) => len.min(self.buf.len()),
            RxResult::Timeout => return Attempt::NoData,
            RxResult::Error => return Attempt::Malformed,
        };

        let (pid, payload) = match packet::decode(&self.buf[..len]) {
            Ok(Packet::Data { pid, payload }) => (pid, payload),
            Ok(Packet::Handshake(Pid::Nak)) => return Attempt::Nak,
            Ok(Packet::Handshake(Pid::Stall)) => return Attempt::Done(TransactionResult::Stall),
            // Corrupted data is ignored without a handshake; the device retries when the host does.
            Err(PacketError::Crc) => return Attempt::NoData,
            _ => return Attempt::Malformed,
        };

        if payload.len() > tx.max_len as usize {
            // Babble
            return Attempt::Malformed;
        }

        let payload = match Payload::from_slice(payload) {
            Ok(payload) => payload,
            Err(_) => return Attempt::Malformed,
        };

        if phy.transmit(&packet::handshake(Pid::Ack)).is_err() {
            return Attempt::Malformed;
        }

        if pid != toggle.pid() {
            // The device missed our previous ACK and resent old data. It has now seen the ACK and
            // moved on, so ask again.
            return Attempt::NoData;
        }

        if tx.toggle.is_none() {
            self.flip_toggle(UsbDirection::In, tx.endpoint);
        }

        Attempt::Done(TransactionResult::Success(payload))
    }

    fn attempt_out<P: UsbPhy + ?Sized>(&mut self, phy: &mut P, tx: &Transaction, toggle: DataToggle) -> Attempt {
        let len = match packet::data(toggle.pid(), &tx.data, &mut self.buf) {
            Ok(len) => len,
            Err(_) => return Attempt::Malformed,
        };

        if phy.transmit(&self.buf[..len]).is_err() {
            return Attempt::Malformed;
        }

        let len = match phy.receive(&mut self.buf, self.response_timeout) {
            RxResult::Packet(len) => len.min(self.buf.len()),
            RxResult::Timeout => return Attempt::NoData,
            RxResult::Error => return Attempt::Malformed,
        };

        match packet::decode(&self.buf[..len]) {
            Ok(Packet::Handshake(Pid::Ack)) | Ok(Packet::Handshake(Pid::Nyet)) => {
                if tx.toggle.is_none() {
                    self.flip_toggle(UsbDirection::Out, tx.endpoint);
                }
                Attempt::Done(TransactionResult::Success(Payload::new()))
            }
            Ok(Packet::Handshake(Pid::Nak)) => Attempt::Nak,
            Ok(Packet::Handshake(Pid::Stall)) => Attempt::Done(TransactionResult::Stall),
            _ => Attempt::Malformed,
        }
    }

    fn finish<P: UsbPhy + ?Sized>(
        &mut self,
        phy: &mut P,
        session: &Session,
        tx: &Transaction,
        attempts: u8,
        result: TransactionResult,
    ) -> TransactionResult {
        let len = match (&result, tx.kind) {
            (TransactionResult::Success(payload), TokenKind::In) => payload.len(),
            (_, TokenKind::In) => 0,
            _ => tx.data.len(),
        };

        let entry = LogEntry {
            epoch: session.epoch(),
            at: phy.now(),
            address: tx.address,
            endpoint: tx.endpoint,
            kind: tx.kind,
            len,
            status: result.status(),
            attempts,
        };

        usb_trace!(
            "{:?} {}.{} len {} -> {:?} ({} attempts)",
            entry.kind,
            entry.address,
            entry.endpoint,
            entry.len,
            entry.status,
            entry.attempts
        );

        self.log.record(&entry);

        result
    }
}

fn dir_index(direction: UsbDirection) -> usize {
    match direction {
        UsbDirection::Out => 0,
        UsbDirection::In => 1,
    }
}
