#![allow(dead_code)]

//! A simulated bus for host tests.
//!
//! Time is virtual. It only advances when a packet moves, when the host waits for a response that
//! never comes, or when a test calls [`SimPhy::advance`]. The device behind the PHY implements
//! just enough of chapter 9 to be enumerated and can be told to misbehave through [`Faults`].

use std::collections::{HashMap, VecDeque};
use std::convert::TryInto;
use std::time::Duration;

use usb_host_core::class::{ClassDriver, DeviceHandle};
use usb_host_core::control::{Request, RequestType};
use usb_host_core::descriptor::{
    class_code, descriptor_type, lang_id, ConfigDescriptor, DescriptorWriter, DeviceDescriptor,
    EndpointDescriptor, InterfaceDescriptor,
};
use usb_host_core::endpoint::EndpointMap;
use usb_host_core::enumerator::EnumerationState;
use usb_host_core::host::{PollResult, UsbHost, UsbHostBuilder};
use usb_host_core::packet::{self, Packet, Pid};
use usb_host_core::phy::{BusDrive, LineState, RxResult, UsbPhy};
use usb_host_core::reset::ResetTiming;
use usb_host_core::time::Instant;
use usb_host_core::transaction::TransactionLog;
use usb_host_core::watchdog::Watchdog;
use usb_host_core::{Result, Speed, UsbDirection, UsbError};

pub const VID: u16 = 0x16d0;
pub const PID: u16 = 0x0f3c;
pub const DEVICE_ADDRESS: u8 = 0x12;
pub const BULK_IN: u8 = 0x81;
pub const BULK_OUT: u8 = 0x02;
pub const MANUFACTURER: &str = "usb-host-core";
pub const PRODUCT: &str = "Simulated mass storage";

/// Simulated time between host polls.
pub const POLL_STEP: Duration = Duration::from_micros(50);

/// Bus time taken by one packet.
const PACKET_TIME_US: u64 = 1;

/// A high-speed capable device holds chirp K from this point into the reset, for this long.
const DEVICE_CHIRP_START_US: u64 = 2_500;
const DEVICE_CHIRP_LEN_US: u64 = 2_000;

/// A high-speed device falls back to full-speed signalling after this much bus inactivity.
const HIGH_SPEED_IDLE_US: u64 = 3_000;

/// Reset timing scaled down so that a whole enumeration takes a few milliseconds of simulated
/// time.
pub fn fast_timing() -> ResetTiming {
    ResetTiming {
        attach_debounce: Duration::from_millis(1),
        attach_timeout: Duration::from_millis(20),
        reset_duration: Duration::from_millis(10),
        chirp_filter: Duration::from_micros(3),
        chirp_window: Duration::from_millis(7),
        host_chirp_step: Duration::from_micros(50),
        resume_duration: Duration::from_millis(2),
    }
}

pub fn device_descriptor(max_packet_size_0: u8, device_class: u8) -> DeviceDescriptor {
    DeviceDescriptor {
        usb_release: 0x0200,
        device_class,
        device_sub_class: 0,
        device_protocol: 0,
        max_packet_size_0,
        vendor_id: VID,
        product_id: PID,
        device_release: 0x0100,
        manufacturer: 1,
        product: 2,
        serial_number: 0,
        num_configurations: 1,
    }
}

pub fn bulk(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        address: address.into(),
        attributes: 0x02,
        max_packet_size,
        interval: 0,
        audio: None,
    }
}

pub fn interrupt(address: u8, max_packet_size: u16, interval: u8) -> EndpointDescriptor {
    EndpointDescriptor {
        address: address.into(),
        attributes: 0x03,
        max_packet_size,
        interval,
        audio: None,
    }
}

pub fn interface(number: u8, class: u8, num_endpoints: u8) -> InterfaceDescriptor {
    InterfaceDescriptor {
        interface_number: number,
        alternate_setting: 0,
        num_endpoints,
        interface_class: class,
        interface_sub_class: 0,
        interface_protocol: 0,
        interface_string: 0,
    }
}

pub fn encode_device(d: &DeviceDescriptor) -> Vec<u8> {
    let mut buf = [0u8; 64];
    let mut writer = DescriptorWriter::new(&mut buf);
    writer.device(d).expect("write device descriptor");
    let len = writer.position();
    buf[..len].to_vec()
}

/// Encodes a configuration with the given interfaces, each followed by its endpoints.
pub fn encode_configuration(
    configuration_value: u8,
    interfaces: &[(InterfaceDescriptor, Vec<EndpointDescriptor>)],
) -> Vec<u8> {
    let mut buf = [0u8; 1024];
    let mut writer = DescriptorWriter::new(&mut buf);

    writer
        .configuration(&ConfigDescriptor {
            total_length: 0,
            num_interfaces: interfaces.len() as u8,
            configuration_value,
            configuration_string: 0,
            attributes: 0x80,
            max_power: 50,
        })
        .expect("write configuration descriptor");

    for (iface, endpoints) in interfaces {
        writer.interface(iface).expect("write interface descriptor");
        for ep in endpoints {
            writer.endpoint(ep).expect("write endpoint descriptor");
        }
    }

    writer.end_configuration();
    let len = writer.position();
    buf[..len].to_vec()
}

pub fn mass_storage_configuration(configuration_value: u8, bulk_mps: u16) -> Vec<u8> {
    let mut iface = interface(0, class_code::MASS_STORAGE, 2);
    iface.interface_sub_class = 0x06;
    iface.interface_protocol = 0x50;

    encode_configuration(
        configuration_value,
        &[(iface, vec![bulk(BULK_IN, bulk_mps), bulk(BULK_OUT, bulk_mps)])],
    )
}

pub fn encode_string(s: &str) -> Vec<u8> {
    let mut buf = [0u8; 256];
    let mut writer = DescriptorWriter::new(&mut buf);
    writer.string(s).expect("write string descriptor");
    let len = writer.position();
    buf[..len].to_vec()
}

pub fn encode_languages() -> Vec<u8> {
    let mut buf = [0u8; 8];
    let mut writer = DescriptorWriter::new(&mut buf);
    writer
        .languages(&[lang_id::ENGLISH_US])
        .expect("write language descriptor");
    let len = writer.position();
    buf[..len].to_vec()
}

/// Ways the simulated device can misbehave.
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// NAK this many IN and OUT tokens. SETUP is always accepted.
    pub nak: u32,
    /// NAK every IN and OUT token.
    pub nak_forever: bool,
    /// STALL the data or status stage of requests with this code.
    pub stall_request: Option<u8>,
    /// Send this many data packets with a broken CRC.
    pub corrupt_data: u32,
    /// Answer this many times with a packet that has an invalid PID.
    pub garbage: u32,
    /// Miss this many host ACKs, so that the same data is sent again with the same toggle.
    pub missed_acks: u32,
    /// Answer bulk OUT with NYET instead of ACK.
    pub nyet: bool,
    /// Stop responding to everything once the configuration descriptor is requested.
    pub silent_on_config: bool,
    /// Stop responding to everything once a request with this code arrives.
    pub silent_on_request: Option<u8>,
}

#[derive(Clone, Debug, Default)]
struct ControlTransfer {
    request: Option<Request>,
    data: Vec<u8>,
    pos: usize,
    toggle: bool,
    data_done: bool,
    stalled: bool,
}

/// A device that answers standard requests on endpoint 0 and moves bulk data on the others.
pub struct SimDevice {
    pub speed: Speed,
    pub device: Vec<u8>,
    pub configurations: Vec<Vec<u8>>,
    pub strings: Vec<Vec<u8>>,
    pub faults: Faults,
    pub address: u8,
    pub configuration: u8,
    /// Every SETUP received, in order.
    pub requests: Vec<Request>,
    /// Every token received, whatever its address.
    pub tokens: Vec<(Pid, u8, u8)>,
    /// Frame numbers of the start-of-frame markers received.
    pub sofs: Vec<u16>,
    /// Packets waiting to be read from each IN endpoint.
    pub in_data: HashMap<u8, VecDeque<Vec<u8>>>,
    /// Packets written to OUT endpoints.
    pub out_data: Vec<(u8, Vec<u8>)>,
    pub bus_resets: u32,
    max_packet_size_0: usize,
    control: ControlTransfer,
    in_toggles: [bool; 16],
    out_toggles: [bool; 16],
    token: Option<(Pid, u8)>,
    awaiting_ack: Option<(u8, usize)>,
    responses: VecDeque<Vec<u8>>,
    silent: bool,
}

impl SimDevice {
    pub fn new(speed: Speed, device: Vec<u8>, configurations: Vec<Vec<u8>>) -> SimDevice {
        let max_packet_size_0 = device[7] as usize;

        SimDevice {
            speed,
            device,
            configurations,
            strings: vec![
                encode_languages(),
                encode_string(MANUFACTURER),
                encode_string(PRODUCT),
            ],
            faults: Faults::default(),
            address: 0,
            configuration: 0,
            requests: Vec::new(),
            tokens: Vec::new(),
            sofs: Vec::new(),
            in_data: HashMap::new(),
            out_data: Vec::new(),
            bus_resets: 0,
            max_packet_size_0,
            control: ControlTransfer::default(),
            in_toggles: [false; 16],
            out_toggles: [false; 16],
            token: None,
            awaiting_ack: None,
            responses: VecDeque::new(),
            silent: false,
        }
    }

    /// A mass storage device with bulk endpoints 0x81 and 0x02.
    pub fn mass_storage(speed: Speed, max_packet_size_0: u8) -> SimDevice {
        let device = encode_device(&device_descriptor(max_packet_size_0, 0));
        let config = mass_storage_configuration(1, speed.max_bulk_packet_size());

        SimDevice::new(speed, device, vec![config])
    }

    /// A hub with its status change interrupt endpoint.
    pub fn hub() -> SimDevice {
        let device = encode_device(&device_descriptor(64, class_code::HUB));
        let config = encode_configuration(
            1,
            &[(interface(0, class_code::HUB, 1), vec![interrupt(0x81, 1, 12)])],
        );

        SimDevice::new(Speed::Full, device, vec![config])
    }

    /// Queues a packet for the host to read from an IN endpoint.
    pub fn queue_in(&mut self, ep_addr: u8, data: &[u8]) {
        self.in_data
            .entry(ep_addr)
            .or_insert_with(VecDeque::new)
            .push_back(data.to_vec());
    }

    /// Requests with the given code received so far.
    pub fn count_requests(&self, request: u8) -> usize {
        self.requests.iter().filter(|r| r.request == request).count()
    }

    /// Tokens of type `pid` sent to endpoint number `endpoint`.
    pub fn count_tokens(&self, pid: Pid, endpoint: u8) -> usize {
        self.tokens
            .iter()
            .filter(|(p, _, ep)| *p == pid && *ep == endpoint)
            .count()
    }

    fn bus_reset(&mut self) {
        self.bus_resets += 1;
        self.address = 0;
        self.configuration = 0;
        self.control = ControlTransfer::default();
        self.in_toggles = [false; 16];
        self.out_toggles = [false; 16];
        self.token = None;
        self.awaiting_ack = None;
        self.responses.clear();
        self.silent = false;
    }

    fn handle(&mut self, bytes: &[u8]) {
        let packet = match packet::decode(bytes) {
            Ok(packet) => packet,
            Err(_) => return,
        };

        match packet {
            Packet::Sof(frame) => self.sofs.push(frame),
            Packet::Token {
                pid,
                address,
                endpoint,
            } => {
                self.tokens.push((pid, address, endpoint));
                self.token = None;
                self.responses.clear();

                if self.silent || address != self.address {
                    return;
                }

                match pid {
                    Pid::In => self.token_in(endpoint),
                    Pid::Setup | Pid::Out => self.token = Some((pid, endpoint)),
                    _ => {}
                }
            }
            Packet::Data { pid, payload } => {
                if let Some((token, endpoint)) = self.token.take() {
                    if token == Pid::Setup {
                        self.setup(payload);
                    } else {
                        self.data_out(endpoint, pid, payload);
                    }
                }
            }
            Packet::Handshake(Pid::Ack) => self.host_ack(),
            _ => {}
        }
    }

    fn nak(&mut self) -> bool {
        if self.faults.nak_forever {
            return true;
        }

        if self.faults.nak > 0 {
            self.faults.nak -= 1;
            return true;
        }

        false
    }

    fn garbage(&mut self) -> bool {
        if self.faults.garbage > 0 {
            self.faults.garbage -= 1;
            self.responses.push_back(vec![0x00]);
            return true;
        }

        false
    }

    fn respond_handshake(&mut self, pid: Pid) {
        if !self.garbage() {
            self.responses.push_back(packet::handshake(pid).to_vec());
        }
    }

    fn respond_data(&mut self, toggle: bool, payload: &[u8]) {
        if self.garbage() {
            return;
        }

        let pid = if toggle { Pid::Data1 } else { Pid::Data0 };
        let mut buf = [0u8; packet::MAX_WIRE_LEN];
        let len = packet::data(pid, payload, &mut buf).expect("encode data packet");

        if self.faults.corrupt_data > 0 {
            self.faults.corrupt_data -= 1;
            buf[len - 1] ^= 0xff;
        }

        self.responses.push_back(buf[..len].to_vec());
    }

    fn token_in(&mut self, endpoint: u8) {
        if endpoint == 0 {
            self.control_in();
            return;
        }

        if self.nak() {
            self.respond_handshake(Pid::Nak);
            return;
        }

        let ep_addr = endpoint | 0x80;
        let chunk = match self.in_data.get(&ep_addr).and_then(|q| q.front()) {
            Some(chunk) => chunk.clone(),
            None => {
                self.respond_handshake(Pid::Nak);
                return;
            }
        };

        self.awaiting_ack = Some((ep_addr, chunk.len()));
        let toggle = self.in_toggles[endpoint as usize];
        self.respond_data(toggle, &chunk);
    }

    fn control_in(&mut self) {
        let req = match self.control.request {
            Some(req) if !self.control.stalled => req,
            _ => {
                self.respond_handshake(Pid::Stall);
                return;
            }
        };

        if self.nak() {
            self.respond_handshake(Pid::Nak);
            return;
        }

        if req.direction == UsbDirection::In {
            if self.control.data_done {
                self.respond_handshake(Pid::Stall);
                return;
            }

            let pos = self.control.pos;
            let end = (pos + self.max_packet_size_0).min(self.control.data.len());
            let chunk = self.control.data[pos.min(end)..end].to_vec();

            self.awaiting_ack = Some((0, chunk.len()));
            let toggle = self.control.toggle;
            self.respond_data(toggle, &chunk);
        } else {
            // Status stage of a control write
            self.awaiting_ack = Some((0, 0));
            self.respond_data(true, &[]);
        }
    }

    fn host_ack(&mut self) {
        let (ep_addr, len) = match self.awaiting_ack.take() {
            Some(pending) => pending,
            None => return,
        };

        if self.faults.missed_acks > 0 {
            self.faults.missed_acks -= 1;
            return;
        }

        if ep_addr != 0 {
            if let Some(queue) = self.in_data.get_mut(&ep_addr) {
                queue.pop_front();
            }
            let ep = (ep_addr & 0x0f) as usize;
            self.in_toggles[ep] = !self.in_toggles[ep];
            return;
        }

        let req = match self.control.request {
            Some(req) => req,
            None => return,
        };

        if req.direction == UsbDirection::In {
            self.control.pos += len;
            self.control.toggle = !self.control.toggle;
            if len < self.max_packet_size_0 || self.control.pos >= req.length as usize {
                self.control.data_done = true;
            }
        } else {
            if req.request == Request::SET_ADDRESS {
                self.address = req.value as u8;
            }
            self.control = ControlTransfer::default();
        }
    }

    fn setup(&mut self, payload: &[u8]) {
        let bytes: [u8; 8] = match payload.try_into() {
            Ok(bytes) => bytes,
            Err(_) => return,
        };

        let req = Request::parse(&bytes);
        self.requests.push(req);

        let config_requested = req.request == Request::GET_DESCRIPTOR
            && req.descriptor_type_index().0 == descriptor_type::CONFIGURATION;

        if (self.faults.silent_on_config && config_requested)
            || self.faults.silent_on_request == Some(req.request)
        {
            self.silent = true;
            return;
        }

        self.control = ControlTransfer {
            request: Some(req),
            toggle: true,
            ..ControlTransfer::default()
        };
        self.respond_handshake(Pid::Ack);

        if self.faults.stall_request == Some(req.request) {
            self.control.stalled = true;
            return;
        }

        match (req.request_type, req.request) {
            (RequestType::Standard, Request::GET_DESCRIPTOR) => {
                let (ty, index) = req.descriptor_type_index();
                let data = match ty {
                    descriptor_type::DEVICE => Some(self.device.clone()),
                    descriptor_type::CONFIGURATION => {
                        self.configurations.get(index as usize).cloned()
                    }
                    descriptor_type::STRING => self.strings.get(index as usize).cloned(),
                    _ => None,
                };

                match data {
                    Some(mut data) => {
                        data.truncate(req.length as usize);
                        self.control.data = data;
                    }
                    None => self.control.stalled = true,
                }
            }
            (RequestType::Standard, Request::SET_ADDRESS) => {}
            (RequestType::Standard, Request::SET_CONFIGURATION) => {
                self.configuration = req.value as u8;
                self.in_toggles = [false; 16];
                self.out_toggles = [false; 16];
            }
            (RequestType::Standard, Request::CLEAR_FEATURE)
                if req.value == Request::FEATURE_ENDPOINT_HALT =>
            {
                let ep = (req.index & 0x0f) as usize;
                if req.index & 0x80 != 0 {
                    self.in_toggles[ep] = false;
                } else {
                    self.out_toggles[ep] = false;
                }
            }
            _ => self.control.stalled = true,
        }
    }

    fn data_out(&mut self, endpoint: u8, pid: Pid, payload: &[u8]) {
        if endpoint == 0 {
            let req = match self.control.request {
                Some(req) if !self.control.stalled => req,
                // A repeated status stage after the transfer has already completed
                None if payload.is_empty() => {
                    self.respond_handshake(Pid::Ack);
                    return;
                }
                _ => {
                    self.respond_handshake(Pid::Stall);
                    return;
                }
            };

            if self.nak() {
                self.respond_handshake(Pid::Nak);
                return;
            }

            if req.direction == UsbDirection::In {
                // Status stage of a control read
                self.control = ControlTransfer::default();
            } else {
                self.control.data.extend_from_slice(payload);
            }

            self.respond_handshake(Pid::Ack);
            return;
        }

        if self.nak() {
            self.respond_handshake(Pid::Nak);
            return;
        }

        let ep = (endpoint & 0x0f) as usize;
        let toggle = pid == Pid::Data1;

        // A packet with the old toggle is a retransmission and is acknowledged but dropped
        if toggle == self.out_toggles[ep] {
            self.out_data.push((endpoint, payload.to_vec()));
            self.out_toggles[ep] = !toggle;
        }

        let handshake = if self.faults.nyet { Pid::Nyet } else { Pid::Ack };
        self.respond_handshake(handshake);
    }
}

/// A PHY wired to a [`SimDevice`].
pub struct SimPhy {
    pub device: SimDevice,
    pub attached: bool,
    /// Every change of what the host drives, with its time.
    pub drives: Vec<(u64, BusDrive)>,
    /// Speed the host switched to, if any.
    pub speed: Option<Speed>,
    /// Every packet the host transmitted, with its time.
    pub transmitted: Vec<(u64, Vec<u8>)>,
    /// Contact bounce: the idle line flips between J and K on every sample.
    pub bouncing: bool,
    bounce: bool,
    now: u64,
    drive: BusDrive,
    reset_started: u64,
    host_chirps: u32,
    high_speed: bool,
    last_activity: u64,
}

impl SimPhy {
    pub fn new(device: SimDevice) -> SimPhy {
        SimPhy {
            device,
            attached: true,
            drives: Vec::new(),
            speed: None,
            transmitted: Vec::new(),
            bouncing: false,
            bounce: false,
            now: 0,
            drive: BusDrive::Idle,
            reset_started: 0,
            host_chirps: 0,
            high_speed: false,
            last_activity: 0,
        }
    }

    pub fn advance(&mut self, d: Duration) {
        self.now += d.as_micros() as u64;
    }

    pub fn micros(&self) -> u64 {
        self.now
    }

    /// Whether the device has switched to high-speed signalling.
    pub fn is_high_speed(&self) -> bool {
        self.high_speed
    }

    /// Times at which the host started driving bus reset.
    pub fn reset_starts(&self) -> Vec<u64> {
        self.drives
            .iter()
            .filter(|(_, d)| *d == BusDrive::Reset)
            .map(|(t, _)| *t)
            .collect()
    }

    /// Times of the start-of-frame markers the host transmitted.
    pub fn sof_times(&self) -> Vec<u64> {
        self.transmitted
            .iter()
            .filter(|(_, p)| p.first() == Some(&u8::from(Pid::Sof)))
            .map(|(t, _)| *t)
            .collect()
    }

    /// Times and frame numbers of the start-of-frame markers the host transmitted.
    pub fn sof_frames(&self) -> Vec<(u64, u16)> {
        self.transmitted
            .iter()
            .filter(|(_, p)| p.len() == 3 && p[0] == u8::from(Pid::Sof))
            .map(|(t, p)| (*t, u16::from_le_bytes([p[1], p[2]]) & 0x07ff))
            .collect()
    }
}

impl UsbPhy for SimPhy {
    fn now(&self) -> Instant {
        Instant::from_micros(self.now)
    }

    fn line_state(&mut self) -> LineState {
        if !self.attached {
            return LineState::Se0;
        }

        if self.bouncing && self.drive == BusDrive::Idle {
            self.bounce = !self.bounce;
            return if self.bounce { LineState::J } else { LineState::K };
        }

        match self.drive {
            BusDrive::Reset => {
                let t = self.now - self.reset_started;
                let chirping = self.device.speed == Speed::High
                    && t >= DEVICE_CHIRP_START_US
                    && t < DEVICE_CHIRP_START_US + DEVICE_CHIRP_LEN_US;

                if chirping {
                    LineState::K
                } else {
                    LineState::Se0
                }
            }
            BusDrive::ChirpK | BusDrive::Resume => LineState::K,
            BusDrive::ChirpJ => LineState::J,
            BusDrive::Idle => {
                if self.high_speed && self.now - self.last_activity > HIGH_SPEED_IDLE_US {
                    self.high_speed = false;
                }

                if self.high_speed {
                    LineState::Se0
                } else if self.device.speed == Speed::Low {
                    LineState::K
                } else {
                    LineState::J
                }
            }
        }
    }

    fn drive(&mut self, drive: BusDrive) {
        if drive == BusDrive::Reset && self.drive != BusDrive::Reset {
            self.reset_started = self.now;
            self.host_chirps = 0;
            self.high_speed = false;
            self.device.bus_reset();
        }

        if matches!(drive, BusDrive::ChirpK | BusDrive::ChirpJ) {
            self.host_chirps += 1;
        }

        if drive == BusDrive::Idle
            && self.drive == BusDrive::Resume
            && self.speed == Some(Speed::High)
        {
            self.high_speed = true;
            self.last_activity = self.now;
        }

        if drive != self.drive {
            self.drives.push((self.now, drive));
        }
        self.drive = drive;
    }

    fn set_speed(&mut self, speed: Speed) {
        self.speed = Some(speed);
        self.high_speed =
            speed == Speed::High && self.device.speed == Speed::High && self.host_chirps >= 6;
        self.last_activity = self.now;
    }

    fn transmit(&mut self, packet: &[u8]) -> Result<()> {
        self.now += PACKET_TIME_US;
        self.last_activity = self.now;
        self.transmitted.push((self.now, packet.to_vec()));

        if self.attached && self.drive == BusDrive::Idle {
            self.device.handle(packet);
        }

        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> RxResult {
        match self.device.responses.pop_front() {
            Some(p) if p.len() <= buf.len() => {
                self.now += PACKET_TIME_US;
                buf[..p.len()].copy_from_slice(&p);
                RxResult::Packet(p.len())
            }
            Some(_) => RxResult::Error,
            None => {
                self.now += timeout.as_micros() as u64;
                RxResult::Timeout
            }
        }
    }
}

/// A mass storage class driver that echoes what it reads.
#[derive(Default)]
pub struct MassStorage {
    pub probed: Vec<u8>,
    pub endpoints: Option<EndpointMap>,
    pub configuration: Option<u8>,
    pub resets: u32,
    pub polls: u32,
    pub to_send: VecDeque<Vec<u8>>,
    pub received: Vec<Vec<u8>>,
    pub errors: Vec<UsbError>,
}

impl ClassDriver for MassStorage {
    fn probe(&mut self, device: &DeviceDescriptor, interface: &InterfaceDescriptor) -> bool {
        self.probed.push(interface.interface_number);
        device.vendor_id == VID && interface.interface_class == class_code::MASS_STORAGE
    }

    fn configuration(&mut self, _device: &DeviceDescriptor) -> Option<u8> {
        self.configuration
    }

    fn attach(&mut self, _device: &DeviceDescriptor, endpoints: &EndpointMap) {
        self.endpoints = Some(endpoints.clone());
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.endpoints = None;
    }

    fn poll(&mut self, device: &mut DeviceHandle<'_>) -> Result<()> {
        self.polls += 1;

        if let Some(data) = self.to_send.pop_front() {
            device.write(BULK_OUT.into(), &data)?;
        }

        let mut buf = [0u8; 512];
        match device.read(BULK_IN.into(), &mut buf) {
            Ok(len) => self.received.push(buf[..len].to_vec()),
            Err(UsbError::Nak) => {}
            Err(err) => {
                self.errors.push(err);
                return Err(err);
            }
        }

        Ok(())
    }
}

/// A host builder with test timing: fast reset, 3 start-of-frame settle delay and a 50 ms
/// watchdog.
pub fn builder(phy: SimPhy, watchdog: &Watchdog) -> UsbHostBuilder<'_, SimPhy> {
    UsbHostBuilder::new(phy, watchdog)
        .reset_timing(fast_timing())
        .ready_delay_frames(3)
        .watchdog_interval(Duration::from_millis(50))
}

/// Polls `host` until `done` returns true, advancing simulated time by [`POLL_STEP`] between
/// polls, and returns every poll result other than [`PollResult::None`]. Panics if `done` is
/// still false after `limit` of simulated time.
pub fn run_until<L: TransactionLog>(
    host: &mut UsbHost<'_, SimPhy, L>,
    classes: &mut [&mut dyn ClassDriver],
    limit: Duration,
    mut done: impl FnMut(&UsbHost<'_, SimPhy, L>, PollResult) -> bool,
) -> Vec<PollResult> {
    let deadline = host.phy().micros() + limit.as_micros() as u64;
    let mut events = Vec::new();

    loop {
        let res = host.poll(classes);
        if res != PollResult::None {
            events.push(res);
        }

        if done(host, res) {
            return events;
        }

        assert!(
            host.phy().micros() < deadline,
            "stuck in {:?}, events {:?}",
            host.state(),
            events
        );

        host.phy_mut().advance(POLL_STEP);
    }
}

/// Runs for `duration` of simulated time regardless of what happens.
pub fn run_for<L: TransactionLog>(
    host: &mut UsbHost<'_, SimPhy, L>,
    classes: &mut [&mut dyn ClassDriver],
    duration: Duration,
) -> Vec<PollResult> {
    let until = host.phy().micros() + duration.as_micros() as u64;
    run_until(host, classes, duration + POLL_STEP * 4, |host, _| {
        host.phy().micros() >= until
    })
}

/// Enumerates to [`EnumerationState::Ready`] and returns the states passed through.
pub fn enumerate<L: TransactionLog>(
    host: &mut UsbHost<'_, SimPhy, L>,
    classes: &mut [&mut dyn ClassDriver],
) -> Vec<EnumerationState> {
    let events = run_until(host, classes, Duration::from_millis(200), |host, _| {
        host.state() == EnumerationState::Ready
    });

    states(&events)
}

pub fn states(events: &[PollResult]) -> Vec<EnumerationState> {
    events
        .iter()
        .filter_map(|e| match e {
            PollResult::State(s) => Some(*s),
            _ => None,
        })
        .collect()
}
