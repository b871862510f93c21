use crate::class::{Bus, ClassDriver, DeviceHandle};
use crate::control_pipe::ControlPipe;
use crate::endpoint::EndpointMap;
use crate::enumerator::{EnumerationState, Enumerator, MAX_CLASSES};
use crate::phy::UsbPhy;
use crate::reset::{BusState, ResetController, ResetOutcome, ResetTiming};
use crate::session::Session;
use crate::transaction::{RetryPolicy, TransactionEngine, TransactionLog};
use crate::watchdog::Watchdog;
use crate::{Result, Speed, UsbError};
use core::time::Duration;

/// Tunable host parameters. Set through [`UsbHostBuilder`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HostConfig {
    /// Address assigned to the device.
    pub device_address: u8,
    /// Attempts per enumeration step before giving up.
    pub max_attempts: u8,
    /// Transaction engine retry budget.
    pub retry_policy: RetryPolicy,
    /// Enumeration progress timeout.
    pub watchdog_interval: Duration,
    /// Frames (1 ms) to wait after reset before the first request. At high speed this is eight
    /// microframe markers per frame.
    pub ready_delay_frames: u32,
    /// Time the device is given to switch to its new address.
    pub set_address_recovery: Duration,
    /// Bus turnaround timeout while waiting for a device response.
    pub response_timeout: Duration,
    /// Bus reset and chirp timing.
    pub reset_timing: ResetTiming,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            device_address: 0x12,
            max_attempts: 3,
            retry_policy: RetryPolicy::default(),
            watchdog_interval: crate::watchdog::DEFAULT_INTERVAL,
            ready_delay_frames: 10,
            set_address_recovery: Duration::from_millis(2),
            response_timeout: Duration::from_micros(20),
            reset_timing: ResetTiming::standard(),
        }
    }
}

/// Something that happened during a [`UsbHost::poll`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PollResult {
    /// Nothing changed.
    None,
    /// Enumeration moved to a new state.
    State(EnumerationState),
    /// The watchdog expired and enumeration was restarted.
    WatchdogReset,
    /// The device was disconnected.
    Disconnected,
    /// The bus left suspend.
    Resumed,
}

/// A USB host driving one directly attached device.
pub struct UsbHost<'a, P: UsbPhy, L: TransactionLog = ()> {
    phy: P,
    watchdog: &'a Watchdog,
    config: HostConfig,
    session: Session,
    reset: ResetController,
    engine: TransactionEngine<L>,
    pipe: ControlPipe,
    enumerator: Enumerator,
}

impl<'a, P: UsbPhy, L: TransactionLog> UsbHost<'a, P, L> {
    fn build(phy: P, watchdog: &'a Watchdog, config: HostConfig, log: L) -> UsbHost<'a, P, L> {
        watchdog.set_interval(config.watchdog_interval);
        watchdog.disarm();

        UsbHost {
            phy,
            watchdog,
            config,
            session: Session::new(),
            reset: ResetController::new(config.reset_timing),
            engine: TransactionEngine::new(config.retry_policy, config.response_timeout, log),
            pipe: ControlPipe::new(),
            enumerator: Enumerator::new(config),
        }
    }

    /// Gets the configuration the host was built with.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Gets the current enumeration state.
    pub fn state(&self) -> EnumerationState {
        self.enumerator.state()
    }

    /// Gets the enumerator.
    pub fn enumerator(&self) -> &Enumerator {
        &self.enumerator
    }

    /// Gets the session context.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Gets the bus state.
    pub fn bus_state(&self) -> BusState {
        self.session.bus_state()
    }

    /// The negotiated speed, if a device has been reset.
    pub fn speed(&self) -> Option<Speed> {
        self.session.speed()
    }

    /// The endpoint map of the configured device.
    pub fn endpoint_map(&self) -> Option<&EndpointMap> {
        self.enumerator.endpoint_map()
    }

    /// Gets the transaction engine.
    pub fn engine(&self) -> &TransactionEngine<L> {
        &self.engine
    }

    /// Gets the transaction engine mutably, for example to drain its log.
    pub fn engine_mut(&mut self) -> &mut TransactionEngine<L> {
        &mut self.engine
    }

    /// Gets the PHY.
    pub fn phy(&self) -> &P {
        &self.phy
    }

    /// Gets the PHY mutably.
    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    /// Asks for the configuration with `index` instead of the first one on the next enumeration.
    pub fn prefer_configuration(&mut self, index: Option<u8>) {
        self.enumerator.prefer_configuration(index);
    }

    /// Restarts enumeration with a bus reset on the next poll.
    pub fn force_reset(&mut self, classes: &mut [&mut dyn ClassDriver]) {
        self.restart(classes);
    }

    /// Suspends the bus. Only possible once the device is configured.
    ///
    /// # Errors
    ///
    /// * [`InvalidState`](crate::UsbError::InvalidState) - The device is not configured or the
    ///   bus is not idle.
    pub fn suspend(&mut self) -> Result<()> {
        if self.enumerator.state() != EnumerationState::Ready {
            return Err(UsbError::InvalidState);
        }

        self.reset.suspend(&mut self.session)?;
        self.engine.tick(&mut self.phy, &self.session);
        Ok(())
    }

    /// Starts resume signalling. [`poll`](UsbHost::poll) returns [`PollResult::Resumed`] once the
    /// bus is active again.
    ///
    /// # Errors
    ///
    /// * [`InvalidState`](crate::UsbError::InvalidState) - The bus is not suspended.
    pub fn resume(&mut self) -> Result<()> {
        self.reset.resume(&mut self.phy, &mut self.session)
    }

    /// Advances bus reset, start-of-frame generation and enumeration, and polls the class drivers
    /// once the device is configured. Should be called as often as possible; the longer the gap
    /// between calls, the later start-of-frame markers go out.
    ///
    /// The list of class drivers must be the same on every call. The position of a driver in the
    /// list is how the host remembers which interfaces it claimed.
    ///
    /// ``` ignore
    /// usb_host.poll(&mut [&mut class1, &mut class2]);
    /// ```
    pub fn poll(&mut self, classes: &mut [&mut dyn ClassDriver]) -> PollResult {
        let mut result = PollResult::None;

        self.watchdog.tick(self.phy.now());
        if self.watchdog.take_fired() {
            usb_warn!("watchdog: no progress in {:?}, resetting", self.enumerator.state());
            self.restart(classes);
            result = PollResult::WatchdogReset;
        }

        let outcome = self.reset.poll(&mut self.phy, &mut self.session);
        if outcome == Some(ResetOutcome::Resumed) {
            result = PollResult::Resumed;
        }

        if self.reset.check_disconnect(&mut self.phy, &mut self.session) {
            self.restart(classes);
            result = PollResult::Disconnected;
        }

        self.engine.tick(&mut self.phy, &self.session);

        let prev = self.enumerator.state();

        let mut bus = Bus {
            phy: &mut self.phy,
            engine: &mut self.engine,
            session: &mut self.session,
            pipe: &mut self.pipe,
        };

        self.enumerator
            .poll(&mut bus, &mut self.reset, outcome, classes);

        let next = self.enumerator.state();
        if next != prev {
            self.watchdog.observe(prev, next, bus.phy.now());

            if next == EnumerationState::Failed {
                usb_warn!("enum: failed, waiting for watchdog");
            }

            if result == PollResult::None {
                result = PollResult::State(next);
            }
        } else if next == EnumerationState::Ready
            && matches!(bus.session.bus_state(), BusState::Idle(_))
        {
            if let (Some(device), Some(map)) = (
                self.enumerator.device_descriptor(),
                self.enumerator.endpoint_map(),
            ) {
                for (i, class) in classes.iter_mut().enumerate().take(MAX_CLASSES) {
                    if !self.enumerator.is_claimed(i) {
                        continue;
                    }

                    let mut handle = DeviceHandle::new(&mut bus, device, map);
                    if let Err(err) = class.poll(&mut handle) {
                        usb_debug!("class {}: poll failed: {:?}", i, err);
                    }
                }
            }
        }

        result
    }

    /// Runs `f` with a handle to the configured device, outside of class driver polling.
    ///
    /// # Errors
    ///
    /// * [`InvalidState`](crate::UsbError::InvalidState) - The device is not configured.
    pub fn with_device<R>(&mut self, f: impl FnOnce(&mut DeviceHandle<'_>) -> R) -> Result<R> {
        let (device, map) = match (
            self.enumerator.device_descriptor(),
            self.enumerator.endpoint_map(),
        ) {
            (Some(device), Some(map)) => (device, map),
            _ => return Err(UsbError::InvalidState),
        };

        let mut bus = Bus {
            phy: &mut self.phy,
            engine: &mut self.engine,
            session: &mut self.session,
            pipe: &mut self.pipe,
        };

        let mut handle = DeviceHandle::new(&mut bus, device, map);
        Ok(f(&mut handle))
    }

    fn restart(&mut self, classes: &mut [&mut dyn ClassDriver]) {
        let prev = self.enumerator.state();

        self.pipe.abort();
        self.enumerator.abort();
        self.watchdog
            .observe(prev, EnumerationState::Idle, self.phy.now());

        for class in classes.iter_mut() {
            class.reset();
        }
    }
}

/// Used to build new [`UsbHost`]s.
pub struct UsbHostBuilder<'a, P: UsbPhy, L: TransactionLog = ()> {
    phy: P,
    watchdog: &'a Watchdog,
    config: HostConfig,
    log: L,
}

macro_rules! builder_fields {
    ( $( $(#[$meta:meta])* $name:ident: $type:ty, )* ) => {
        $(
            $(#[$meta])*
            pub fn $name(mut self, $name: $type) -> Self {
                self.config.$name = $name;
                self
            }
        )*
    }
}

impl<'a, P: UsbPhy> UsbHostBuilder<'a, P, ()> {
    /// Creates a builder for a host on `phy`, supervised by `watchdog`.
    pub fn new(phy: P, watchdog: &'a Watchdog) -> UsbHostBuilder<'a, P, ()> {
        UsbHostBuilder {
            phy,
            watchdog,
            config: HostConfig::default(),
            log: (),
        }
    }
}

impl<'a, P: UsbPhy, L: TransactionLog> UsbHostBuilder<'a, P, L> {
    builder_fields! {
        /// Sets the address assigned to the device. Must be between 1 and 127.
        ///
        /// Default: `0x12`
        device_address: u8,

        /// Sets how many times each enumeration step is attempted before enumeration fails.
        ///
        /// Default: 3
        max_attempts: u8,

        /// Sets the transaction engine retry budget.
        ///
        /// Default: 3 retries, at most 1 of them for malformed responses
        retry_policy: RetryPolicy,

        /// Sets how long enumeration may go without progress before it is restarted. Should
        /// comfortably exceed one control transfer with all retries.
        ///
        /// Default: 1 s
        watchdog_interval: Duration,

        /// Sets how many 1 ms frames of start-of-frame markers are sent after reset before the first
        /// request. At high speed each frame is eight microframe markers. The default covers the
        /// 10 ms reset recovery time (TRSTRCY).
        ///
        /// Default: 10
        ready_delay_frames: u32,

        /// Sets the time the device is given to switch to its new address (TDSETADDR).
        ///
        /// Default: 2 ms
        set_address_recovery: Duration,

        /// Sets the bus turnaround timeout.
        ///
        /// Default: 20 µs
        response_timeout: Duration,

        /// Sets the bus reset and chirp timing.
        ///
        /// Default: [`ResetTiming::standard`]
        reset_timing: ResetTiming,
    }

    /// Attaches a passive observer that is called for every completed transaction.
    pub fn transaction_log<L2: TransactionLog>(self, log: L2) -> UsbHostBuilder<'a, P, L2> {
        UsbHostBuilder {
            phy: self.phy,
            watchdog: self.watchdog,
            config: self.config,
            log,
        }
    }

    /// Creates the [`UsbHost`].
    ///
    /// # Errors
    ///
    /// * [`InvalidState`](crate::UsbError::InvalidState) - The device address is not between 1
    ///   and 127, or an attempt count or interval is zero.
    pub fn build(self) -> Result<UsbHost<'a, P, L>> {
        let c = &self.config;

        if c.device_address == 0 || c.device_address > 127 {
            return Err(UsbError::InvalidState);
        }

        if c.max_attempts == 0
            || c.watchdog_interval == Duration::from_secs(0)
            || c.response_timeout == Duration::from_secs(0)
        {
            return Err(UsbError::InvalidState);
        }

        Ok(UsbHost::build(self.phy, self.watchdog, self.config, self.log))
    }
}
