//! Wake-cycle orchestration.
//!
//! Each wake the controller restores its state, corrects the clock for the
//! time spent asleep and brings the subsystems up. The scheduler then calls
//! [`Controller::process`] until it reports [`ProcessStatus::Completed`],
//! persists everything with [`Controller::hibernate`] and sleeps for
//! [`Controller::next_wake_delay`].
//!
//! The radio is shared: while a time sync holds the station link the peer
//! link stays down, and nothing but the sync runs until the clock is
//! plausible.

pub mod runner;

use log::{debug, error, info, warn};

use crate::app_state::{
    AppError, ControllerData, ParticulateStatus, ProcessStatus, WakeCycleState,
};
use crate::clock::time_sync::TimeSync;
use crate::clock::{self, LocalTime, LowPowerOscillator, WallClock, is_time_plausible};
use crate::config::Config;
use crate::config::timing::{
    METEO_INTERVAL_SECS, PM_MATURATION_SECS, PM_RESTART_GUARD_SECS, PM_START_MINUTE,
    REMOTE_DATA_TTL_SECS,
};
use crate::connectivity::StationDriver;
use crate::display::{DisplayOrchestrator, EpdDisplay, FrameBuffer};
use crate::events::RadioEvents;
use crate::power::{BatteryMonitor, PowerRail, battery_volts};
use crate::sensors::{MeteoProvider, MeteoSensor, ParticulateProvider, ParticulateSensor};
use crate::storage::{
    CONTROLLER_DATA_TAG, PersistentStorage, VIEW_DATA_TAG, WAKE_STATE_TAG,
};
use crate::transport::{PeerLink, PeerState, PeerTransport};
use crate::view::{FaultFlags, ViewData};

use embassy_time::Duration;

/// Hardware a controller runs on.
pub trait Platform {
    type Storage: PersistentStorage;
    type Clock: WallClock;
    type Oscillator: LowPowerOscillator;
    type StepUp: PowerRail;
    type Battery: BatteryMonitor;
    type Meteo: MeteoSensor;
    type Particulate: ParticulateSensor;
    type Station: StationDriver;
    type PeerLink: PeerLink;
    type Display: EpdDisplay;
}

/// Concrete peripherals handed to [`Controller::new`].
pub struct Board<P: Platform> {
    pub storage: P::Storage,
    pub clock: P::Clock,
    pub oscillator: P::Oscillator,
    pub step_up: P::StepUp,
    pub battery: P::Battery,
    pub meteo: P::Meteo,
    pub particulate: P::Particulate,
    pub station: P::Station,
    pub peer_link: P::PeerLink,
    pub display: P::Display,
}

pub struct Controller<'a, P: Platform> {
    config: Config<'a>,
    storage: P::Storage,
    clock: P::Clock,
    oscillator: P::Oscillator,
    step_up: P::StepUp,
    battery: P::Battery,
    meteo: MeteoProvider<P::Meteo>,
    particulate: ParticulateProvider<P::Particulate>,
    time_sync: TimeSync<'a, P::Station>,
    transport: PeerTransport<'a, P::PeerLink>,
    view: DisplayOrchestrator<P::Display>,
    wake: WakeCycleState,
    data: ControllerData,
    view_data: ViewData,
    refresh_pending: bool,
    /// When the peer link came up this cycle.
    listen_started: Option<i64>,
    /// This cycle listens for a new companion unit the full discovery window.
    discovery: bool,
}

impl<'a, P: Platform> Controller<'a, P> {
    pub fn new(board: Board<P>, config: Config<'a>, events: &'a RadioEvents) -> Self {
        Self {
            config,
            storage: board.storage,
            clock: board.clock,
            oscillator: board.oscillator,
            step_up: board.step_up,
            battery: board.battery,
            meteo: MeteoProvider::new(board.meteo),
            particulate: ParticulateProvider::new(board.particulate),
            time_sync: TimeSync::new(board.station, events, config.internet, config.time),
            transport: PeerTransport::new(board.peer_link, events),
            view: DisplayOrchestrator::new(board.display, FrameBuffer::new(true)),
            wake: WakeCycleState::default(),
            data: ControllerData::default(),
            view_data: ViewData::default(),
            refresh_pending: false,
            listen_started: None,
            discovery: false,
        }
    }

    /// Restore or reset state and bring every subsystem up.
    ///
    /// A failing subsystem does not stop the others; the first failure is
    /// returned once all of them were tried.
    pub async fn setup(&mut self, woken: bool) -> Result<(), AppError> {
        if woken {
            self.wake = self.storage.get_or_default(WAKE_STATE_TAG);
            self.data = self.storage.get_or_default(CONTROLLER_DATA_TAG);
            self.view_data = self.storage.get_or_default(VIEW_DATA_TAG);
            self.restore_clock();
            if self.wake.calibration == 0 {
                self.wake.calibration = clock::calibrate(&mut self.oscillator);
            }
        } else {
            self.wake = WakeCycleState::default();
            self.data = ControllerData::default();
            self.view_data = ViewData::default();
            self.wake.calibration = clock::calibrate(&mut self.oscillator);
        }

        if self.is_measuring() {
            // Keep the sensor powered through the rest of its measurement.
            self.step_up.enable();
            self.step_up.hold(true);
        } else {
            self.step_up.hold(false);
            if !woken {
                self.step_up.enable();
            }
        }

        self.wake.wakeup_counter = self.wake.wakeup_counter.wrapping_add(1);
        self.discovery = !woken || self.is_discovery_wake();
        info!(
            " Wake #{} ({}), particulate {:?}",
            self.wake.wakeup_counter,
            if woken { "warm" } else { "cold" },
            self.data.particulate
        );
        self.start_subsystems(woken).await
    }

    /// Bring the subsystems back after a sleep that preserved RAM.
    pub async fn resume(&mut self) -> Result<(), AppError> {
        self.wake.wakeup_counter = self.wake.wakeup_counter.wrapping_add(1);
        self.discovery = self.is_discovery_wake();
        debug!(" Resumed, wake #{}", self.wake.wakeup_counter);
        self.start_subsystems(true).await
    }

    async fn start_subsystems(&mut self, woken: bool) -> Result<(), AppError> {
        self.refresh_pending = false;
        self.listen_started = None;

        let mut result = Ok(());
        keep_first(&mut result, self.meteo.setup(woken, &self.storage).await);
        keep_first(&mut result, self.particulate.setup(woken, &self.storage).await);
        keep_first(&mut result, self.view.setup(woken, &self.storage).await);
        self.transport.setup(&self.storage);
        let now = self.clock.now_secs();
        keep_first(&mut result, self.time_sync.setup(woken, now, &mut self.data));
        result
    }

    fn is_discovery_wake(&self) -> bool {
        let interval = self.config.peer.discovery_interval_wakes;
        interval != 0 && self.wake.wakeup_counter % interval == 0
    }

    fn restore_clock(&mut self) {
        let ticks_now = self.oscillator.ticks();
        match clock::corrected_time(
            self.wake.wall_clock_before_sleep_micros,
            self.wake.ticks_before_sleep,
            ticks_now,
            self.wake.calibration,
        ) {
            Some(micros) => {
                self.clock.set_micros(micros);
                debug!(" Clock restored to {} us", micros);
            }
            None => warn!(" Oscillator uncalibrated, clock left as is"),
        }
    }

    /// Run one pass of the cycle.
    pub async fn process(&mut self) -> ProcessStatus {
        self.time_sync.process(&self.clock, &mut self.data);
        let now = self.clock.now_secs();
        if !is_time_plausible(now) {
            return ProcessStatus::AwaitingSync;
        }
        let local = LocalTime::from_unix(now, self.config.time.utc_offset_secs);

        if self.time_sync.is_due(now, local, &self.data, self.is_measuring())
            && !self.transport.is_awaiting_delivery()
        {
            info!(" Periodic time sync");
            self.transport.deinit();
            self.listen_started = None;
            self.time_sync.restart(now, &mut self.data);
        }

        if !self.time_sync.in_progress() && !self.transport.is_active() {
            self.time_sync.release_radio();
            match self.transport.init() {
                Ok(()) => self.listen_started = Some(now),
                Err(e) => error!(" Peer link failed: {}", e),
            }
        }

        if self.transport.is_active() {
            self.receive_remote(now).await;
            self.transport.expire_delivery(self.clock.now_micros());
        }

        if self.view_data.remote.is_some() && now - self.data.last_remote_time > REMOTE_DATA_TTL_SECS
        {
            info!(" Remote reading expired");
            self.view_data.remote = None;
        }

        if now - self.data.last_meteo_time > METEO_INTERVAL_SECS {
            self.sample_meteo(now).await;
        }

        self.drive_particulate(now, local).await;

        if local.second == 0 && self.refresh_pending {
            self.refresh_view(local).await;
            self.refresh_pending = false;
        } else if local.second == 59 {
            self.refresh_pending = true;
        }

        if self.time_sync.in_progress() || !self.round_trip_resolved(now) {
            return ProcessStatus::AwaitingSync;
        }
        if self.refresh_pending {
            ProcessStatus::NeedRefreshClock
        } else {
            ProcessStatus::Completed
        }
    }

    /// Whether the cycle's work is done and the device may sleep.
    pub fn can_hibernate(&self) -> bool {
        let now = self.clock.now_secs();
        is_time_plausible(now)
            && !self.time_sync.in_progress()
            && self.round_trip_resolved(now)
            && !self.refresh_pending
    }

    /// Stop the subsystems and persist everything the next wake needs.
    ///
    /// Every step runs even when an earlier one failed; the first failure
    /// is returned.
    pub async fn hibernate(&mut self) -> Result<(), AppError> {
        let mut result = Ok(());
        keep_first(&mut result, self.meteo.hibernate(&mut self.storage).await);
        self.view.hibernate().await;
        keep_first(&mut result, self.view.save(&mut self.storage));
        keep_first(&mut result, self.transport.hibernate(&mut self.storage));
        self.time_sync.shutdown();
        keep_first(&mut result, self.particulate.save(&mut self.storage));
        keep_first(&mut result, self.storage.set(VIEW_DATA_TAG, &self.view_data));
        keep_first(&mut result, self.storage.set(CONTROLLER_DATA_TAG, &self.data));

        self.wake.wall_clock_before_sleep_micros = self.clock.now_micros();
        self.wake.ticks_before_sleep = self.oscillator.ticks();
        keep_first(&mut result, self.storage.set(WAKE_STATE_TAG, &self.wake));

        if let Err(e) = &result {
            error!(" Hibernate incomplete: {}", e);
        } else {
            debug!(" State saved");
        }
        result
    }

    /// Sleep length until just before the next minute boundary.
    pub fn next_wake_delay(&self) -> Duration {
        clock::hibernation_delay(
            self.clock.now_micros(),
            self.config.power.wakeup_lead_micros,
            self.is_measuring(),
        )
    }

    pub fn is_measuring(&self) -> bool {
        self.data.particulate == ParticulateStatus::Measuring
    }

    pub fn wake_state(&self) -> &WakeCycleState {
        &self.wake
    }

    pub fn controller_data(&self) -> &ControllerData {
        &self.data
    }

    pub fn view_data(&self) -> &ViewData {
        &self.view_data
    }

    pub fn clock(&self) -> &P::Clock {
        &self.clock
    }

    pub fn display_frame(&self) -> &FrameBuffer {
        self.view.frame()
    }

    pub fn storage(&self) -> &P::Storage {
        &self.storage
    }

    /// Give up the controller, keeping only what survives deep sleep.
    pub fn into_storage(self) -> P::Storage {
        self.storage
    }

    fn round_trip_resolved(&self, now: i64) -> bool {
        if !self.transport.is_active() || self.transport.is_completed() {
            return true;
        }
        if self.transport.is_awaiting_delivery() {
            return false;
        }
        let window = match self.transport.peer() {
            PeerState::NoPeer if self.discovery => self.config.peer.discovery_window_secs,
            _ => self.config.peer.listen_window_secs,
        };
        self.listen_started
            .is_some_and(|started| now - started >= window as i64)
    }

    async fn receive_remote(&mut self, now: i64) {
        let Some(received) = self
            .transport
            .get_last_message(Duration::from_ticks(0))
            .await
        else {
            return;
        };
        debug!(
            " Remote reading from {} ({})",
            received.from,
            received.message.serial_str()
        );
        if let Err(e) = self.transport.send_response(self.clock.now_micros()) {
            warn!(" Correction not sent: {}", e);
        }
        self.view_data.remote = Some(received.message.reading());
        self.data.last_remote_time = now;
    }

    async fn sample_meteo(&mut self, now: i64) {
        self.data.last_meteo_time = now;
        let mut result = self.meteo.activate().await;
        if result.is_ok() {
            result = self.meteo.measure().await;
        }
        if let Err(e) = self.meteo.deactivate().await {
            debug!(" Meteo deactivate failed: {}", e);
        }

        let local = &mut self.view_data.local;
        match result {
            Ok(()) => {
                local.pressure = Some(self.meteo.pressure());
                local.temperature = Some(self.meteo.temperature());
                local.humidity = Some(self.meteo.humidity());
                local.flags.set(FaultFlags::METEO_FAULT, false);
            }
            Err(e) => {
                warn!(" Meteo sample failed: {}", e);
                local.pressure = None;
                local.temperature = None;
                local.humidity = None;
                local.flags.set(FaultFlags::METEO_FAULT, true);
            }
        }
    }

    async fn drive_particulate(&mut self, now: i64, local: LocalTime) {
        match self.data.particulate {
            ParticulateStatus::Measuring => {
                if now - self.data.last_pm_time >= PM_MATURATION_SECS {
                    self.finish_particulate().await;
                }
            }
            ParticulateStatus::Startup => self.start_particulate(now).await,
            ParticulateStatus::Sleeping => {
                if local.minute == PM_START_MINUTE
                    && now - self.data.last_pm_time >= PM_RESTART_GUARD_SECS
                {
                    self.start_particulate(now).await;
                }
            }
        }
    }

    async fn start_particulate(&mut self, now: i64) {
        self.step_up.enable();
        self.read_battery();
        self.data.last_pm_time = now;

        if self.data.particulate == ParticulateStatus::Sleeping {
            if let Err(e) = self.particulate.wake_up().await {
                warn!(" Particulate wake-up failed: {}", e);
            }
        }
        match self.particulate.start_measure().await {
            Ok(()) => {
                info!(" Particulate measurement started");
                self.data.particulate = ParticulateStatus::Measuring;
                self.step_up.hold(true);
            }
            Err(e) => {
                error!(" Particulate measurement not started: {}", e);
                let local = &mut self.view_data.local;
                local.flags.set(FaultFlags::PARTICULATE_FAULT, true);
                local.pm1_0 = None;
                local.pm2_5 = None;
                local.pm10 = None;
                self.data.particulate = ParticulateStatus::Sleeping;
                self.step_up.disable();
            }
        }
    }

    async fn finish_particulate(&mut self) {
        let local = &mut self.view_data.local;
        match self.particulate.read_measurement().await {
            Ok(data) => {
                local.pm1_0 = Some(data.pm1_0);
                local.pm2_5 = Some(data.pm2_5);
                local.pm10 = Some(data.pm10);
                local.flags.set(FaultFlags::PARTICULATE_FAULT, false);
            }
            Err(e) => {
                warn!(" Particulate read failed: {}", e);
                local.pm1_0 = None;
                local.pm2_5 = None;
                local.pm10 = None;
                local.flags.set(FaultFlags::PARTICULATE_FAULT, true);
            }
        }
        if let Err(e) = self.particulate.hibernate().await {
            warn!(" Particulate sleep failed: {}", e);
        }
        self.data.particulate = ParticulateStatus::Sleeping;
        self.step_up.hold(false);
        self.step_up.disable();
        info!(" Particulate measurement finished");
    }

    fn read_battery(&mut self) {
        let volts = self
            .battery
            .read_raw()
            .map(|raw| battery_volts(raw, self.config.power.voltage_correction));
        let local = &mut self.view_data.local;
        local.voltage = volts;
        let low = volts.is_some_and(|v| v < self.config.power.battery_low_volts);
        local.flags.set(FaultFlags::BATTERY_LOW, low);
        if low {
            warn!(" Battery low");
        }
    }

    async fn refresh_view(&mut self, local: LocalTime) {
        match self.view.update_view(&self.view_data, local).await {
            Ok(report) => debug!(" View refreshed: {:?}", report),
            Err(e) => error!(" View refresh failed: {}", e),
        }
    }
}

fn keep_first<E: Into<AppError>>(first: &mut Result<(), AppError>, next: Result<(), E>) {
    if let Err(e) = next {
        if first.is_ok() {
            *first = Err(e.into());
        }
    }
}
