//! Desktop simulator for the dustmon dust and weather station.
//!
//! Runs the core controller against simulated hardware for a number of wake
//! cycles. Deep sleep is emulated by dropping the controller and building a
//! new one over the same retained buffer, so every wake goes through the
//! restore path the device uses: records are reopened, the wall clock is
//! rebuilt from the slow oscillator and the subsystems come back warm.
//!
//! The simulated companion unit answers every listen window with one
//! measurement. The e-paper frame is written as a PNG after the last cycle.
//!
//! # Usage
//!
//! ```text
//! dustmon-simulator [CYCLES] [OUTPUT.png]
//! ```
//!
//! Defaults to 120 cycles and `dustmon-frame.png`. `RUST_LOG` selects the
//! log level (default `info`).

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use embassy_futures::block_on;
use embassy_time::Duration;
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use embedded_graphics_simulator::{BinaryColorTheme, OutputSettingsBuilder, SimulatorDisplay};
use log::{debug, error, info};

use dustmon_core::app_state::ProcessStatus;
use dustmon_core::clock::{LowPowerOscillator, WallClock};
use dustmon_core::config::{Config, InternetConfig, TimeConfig};
use dustmon_core::connectivity::{LinkError, StationDriver};
use dustmon_core::controller::runner::{CLOCK_POLL, SYNC_POLL, Scheduler, run_cycle};
use dustmon_core::controller::{Board, Controller, Platform};
use dustmon_core::display::framebuffer::{PANEL_HEIGHT_PX, PANEL_WIDTH_PX};
use dustmon_core::display::{DisplayError, EpdDisplay, FrameBuffer, PanelRefresh};
use dustmon_core::events::{PeerEvent, RadioEvents, StationEvent};
use dustmon_core::power::{BatteryMonitor, PowerRail};
use dustmon_core::sensors::{
    MeteoData, MeteoSensor, ParticulateData, ParticulateSensor, SensorError,
};
use dustmon_core::storage::RetainedStore;
use dustmon_core::transport::message::SERIAL_LEN;
use dustmon_core::transport::{DataMessage, Datagram, PeerAddress, PeerLink};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

const DEFAULT_CYCLES: u32 = 120;
const DEFAULT_OUTPUT: &str = "dustmon-frame.png";
const RETAINED_LEN: usize = 2048;
/// Pixel scale factor of the PNG.
const IMAGE_SCALE: u32 = 2;

/// True frequency of the simulated slow oscillator.
const OSCILLATOR_HZ: u64 = 136_000;
/// Calibration error in parts per million, so drift correction has
/// something to show.
const CALIBRATION_ERROR_PPM: u64 = 40;

const COMPANION: PeerAddress = PeerAddress::new([0x24, 0x6F, 0x28, 0x1A, 0x2B, 0x3C]);
const COMPANION_SERIAL: &[u8] = b"E5C9A1B2";

static EVENTS: RadioEvents = RadioEvents::new();

// ---------------------------------------------------------------------------
// Simulated time
// ---------------------------------------------------------------------------

/// Real time of the simulated world, shared by every simulated peripheral.
#[derive(Clone)]
struct World {
    micros: Rc<Cell<i64>>,
}

impl World {
    fn starting_now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as i64;
        Self {
            micros: Rc::new(Cell::new(micros)),
        }
    }

    fn now_micros(&self) -> i64 {
        self.micros.get()
    }

    fn advance(&self, by: Duration) {
        self.micros.set(self.micros.get() + by.as_micros() as i64);
    }

    fn secs_f64(&self) -> f64 {
        self.now_micros() as f64 / 1e6
    }
}

/// Device clock: reads zero at every boot until set.
struct SimClock {
    world: World,
    offset: Cell<i64>,
}

impl SimClock {
    fn boot(world: &World) -> Self {
        Self {
            world: world.clone(),
            offset: Cell::new(-world.now_micros()),
        }
    }
}

impl WallClock for SimClock {
    fn now_micros(&self) -> i64 {
        self.world.now_micros() + self.offset.get()
    }

    fn set_micros(&self, unix_micros: i64) {
        self.offset.set(unix_micros - self.world.now_micros());
    }
}

struct SimOscillator {
    world: World,
}

impl LowPowerOscillator for SimOscillator {
    fn ticks(&self) -> u64 {
        (self.world.now_micros() as u128 * OSCILLATOR_HZ as u128 / 1_000_000) as u64
    }

    fn measure_period(&mut self, _cycles: u32) -> u32 {
        let measured_hz = OSCILLATOR_HZ * (1_000_000 + CALIBRATION_ERROR_PPM);
        ((1_000_000u64 << 19) * 1_000_000 / measured_hz) as u32
    }
}

/// Steps the world clock instead of waiting.
struct SimScheduler {
    world: World,
}

impl Scheduler for SimScheduler {
    async fn pause(&mut self, status: ProcessStatus) {
        match status {
            ProcessStatus::AwaitingSync => self.world.advance(SYNC_POLL),
            ProcessStatus::NeedRefreshClock | ProcessStatus::Completed => {
                self.world.advance(CLOCK_POLL)
            }
        }
    }

    async fn rest(&mut self, delay: Duration) {
        self.world.advance(delay);
    }
}

// ---------------------------------------------------------------------------
// Mock data generation
// ---------------------------------------------------------------------------

/// Indoor readings that vary slowly over the simulated day.
fn indoor_meteo(t: f64) -> MeteoData {
    let temperature = 21.0 + 1.5 * (t / 5400.0).sin() + 0.2 * (t / 370.0).cos();
    let humidity = 48.0 + 6.0 * (t / 7200.0).sin();
    let pressure_hpa = 1013.0 + 4.0 * (t / 43_200.0).sin();
    MeteoData {
        pressure_q24_8: (pressure_hpa * 100.0 * 256.0) as u32,
        temperature_centi: (temperature * 100.0) as i32,
        humidity_q22_10: (humidity * 1024.0) as u32,
    }
}

fn indoor_particulate(t: f64) -> ParticulateData {
    let base = 6.0 + 4.0 * (t / 10_800.0).sin().abs();
    ParticulateData {
        pm1_0: base as u16,
        pm2_5: (base * 1.6) as u16,
        pm4_0: (base * 1.9) as u16,
        pm10: (base * 2.2) as u16,
    }
}

fn companion_message(t: f64, timestamp_micros: i64) -> DataMessage {
    let mut serial = [0u8; SERIAL_LEN];
    serial[..COMPANION_SERIAL.len()].copy_from_slice(COMPANION_SERIAL);
    DataMessage {
        serial,
        pm1_0: (3.0 + 2.0 * (t / 3600.0).sin().abs()) as u16,
        pm2_5: (5.0 + 3.0 * (t / 3600.0).sin().abs()) as u16,
        pm10: (8.0 + 5.0 * (t / 3600.0).sin().abs()) as u16,
        humidity: (78.0 + 10.0 * (t / 9000.0).sin()) as f32,
        temperature: (9.0 + 5.0 * (t / 5400.0).sin()) as f32,
        pressure: ((1002.0 + 4.0 * (t / 43_200.0).sin()) * 100.0) as f32,
        voltage: 3.95,
        timestamp_micros,
        flags: 0,
    }
}

// ---------------------------------------------------------------------------
// Simulated peripherals
// ---------------------------------------------------------------------------

struct SimMeteo {
    world: World,
    calibrated: bool,
}

impl MeteoSensor for SimMeteo {
    type Calibration = u32;

    async fn init(&mut self) -> Result<(), SensorError> {
        self.calibrated = true;
        Ok(())
    }

    async fn start_measurement(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    async fn stop_measurement(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    async fn is_measuring(&mut self) -> Result<bool, SensorError> {
        Ok(false)
    }

    async fn measurement_data(&mut self) -> Result<MeteoData, SensorError> {
        Ok(indoor_meteo(self.world.secs_f64()))
    }

    fn calibration(&self) -> Option<u32> {
        self.calibrated.then_some(0xB280)
    }

    fn restore_calibration(&mut self, _calibration: u32) {
        self.calibrated = true;
    }
}

struct SimParticulate {
    world: World,
    measuring: bool,
}

impl ParticulateSensor for SimParticulate {
    async fn probe(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    async fn serial_number(&mut self) -> Result<heapless::String<32>, SensorError> {
        heapless::String::try_from("SIM30-0001").map_err(|_| SensorError::ReadFailed {
            sensor: "particulate",
            operation: "read serial",
            details: "too long",
        })
    }

    async fn reset(&mut self) -> Result<(), SensorError> {
        self.measuring = false;
        Ok(())
    }

    async fn version(&mut self) -> Result<(u8, u8), SensorError> {
        Ok((2, 3))
    }

    async fn auto_cleaning_interval(&mut self) -> Result<u32, SensorError> {
        Ok(0)
    }

    async fn start_measurement(&mut self, clean_on_start: bool) -> Result<(), SensorError> {
        if clean_on_start {
            debug!(" [sim] fan cleaning");
        }
        self.measuring = true;
        Ok(())
    }

    async fn stop_measurement(&mut self) -> Result<(), SensorError> {
        self.measuring = false;
        Ok(())
    }

    async fn start_manual_fan_cleaning(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    async fn read_measurement(&mut self) -> Result<ParticulateData, SensorError> {
        if !self.measuring {
            return Err(SensorError::NotReady {
                sensor: "particulate",
            });
        }
        Ok(indoor_particulate(self.world.secs_f64()))
    }

    async fn wake_up(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    async fn sleep(&mut self) -> Result<(), SensorError> {
        self.measuring = false;
        Ok(())
    }
}

/// Access point and time server that answer instantly.
struct SimStation {
    world: World,
    initialized: bool,
}

impl SimStation {
    fn check(&self) -> Result<(), LinkError> {
        if self.initialized {
            Ok(())
        } else {
            Err(LinkError::NotInitialized)
        }
    }
}

impl StationDriver for SimStation {
    fn init(&mut self) -> Result<(), LinkError> {
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) {
        self.initialized = false;
    }

    fn start(&mut self, ssid: &str, _password: &str) -> Result<(), LinkError> {
        self.check()?;
        debug!(" [sim] station up for {}", ssid);
        EVENTS.post_station(StationEvent::Started);
        Ok(())
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.check()?;
        EVENTS.post_station(StationEvent::Connected);
        EVENTS.post_station(StationEvent::GotIp);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        self.check()?;
        EVENTS.post_station(StationEvent::Disconnected);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), LinkError> {
        self.check()?;
        EVENTS.post_station(StationEvent::Stopped);
        Ok(())
    }

    fn request_time(&mut self, server: &str) -> Result<(), LinkError> {
        self.check()?;
        debug!(" [sim] time query to {}", server);
        EVENTS.post_station(StationEvent::TimeReceived {
            unix_micros: self.world.now_micros(),
        });
        Ok(())
    }
}

/// ESP-NOW link with a companion that transmits as soon as the hub listens.
struct SimPeerLink {
    world: World,
    started: bool,
}

impl PeerLink for SimPeerLink {
    fn start(&mut self) -> Result<(), LinkError> {
        self.started = true;
        let message = companion_message(self.world.secs_f64(), self.world.now_micros());
        let mut payload = heapless::Vec::new();
        payload
            .extend_from_slice(&message.to_bytes())
            .map_err(|_| LinkError::Rejected("datagram too long"))?;
        EVENTS.post_peer(PeerEvent::Received(Datagram {
            from: COMPANION,
            received_at_micros: self.world.now_micros(),
            payload,
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.started = false;
    }

    fn add_peer(&mut self, _address: PeerAddress) -> Result<(), LinkError> {
        Ok(())
    }

    fn send(&mut self, to: PeerAddress, _payload: &[u8]) -> Result<(), LinkError> {
        if !self.started {
            return Err(LinkError::NotInitialized);
        }
        EVENTS.post_peer(PeerEvent::SendStatus {
            to,
            delivered: true,
        });
        Ok(())
    }
}

struct SimRail;

impl PowerRail for SimRail {
    fn enable(&mut self) {
        debug!(" [sim] step-up on");
    }

    fn disable(&mut self) {
        debug!(" [sim] step-up off");
    }

    fn hold(&mut self, latched: bool) {
        debug!(" [sim] step-up hold {}", latched);
    }
}

/// Battery discharging slowly with simulated time.
struct SimBattery {
    world: World,
    start_secs: f64,
}

impl BatteryMonitor for SimBattery {
    fn read_raw(&mut self) -> Option<u16> {
        let days = (self.world.secs_f64() - self.start_secs) / 86_400.0;
        Some((2480.0 - days * 15.0).max(1900.0) as u16)
    }
}

/// E-paper panel backed by an in-memory image that outlives the controller.
struct SimPanel {
    image: Rc<RefCell<SimulatorDisplay<BinaryColor>>>,
    full_refreshes: Rc<Cell<u32>>,
    partial_refreshes: Rc<Cell<u32>>,
}

impl EpdDisplay for SimPanel {
    async fn init(&mut self) -> Result<(), DisplayError> {
        Ok(())
    }

    async fn wake_up(&mut self) -> Result<(), DisplayError> {
        Ok(())
    }

    async fn sleep(&mut self) -> Result<(), DisplayError> {
        Ok(())
    }

    async fn display_frame(
        &mut self,
        frame: &mut FrameBuffer,
        refresh: PanelRefresh,
    ) -> Result<(), DisplayError> {
        let mut image = self.image.borrow_mut();
        for y in 0..PANEL_HEIGHT_PX {
            for x in 0..PANEL_WIDTH_PX {
                Pixel(Point::new(x as i32, y as i32), frame.pixel(x, y))
                    .draw(&mut *image)
                    .map_err(|_| DisplayError::Bus)?;
            }
        }
        frame.mark_clean();
        let counter = match refresh {
            PanelRefresh::Full => &self.full_refreshes,
            PanelRefresh::Partial => &self.partial_refreshes,
        };
        counter.set(counter.get() + 1);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform wiring
// ---------------------------------------------------------------------------

struct Simulated;

impl Platform for Simulated {
    type Storage = RetainedStore<Vec<u8>>;
    type Clock = SimClock;
    type Oscillator = SimOscillator;
    type StepUp = SimRail;
    type Battery = SimBattery;
    type Meteo = SimMeteo;
    type Particulate = SimParticulate;
    type Station = SimStation;
    type PeerLink = SimPeerLink;
    type Display = SimPanel;
}

/// Peripherals of one boot. Only the panel image and the retained region
/// carry over from the previous boot.
fn boot_board(
    world: &World,
    region: Vec<u8>,
    woken: bool,
    panel: &SimPanel,
    start_secs: f64,
) -> Board<Simulated> {
    Board {
        storage: RetainedStore::new(region, woken),
        clock: SimClock::boot(world),
        oscillator: SimOscillator {
            world: world.clone(),
        },
        step_up: SimRail,
        battery: SimBattery {
            world: world.clone(),
            start_secs,
        },
        meteo: SimMeteo {
            world: world.clone(),
            calibrated: false,
        },
        // A held rail keeps the sensor measuring through the sleep.
        particulate: SimParticulate {
            world: world.clone(),
            measuring: woken,
        },
        station: SimStation {
            world: world.clone(),
            initialized: false,
        },
        peer_link: SimPeerLink {
            world: world.clone(),
            started: false,
        },
        display: SimPanel {
            image: panel.image.clone(),
            full_refreshes: panel.full_refreshes.clone(),
            partial_refreshes: panel.partial_refreshes.clone(),
        },
    }
}

fn simulator_config() -> Config<'static> {
    Config {
        internet: InternetConfig {
            ssid: "simulated-ap",
            password: "simulated",
        },
        time: TimeConfig {
            ntp_server: "time.simulated",
            utc_offset_secs: 3600,
            ..TimeConfig::default()
        },
        ..Config::default()
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let cycles = args
        .next()
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_CYCLES);
    let output = args.next().unwrap_or_else(|| DEFAULT_OUTPUT.to_owned());
    info!("Starting dustmon simulator: {} wake cycles", cycles);

    let world = World::starting_now();
    let start_secs = world.secs_f64();
    let panel = SimPanel {
        image: Rc::new(RefCell::new(SimulatorDisplay::new(Size::new(
            PANEL_WIDTH_PX as u32,
            PANEL_HEIGHT_PX as u32,
        )))),
        full_refreshes: Rc::new(Cell::new(0)),
        partial_refreshes: Rc::new(Cell::new(0)),
    };
    let mut scheduler = SimScheduler {
        world: world.clone(),
    };

    let mut region = vec![0u8; RETAINED_LEN];
    let mut woken = false;
    for cycle in 1..=cycles {
        let board = boot_board(&world, region, woken, &panel, start_secs);
        let mut controller = Controller::new(board, simulator_config(), &EVENTS);

        let delay = block_on(async {
            if let Err(e) = controller.setup(woken).await {
                error!(" Setup incomplete: {}", e);
            }
            run_cycle(&mut controller, &mut scheduler).await
        });

        let drift_micros = controller.clock().now_micros() - world.now_micros();
        info!(
            "Cycle {}: wake #{}, clock error {} us, measuring {}, sleeping {} ms",
            cycle,
            controller.wake_state().wakeup_counter,
            drift_micros,
            controller.is_measuring(),
            delay.as_millis()
        );
        if let Some(remote) = controller.view_data().remote {
            debug!(" Remote: {:?}", remote);
        }

        region = controller.into_storage().into_inner();
        EVENTS.flush();
        block_on(scheduler.rest(delay));
        woken = true;
    }

    info!(
        "Panel refreshes: {} full, {} partial",
        panel.full_refreshes.get(),
        panel.partial_refreshes.get()
    );

    let settings = OutputSettingsBuilder::new()
        .scale(IMAGE_SCALE)
        .theme(BinaryColorTheme::Default)
        .build();
    match panel.image.borrow().to_rgb_output_image(&settings).save_png(&output) {
        Ok(()) => info!("Frame written to {}", output),
        Err(e) => error!("Could not write {}: {}", output, e),
    }
    info!("Simulator exiting");
}
