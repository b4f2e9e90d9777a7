//! Host-side stand-ins for the hardware the core crate drives.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::convert::Infallible;

use embedded_hal::digital::{ErrorType as PinErrorType, OutputPin};
use embedded_hal::i2c::{ErrorType as I2cErrorType, Operation as I2cOperation};
use embedded_hal::spi::{ErrorType as SpiErrorType, Operation as SpiOperation};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::digital::Wait;
use embedded_hal_async::i2c::I2c;
use embedded_hal_async::spi::SpiDevice;
use embedded_io_async::{ErrorType as IoErrorType, Read, Write};

use crate::clock::{LowPowerOscillator, MICROS_PER_SECOND, WallClock};
use crate::connectivity::{LinkError, StationDriver};
use crate::controller::{Board, Platform};
use crate::display::framebuffer::FrameBuffer;
use crate::display::{DisplayError, EpdDisplay, PanelRefresh};
use crate::power::{BatteryMonitor, PowerRail};
use crate::sensors::{MeteoData, MeteoSensor, ParticulateData, ParticulateSensor, SensorError};
use crate::storage::RetainedStore;
use crate::transport::{DataMessage, Datagram, PeerAddress, PeerLink};

// Radio

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationCall {
    Init,
    Deinit,
    Start,
    Connect,
    Disconnect,
    Stop,
    RequestTime,
}

/// Records station commands; completions are posted by the test.
#[derive(Default)]
pub struct TestStation {
    pub calls: Vec<StationCall>,
}

impl StationDriver for TestStation {
    fn init(&mut self) -> Result<(), LinkError> {
        self.calls.push(StationCall::Init);
        Ok(())
    }

    fn deinit(&mut self) {
        self.calls.push(StationCall::Deinit);
    }

    fn start(&mut self, _ssid: &str, _password: &str) -> Result<(), LinkError> {
        self.calls.push(StationCall::Start);
        Ok(())
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.calls.push(StationCall::Connect);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        self.calls.push(StationCall::Disconnect);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), LinkError> {
        self.calls.push(StationCall::Stop);
        Ok(())
    }

    fn request_time(&mut self, _server: &str) -> Result<(), LinkError> {
        self.calls.push(StationCall::RequestTime);
        Ok(())
    }
}

#[derive(Default)]
pub struct TestPeerLink {
    pub started: bool,
    pub peers: Vec<PeerAddress>,
    pub sent: Vec<(PeerAddress, Vec<u8>)>,
}

impl PeerLink for TestPeerLink {
    fn start(&mut self) -> Result<(), LinkError> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.started = false;
    }

    fn add_peer(&mut self, address: PeerAddress) -> Result<(), LinkError> {
        if !self.peers.contains(&address) {
            self.peers.push(address);
        }
        Ok(())
    }

    fn send(&mut self, to: PeerAddress, payload: &[u8]) -> Result<(), LinkError> {
        if !self.started {
            return Err(LinkError::NotInitialized);
        }
        self.sent.push((to, payload.to_vec()));
        Ok(())
    }
}

pub fn sample_message() -> DataMessage {
    let mut serial = [0u8; 32];
    serial[..8].copy_from_slice(b"E5C9A1B2");
    DataMessage {
        serial,
        pm1_0: 3,
        pm2_5: 5,
        pm10: 8,
        temperature: 12.5,
        humidity: 81.0,
        pressure: 100_250.0,
        voltage: 3.9,
        timestamp_micros: 1_700_000_000_000_000,
        flags: 0,
    }
}

pub fn datagram(from: PeerAddress, received_at_micros: i64, message: &DataMessage) -> Datagram {
    let mut payload = heapless::Vec::new();
    // A data message always fits a datagram.
    let _ = payload.extend_from_slice(&message.to_bytes());
    Datagram {
        from,
        received_at_micros,
        payload,
    }
}

// Sensors

#[derive(Default)]
pub struct TestMeteo {
    pub inits: u32,
    pub stops: u32,
    pub starts: u32,
    pub restored: Option<u32>,
    pub absent: bool,
    /// Number of `is_measuring` polls that still report a conversion.
    pub busy_polls: u32,
}

impl TestMeteo {
    pub const CALIBRATION: u32 = 0x5EED;
}

impl MeteoSensor for TestMeteo {
    type Calibration = u32;

    async fn init(&mut self) -> Result<(), SensorError> {
        if self.absent {
            return Err(SensorError::NotDetected { sensor: "test" });
        }
        self.inits += 1;
        Ok(())
    }

    async fn start_measurement(&mut self) -> Result<(), SensorError> {
        self.starts += 1;
        Ok(())
    }

    async fn stop_measurement(&mut self) -> Result<(), SensorError> {
        self.stops += 1;
        Ok(())
    }

    async fn is_measuring(&mut self) -> Result<bool, SensorError> {
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    async fn measurement_data(&mut self) -> Result<MeteoData, SensorError> {
        Ok(MeteoData {
            pressure_q24_8: 25_939_200,
            temperature_centi: 2150,
            humidity_q22_10: 46_080,
        })
    }

    fn calibration(&self) -> Option<u32> {
        if self.inits > 0 || self.restored.is_some() {
            Some(Self::CALIBRATION)
        } else {
            None
        }
    }

    fn restore_calibration(&mut self, calibration: u32) {
        self.restored = Some(calibration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticulateCall {
    Probe,
    Serial,
    Reset,
    Version,
    CleaningInterval,
    Start { clean: bool },
    Stop,
    FanCleaning,
    Read,
    WakeUp,
    Sleep,
}

#[derive(Default)]
pub struct TestParticulate {
    pub calls: Vec<ParticulateCall>,
    pub absent: bool,
    pub fail_start: bool,
}

impl TestParticulate {
    pub const READING: ParticulateData = ParticulateData {
        pm1_0: 4,
        pm2_5: 9,
        pm4_0: 11,
        pm10: 12,
    };

    fn record(&mut self, call: ParticulateCall) -> Result<(), SensorError> {
        self.calls.push(call);
        if self.absent {
            Err(SensorError::NotDetected { sensor: "test" })
        } else {
            Ok(())
        }
    }
}

impl ParticulateSensor for TestParticulate {
    async fn probe(&mut self) -> Result<(), SensorError> {
        self.record(ParticulateCall::Probe)
    }

    async fn serial_number(&mut self) -> Result<heapless::String<32>, SensorError> {
        self.record(ParticulateCall::Serial)?;
        let mut serial = heapless::String::new();
        let _ = serial.push_str("TEST0001");
        Ok(serial)
    }

    async fn reset(&mut self) -> Result<(), SensorError> {
        self.record(ParticulateCall::Reset)
    }

    async fn version(&mut self) -> Result<(u8, u8), SensorError> {
        self.record(ParticulateCall::Version)?;
        Ok((2, 3))
    }

    async fn auto_cleaning_interval(&mut self) -> Result<u32, SensorError> {
        self.record(ParticulateCall::CleaningInterval)?;
        Ok(604_800)
    }

    async fn start_measurement(&mut self, clean_on_start: bool) -> Result<(), SensorError> {
        self.record(ParticulateCall::Start {
            clean: clean_on_start,
        })?;
        if self.fail_start {
            return Err(SensorError::Timeout {
                sensor: "test",
                operation: "start measurement",
            });
        }
        Ok(())
    }

    async fn stop_measurement(&mut self) -> Result<(), SensorError> {
        self.record(ParticulateCall::Stop)
    }

    async fn start_manual_fan_cleaning(&mut self) -> Result<(), SensorError> {
        self.record(ParticulateCall::FanCleaning)
    }

    async fn read_measurement(&mut self) -> Result<ParticulateData, SensorError> {
        self.record(ParticulateCall::Read)?;
        Ok(Self::READING)
    }

    async fn wake_up(&mut self) -> Result<(), SensorError> {
        self.record(ParticulateCall::WakeUp)
    }

    async fn sleep(&mut self) -> Result<(), SensorError> {
        self.record(ParticulateCall::Sleep)
    }
}

// Buses

/// Register file behind an I2C address. A write sets the register pointer
/// with its first byte and stores the rest; reads continue from the pointer.
pub struct TestI2c {
    pub registers: [u8; 256],
    pointer: u8,
}

impl Default for TestI2c {
    fn default() -> Self {
        Self {
            registers: [0; 256],
            pointer: 0,
        }
    }
}

impl I2cErrorType for TestI2c {
    type Error = Infallible;
}

impl I2c for TestI2c {
    async fn transaction(
        &mut self,
        _address: u8,
        operations: &mut [I2cOperation<'_>],
    ) -> Result<(), Self::Error> {
        for operation in operations {
            match operation {
                I2cOperation::Write(bytes) => {
                    if let Some((&register, values)) = bytes.split_first() {
                        self.pointer = register;
                        for value in values {
                            self.registers[self.pointer as usize] = *value;
                            self.pointer = self.pointer.wrapping_add(1);
                        }
                    }
                }
                I2cOperation::Read(buf) => {
                    for byte in buf.iter_mut() {
                        *byte = self.registers[self.pointer as usize];
                        self.pointer = self.pointer.wrapping_add(1);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Byte stream with a scripted receive side. Reading an empty queue
/// returns zero bytes.
#[derive(Default)]
pub struct TestUart {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
}

impl IoErrorType for TestUart {
    type Error = Infallible;
}

impl Read for TestUart {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut n = 0;
        while n < buf.len() {
            let Some(byte) = self.rx.pop_front() else {
                break;
            };
            buf[n] = byte;
            n += 1;
        }
        Ok(n)
    }
}

impl Write for TestUart {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Byte-stuffed SHDLC slave response frame, boundaries included.
pub fn shdlc_response(command: u8, state: u8, data: &[u8]) -> Vec<u8> {
    let mut body = vec![0x00, command, state, data.len() as u8];
    body.extend_from_slice(data);
    let sum = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    body.push(!sum);

    let mut frame = vec![0x7E];
    for byte in body {
        match byte {
            0x7E | 0x7D | 0x11 | 0x13 => {
                frame.push(0x7D);
                frame.push(byte ^ 0x20);
            }
            _ => frame.push(byte),
        }
    }
    frame.push(0x7E);
    frame
}

/// Records every SPI write as its own entry.
#[derive(Default)]
pub struct TestSpi {
    pub writes: Vec<Vec<u8>>,
}

impl SpiErrorType for TestSpi {
    type Error = Infallible;
}

impl SpiDevice for TestSpi {
    async fn transaction(
        &mut self,
        operations: &mut [SpiOperation<'_, u8>],
    ) -> Result<(), Self::Error> {
        for operation in operations {
            if let SpiOperation::Write(bytes) = operation {
                self.writes.push(bytes.to_vec());
            }
        }
        Ok(())
    }
}

/// Output pin that never fails and an input that is always idle.
#[derive(Default)]
pub struct TestPin {
    pub high: bool,
}

impl PinErrorType for TestPin {
    type Error = Infallible;
}

impl OutputPin for TestPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.high = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.high = true;
        Ok(())
    }
}

impl Wait for TestPin {
    async fn wait_for_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn wait_for_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn wait_for_rising_edge(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn wait_for_falling_edge(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn wait_for_any_edge(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub struct NoDelay;

impl DelayNs for NoDelay {
    async fn delay_ns(&mut self, _ns: u32) {}
}

// Display

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpdCall {
    Init,
    WakeUp,
    Sleep,
    Frame(PanelRefresh),
}

#[derive(Default)]
pub struct TestEpd {
    pub calls: Vec<EpdCall>,
}

impl EpdDisplay for TestEpd {
    async fn init(&mut self) -> Result<(), DisplayError> {
        self.calls.push(EpdCall::Init);
        Ok(())
    }

    async fn wake_up(&mut self) -> Result<(), DisplayError> {
        self.calls.push(EpdCall::WakeUp);
        Ok(())
    }

    async fn sleep(&mut self) -> Result<(), DisplayError> {
        self.calls.push(EpdCall::Sleep);
        Ok(())
    }

    async fn display_frame(
        &mut self,
        frame: &mut FrameBuffer,
        refresh: PanelRefresh,
    ) -> Result<(), DisplayError> {
        self.calls.push(EpdCall::Frame(refresh));
        frame.mark_clean();
        Ok(())
    }
}

// Clock and power

/// Wall clock that only moves when the test says so. Clones share the time.
#[derive(Clone, Default)]
pub struct TestClock {
    micros: Rc<Cell<i64>>,
}

impl TestClock {
    pub fn new(micros: i64) -> Self {
        Self {
            micros: Rc::new(Cell::new(micros)),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance_micros(secs * MICROS_PER_SECOND);
    }

    pub fn advance_micros(&self, micros: i64) {
        self.micros.set(self.micros.get() + micros);
    }
}

impl WallClock for TestClock {
    fn now_micros(&self) -> i64 {
        self.micros.get()
    }

    fn set_micros(&self, unix_micros: i64) {
        self.micros.set(unix_micros);
    }
}

/// Oscillator at exactly one tick per microsecond. Clones share the count.
#[derive(Clone, Default)]
pub struct TestOscillator {
    pub ticks: Rc<Cell<u64>>,
}

impl TestOscillator {
    pub const CALIBRATION: u32 = 1 << 19;
}

impl LowPowerOscillator for TestOscillator {
    fn ticks(&self) -> u64 {
        self.ticks.get()
    }

    fn measure_period(&mut self, _cycles: u32) -> u32 {
        Self::CALIBRATION
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RailLog {
    pub enabled: bool,
    pub held: bool,
    pub enables: u32,
    pub disables: u32,
}

/// Step-up converter whose history stays readable after the controller
/// took ownership.
#[derive(Clone, Default)]
pub struct TestRail {
    pub log: Rc<RefCell<RailLog>>,
}

impl TestRail {
    pub fn snapshot(&self) -> RailLog {
        *self.log.borrow()
    }
}

impl PowerRail for TestRail {
    fn enable(&mut self) {
        let mut log = self.log.borrow_mut();
        log.enabled = true;
        log.enables += 1;
    }

    fn disable(&mut self) {
        let mut log = self.log.borrow_mut();
        log.enabled = false;
        log.disables += 1;
    }

    fn hold(&mut self, latched: bool) {
        self.log.borrow_mut().held = latched;
    }
}

pub struct TestBattery {
    pub raw: Option<u16>,
}

impl BatteryMonitor for TestBattery {
    fn read_raw(&mut self) -> Option<u16> {
        self.raw
    }
}

pub struct TestPlatform;

impl Platform for TestPlatform {
    type Storage = RetainedStore<Vec<u8>>;
    type Clock = TestClock;
    type Oscillator = TestOscillator;
    type StepUp = TestRail;
    type Battery = TestBattery;
    type Meteo = TestMeteo;
    type Particulate = TestParticulate;
    type Station = TestStation;
    type PeerLink = TestPeerLink;
    type Display = TestEpd;
}

/// Board around the given storage region, sharing clock, oscillator and
/// rail handles with the test.
pub fn test_board(
    region: Vec<u8>,
    valid: bool,
    clock: &TestClock,
    oscillator: &TestOscillator,
    rail: &TestRail,
) -> Board<TestPlatform> {
    Board {
        storage: RetainedStore::new(region, valid),
        clock: clock.clone(),
        oscillator: oscillator.clone(),
        step_up: rail.clone(),
        // About 3.9 V through the divider.
        battery: TestBattery { raw: Some(2420) },
        meteo: TestMeteo::default(),
        particulate: TestParticulate::default(),
        station: TestStation::default(),
        peer_link: TestPeerLink::default(),
        display: TestEpd::default(),
    }
}
