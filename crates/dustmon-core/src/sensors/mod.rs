//! Sensor driver interfaces and the providers that orchestrate them.
//!
//! Drivers speak their wire protocol and nothing else. Providers own a driver
//! and implement the wake/measure/sleep cycle the controller asks for,
//! including persistence of whatever the driver needs across deep sleep.

pub mod bme280;
pub mod meteo;
pub mod particulate;
pub mod shdlc;
pub mod sps30;

pub use meteo::MeteoProvider;
pub use particulate::ParticulateProvider;

use serde::{Serialize, de::DeserializeOwned};
use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("{sensor} not detected")]
    NotDetected { sensor: &'static str },
    #[error("{sensor} initialization failed: {details}")]
    InitializationFailed {
        sensor: &'static str,
        details: &'static str,
    },
    #[error("{sensor} failed to {operation}: {details}")]
    ReadFailed {
        sensor: &'static str,
        operation: &'static str,
        details: &'static str,
    },
    #[error("{sensor} timed out waiting to {operation}")]
    Timeout {
        sensor: &'static str,
        operation: &'static str,
    },
    #[error("{sensor} has not been set up")]
    NotReady { sensor: &'static str },
}

/// Raw fixed-point output of the meteo sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeteoData {
    /// Pa in Q24.8
    pub pressure_q24_8: u32,
    /// Hundredths of a degree Celsius
    pub temperature_centi: i32,
    /// %RH in Q22.10
    pub humidity_q22_10: u32,
}

/// Mass concentrations in µg/m³.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParticulateData {
    pub pm1_0: u16,
    pub pm2_5: u16,
    pub pm4_0: u16,
    pub pm10: u16,
}

/// Temperature, humidity and pressure sensor.
pub trait MeteoSensor {
    /// Device-specific constants worth keeping across deep sleep.
    type Calibration: Serialize + DeserializeOwned;

    /// Detect, reset and configure the device, reading its calibration.
    fn init(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    fn start_measurement(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    fn stop_measurement(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    fn is_measuring(&mut self) -> impl Future<Output = Result<bool, SensorError>>;

    fn measurement_data(&mut self) -> impl Future<Output = Result<MeteoData, SensorError>>;

    fn calibration(&self) -> Option<Self::Calibration>;

    fn restore_calibration(&mut self, calibration: Self::Calibration);
}

/// Particulate matter sensor.
pub trait ParticulateSensor {
    fn probe(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    fn serial_number(&mut self)
    -> impl Future<Output = Result<heapless::String<32>, SensorError>>;

    fn reset(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    /// Firmware version as (major, minor).
    fn version(&mut self) -> impl Future<Output = Result<(u8, u8), SensorError>>;

    fn auto_cleaning_interval(&mut self) -> impl Future<Output = Result<u32, SensorError>>;

    /// Start measuring; with `clean_on_start` a fan cleaning cycle follows.
    fn start_measurement(
        &mut self,
        clean_on_start: bool,
    ) -> impl Future<Output = Result<(), SensorError>>;

    fn stop_measurement(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    fn start_manual_fan_cleaning(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    fn read_measurement(&mut self) -> impl Future<Output = Result<ParticulateData, SensorError>>;

    fn wake_up(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    fn sleep(&mut self) -> impl Future<Output = Result<(), SensorError>>;
}
