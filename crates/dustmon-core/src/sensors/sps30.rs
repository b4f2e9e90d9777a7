//! Sensirion SPS30 particulate sensor over UART (SHDLC).

use embassy_time::Timer;
use embedded_io_async::{Read, Write};
use log::{error, warn};

use super::shdlc::{ShdlcError, ShdlcPort};
use super::{ParticulateData, ParticulateSensor, SensorError};

const SENSOR: &str = "SPS30";
const ADDRESS: u8 = 0x00;

const CMD_START_MEASUREMENT: u8 = 0x00;
const CMD_STOP_MEASUREMENT: u8 = 0x01;
const CMD_READ_MEASURED_VALUES: u8 = 0x03;
const CMD_SLEEP: u8 = 0x10;
const CMD_WAKE_UP: u8 = 0x11;
const CMD_START_FAN_CLEANING: u8 = 0x56;
const CMD_AUTO_CLEANING_INTERVAL: u8 = 0x80;
const CMD_DEVICE_INFORMATION: u8 = 0xD0;
const CMD_READ_VERSION: u8 = 0xD1;
const CMD_RESET: u8 = 0xD3;

const INFO_SERIAL_NUMBER: u8 = 0x03;
/// Sub-command and big-endian unsigned 16-bit output format.
const START_UINT16: [u8; 2] = [0x01, 0x05];
const MEASUREMENT_LEN: usize = 20;

pub struct Sps30<U> {
    port: ShdlcPort<U>,
}

impl<U: Read + Write> Sps30<U> {
    pub fn new(uart: U) -> Self {
        Self {
            port: ShdlcPort::new(uart, ADDRESS),
        }
    }

    async fn execute(
        &mut self,
        command: u8,
        data: &[u8],
        operation: &'static str,
    ) -> Result<heapless::Vec<u8, { super::shdlc::MAX_DATA_LEN }>, SensorError> {
        self.port.execute(command, data).await.map_err(|e| {
            error!(" SPS30 {} failed: {}", operation, e);
            match e {
                ShdlcError::Timeout => SensorError::Timeout {
                    sensor: SENSOR,
                    operation,
                },
                _ => SensorError::ReadFailed {
                    sensor: SENSOR,
                    operation,
                    details: "SHDLC exchange failed",
                },
            }
        })
    }
}

impl<U: Read + Write> ParticulateSensor for Sps30<U> {
    async fn probe(&mut self) -> Result<(), SensorError> {
        self.wake_up().await.ok();
        self.serial_number()
            .await
            .map(|_| ())
            .map_err(|_| SensorError::NotDetected { sensor: SENSOR })
    }

    async fn serial_number(&mut self) -> Result<heapless::String<32>, SensorError> {
        let data = self
            .execute(
                CMD_DEVICE_INFORMATION,
                &[INFO_SERIAL_NUMBER],
                "read serial number",
            )
            .await?;
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        let text = core::str::from_utf8(&data[..end]).map_err(|_| SensorError::ReadFailed {
            sensor: SENSOR,
            operation: "read serial number",
            details: "not ASCII",
        })?;
        let mut serial = heapless::String::new();
        for ch in text.chars() {
            if serial.push(ch).is_err() {
                break;
            }
        }
        Ok(serial)
    }

    async fn reset(&mut self) -> Result<(), SensorError> {
        self.execute(CMD_RESET, &[], "reset").await?;
        // Device needs up to 100 ms before it accepts commands again.
        Timer::after_millis(100).await;
        Ok(())
    }

    async fn version(&mut self) -> Result<(u8, u8), SensorError> {
        let data = self.execute(CMD_READ_VERSION, &[], "read version").await?;
        match data.as_slice() {
            [major, minor, ..] => Ok((*major, *minor)),
            _ => Err(SensorError::ReadFailed {
                sensor: SENSOR,
                operation: "read version",
                details: "short response",
            }),
        }
    }

    async fn auto_cleaning_interval(&mut self) -> Result<u32, SensorError> {
        let data = self
            .execute(CMD_AUTO_CLEANING_INTERVAL, &[0x00], "read cleaning interval")
            .await?;
        match data.as_slice() {
            [a, b, c, d] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
            _ => Err(SensorError::ReadFailed {
                sensor: SENSOR,
                operation: "read cleaning interval",
                details: "short response",
            }),
        }
    }

    async fn start_measurement(&mut self, clean_on_start: bool) -> Result<(), SensorError> {
        self.execute(CMD_START_MEASUREMENT, &START_UINT16, "start measurement")
            .await?;
        // The measurement runs either way; a missed cleaning is not fatal.
        if clean_on_start {
            if let Err(e) = self.start_manual_fan_cleaning().await {
                warn!(" Fan cleaning not started: {}", e);
            }
        }
        Ok(())
    }

    async fn stop_measurement(&mut self) -> Result<(), SensorError> {
        self.execute(CMD_STOP_MEASUREMENT, &[], "stop measurement")
            .await
            .map(|_| ())
    }

    async fn start_manual_fan_cleaning(&mut self) -> Result<(), SensorError> {
        self.execute(CMD_START_FAN_CLEANING, &[], "start fan cleaning")
            .await
            .map(|_| ())
    }

    async fn read_measurement(&mut self) -> Result<ParticulateData, SensorError> {
        let data = self
            .execute(CMD_READ_MEASURED_VALUES, &[], "read measurement")
            .await?;
        if data.len() < MEASUREMENT_LEN {
            return Err(SensorError::ReadFailed {
                sensor: SENSOR,
                operation: "read measurement",
                details: "no new data",
            });
        }
        let at = |i: usize| u16::from_be_bytes([data[2 * i], data[2 * i + 1]]);
        Ok(ParticulateData {
            pm1_0: at(0),
            pm2_5: at(1),
            pm4_0: at(2),
            pm10: at(3),
        })
    }

    async fn wake_up(&mut self) -> Result<(), SensorError> {
        // The first byte only wakes the UART interface.
        self.port.write_raw(&[0xFF]).await.map_err(|_| SensorError::ReadFailed {
            sensor: SENSOR,
            operation: "wake up",
            details: "serial write failed",
        })?;
        self.execute(CMD_WAKE_UP, &[], "wake up").await.map(|_| ())
    }

    async fn sleep(&mut self) -> Result<(), SensorError> {
        self.execute(CMD_SLEEP, &[], "sleep").await.map(|_| ())
    }
}
