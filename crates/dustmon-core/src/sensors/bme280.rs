//! Bosch BME280 over I²C, forced mode, integer compensation.

use embassy_time::Timer;
use embedded_hal_async::i2c::I2c;
use log::error;
use serde::{Deserialize, Serialize};

use super::{MeteoData, MeteoSensor, SensorError};

pub const DEFAULT_ADDRESS: u8 = 0x76;

const CHIP_ID: u8 = 0x60;
const SOFT_RESET_WORD: u8 = 0xB6;

const REG_CALIB_00: u8 = 0x88;
const REG_CHIP_ID: u8 = 0xD0;
const REG_RESET: u8 = 0xE0;
const REG_CALIB_26: u8 = 0xE1;
const REG_CTRL_HUM: u8 = 0xF2;
const REG_STATUS: u8 = 0xF3;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_CONFIG: u8 = 0xF5;
const REG_DATA: u8 = 0xF7;

const STATUS_MEASURING: u8 = 1 << 3;
const STATUS_IM_UPDATE: u8 = 1 << 0;
/// Oversampling x1 for humidity.
const CTRL_HUM_X1: u8 = 0b001;
/// Temperature x1, pressure x1, forced mode.
const CTRL_MEAS_FORCED: u8 = 0b001_001_01;
/// Same oversampling, sleep mode.
const CTRL_MEAS_SLEEP: u8 = 0b001_001_00;

const SENSOR: &str = "BME280";

/// Factory trimming constants read from the device NVM.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calibration {
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,
    pub p1: u16,
    pub p2: i16,
    pub p3: i16,
    pub p4: i16,
    pub p5: i16,
    pub p6: i16,
    pub p7: i16,
    pub p8: i16,
    pub p9: i16,
    pub h1: u8,
    pub h2: i16,
    pub h3: u8,
    pub h4: i16,
    pub h5: i16,
    pub h6: i8,
}

impl Calibration {
    /// Decode the 0x88..0xA1 and 0xE1..0xE7 register blocks.
    pub fn from_registers(block0: &[u8; 26], block1: &[u8; 7]) -> Self {
        let u16_at = |o: usize| u16::from_le_bytes([block0[o], block0[o + 1]]);
        let i16_at = |o: usize| i16::from_le_bytes([block0[o], block0[o + 1]]);
        Self {
            t1: u16_at(0),
            t2: i16_at(2),
            t3: i16_at(4),
            p1: u16_at(6),
            p2: i16_at(8),
            p3: i16_at(10),
            p4: i16_at(12),
            p5: i16_at(14),
            p6: i16_at(16),
            p7: i16_at(18),
            p8: i16_at(20),
            p9: i16_at(22),
            h1: block0[25],
            h2: i16::from_le_bytes([block1[0], block1[1]]),
            h3: block1[2],
            h4: ((block1[3] as i8 as i16) << 4) | (block1[4] & 0x0F) as i16,
            h5: ((block1[5] as i8 as i16) << 4) | (block1[4] >> 4) as i16,
            h6: block1[6] as i8,
        }
    }

    /// Returns (temperature in 0.01 °C, fine temperature).
    pub fn compensate_temperature(&self, adc_t: i32) -> (i32, i32) {
        let t1 = self.t1 as i32;
        let var1 = (((adc_t >> 3) - (t1 << 1)) * self.t2 as i32) >> 11;
        let var2 = (((((adc_t >> 4) - t1) * ((adc_t >> 4) - t1)) >> 12) * self.t3 as i32) >> 14;
        let t_fine = var1 + var2;
        ((t_fine * 5 + 128) >> 8, t_fine)
    }

    /// Pressure in Pa, Q24.8.
    pub fn compensate_pressure(&self, adc_p: i32, t_fine: i32) -> u32 {
        let mut var1 = t_fine as i64 - 128_000;
        let mut var2 = var1 * var1 * self.p6 as i64;
        var2 += (var1 * self.p5 as i64) << 17;
        var2 += (self.p4 as i64) << 35;
        var1 = ((var1 * var1 * self.p3 as i64) >> 8) + ((var1 * self.p2 as i64) << 12);
        var1 = (((1i64 << 47) + var1) * self.p1 as i64) >> 33;
        if var1 == 0 {
            return 0;
        }
        let mut p = 1_048_576 - adc_p as i64;
        p = (((p << 31) - var2) * 3125) / var1;
        var1 = (self.p9 as i64 * (p >> 13) * (p >> 13)) >> 25;
        var2 = (self.p8 as i64 * p) >> 19;
        p = ((p + var1 + var2) >> 8) + ((self.p7 as i64) << 4);
        p as u32
    }

    /// Relative humidity in %, Q22.10.
    pub fn compensate_humidity(&self, adc_h: i32, t_fine: i32) -> u32 {
        let mut v = t_fine - 76_800;
        v = ((((adc_h << 14) - ((self.h4 as i32) << 20) - (self.h5 as i32 * v)) + 16_384) >> 15)
            * (((((((v * self.h6 as i32) >> 10) * (((v * self.h3 as i32) >> 11) + 32_768))
                >> 10)
                + 2_097_152)
                * self.h2 as i32
                + 8192)
                >> 14);
        v -= ((((v >> 15) * (v >> 15)) >> 7) * self.h1 as i32) >> 4;
        v = v.clamp(0, 419_430_400);
        (v >> 12) as u32
    }
}

pub struct Bme280<I> {
    i2c: I,
    address: u8,
    calibration: Option<Calibration>,
}

impl<I: I2c> Bme280<I> {
    pub fn new(i2c: I, address: u8) -> Self {
        Self {
            i2c,
            address,
            calibration: None,
        }
    }

    async fn read(&mut self, register: u8, buf: &mut [u8]) -> Result<(), SensorError> {
        self.i2c
            .write_read(self.address, &[register], buf)
            .await
            .map_err(|e| {
                error!(" BME280 read of 0x{:02x} failed: {:?}", register, e);
                SensorError::ReadFailed {
                    sensor: SENSOR,
                    operation: "read register",
                    details: "I2C communication error",
                }
            })
    }

    async fn write(&mut self, register: u8, value: u8) -> Result<(), SensorError> {
        self.i2c
            .write(self.address, &[register, value])
            .await
            .map_err(|e| {
                error!(" BME280 write of 0x{:02x} failed: {:?}", register, e);
                SensorError::ReadFailed {
                    sensor: SENSOR,
                    operation: "write register",
                    details: "I2C communication error",
                }
            })
    }
}

impl<I: I2c> MeteoSensor for Bme280<I> {
    type Calibration = Calibration;

    async fn init(&mut self) -> Result<(), SensorError> {
        let mut id = [0u8];
        self.read(REG_CHIP_ID, &mut id)
            .await
            .map_err(|_| SensorError::NotDetected { sensor: SENSOR })?;
        if id[0] != CHIP_ID {
            error!(" Unexpected chip id 0x{:02x}", id[0]);
            return Err(SensorError::NotDetected { sensor: SENSOR });
        }
        self.write(REG_RESET, SOFT_RESET_WORD).await?;
        Timer::after_millis(2).await;

        // NVM copy finishes shortly after reset.
        let mut status = [STATUS_IM_UPDATE];
        for _ in 0..10 {
            self.read(REG_STATUS, &mut status).await?;
            if status[0] & STATUS_IM_UPDATE == 0 {
                break;
            }
            Timer::after_millis(1).await;
        }
        if status[0] & STATUS_IM_UPDATE != 0 {
            return Err(SensorError::InitializationFailed {
                sensor: SENSOR,
                details: "NVM copy did not finish",
            });
        }

        let mut block0 = [0u8; 26];
        let mut block1 = [0u8; 7];
        self.read(REG_CALIB_00, &mut block0).await?;
        self.read(REG_CALIB_26, &mut block1).await?;
        self.calibration = Some(Calibration::from_registers(&block0, &block1));

        // Filter off, standby irrelevant in forced mode.
        self.write(REG_CONFIG, 0).await?;
        self.write(REG_CTRL_HUM, CTRL_HUM_X1).await?;
        self.write(REG_CTRL_MEAS, CTRL_MEAS_SLEEP).await
    }

    async fn start_measurement(&mut self) -> Result<(), SensorError> {
        // ctrl_hum only takes effect after a ctrl_meas write.
        self.write(REG_CTRL_HUM, CTRL_HUM_X1).await?;
        self.write(REG_CTRL_MEAS, CTRL_MEAS_FORCED).await
    }

    async fn stop_measurement(&mut self) -> Result<(), SensorError> {
        self.write(REG_CTRL_MEAS, CTRL_MEAS_SLEEP).await
    }

    async fn is_measuring(&mut self) -> Result<bool, SensorError> {
        let mut status = [0u8];
        self.read(REG_STATUS, &mut status).await?;
        Ok(status[0] & STATUS_MEASURING != 0)
    }

    async fn measurement_data(&mut self) -> Result<MeteoData, SensorError> {
        let calibration = self
            .calibration
            .ok_or(SensorError::NotReady { sensor: SENSOR })?;
        let mut raw = [0u8; 8];
        self.read(REG_DATA, &mut raw).await?;
        let adc_p = ((raw[0] as i32) << 12) | ((raw[1] as i32) << 4) | (raw[2] as i32 >> 4);
        let adc_t = ((raw[3] as i32) << 12) | ((raw[4] as i32) << 4) | (raw[5] as i32 >> 4);
        let adc_h = ((raw[6] as i32) << 8) | raw[7] as i32;
        let (temperature_centi, t_fine) = calibration.compensate_temperature(adc_t);
        Ok(MeteoData {
            pressure_q24_8: calibration.compensate_pressure(adc_p, t_fine),
            temperature_centi,
            humidity_q22_10: calibration.compensate_humidity(adc_h, t_fine),
        })
    }

    fn calibration(&self) -> Option<Calibration> {
        self.calibration
    }

    fn restore_calibration(&mut self, calibration: Calibration) {
        self.calibration = Some(calibration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestI2c;
    use embassy_futures::block_on;

    // Example trimming values from the Bosch datasheet.
    fn datasheet_calibration() -> Calibration {
        Calibration {
            t1: 27504,
            t2: 26435,
            t3: -1000,
            p1: 36477,
            p2: -10685,
            p3: 3024,
            p4: 2855,
            p5: 140,
            p6: -7,
            p7: 15500,
            p8: -14600,
            p9: 6000,
            ..Calibration::default()
        }
    }

    #[test]
    fn test_temperature_compensation() {
        let (centi, t_fine) = datasheet_calibration().compensate_temperature(519_888);
        assert_eq!(t_fine, 128_422);
        assert_eq!(centi, 2508);
    }

    #[test]
    fn test_pressure_compensation_is_plausible() {
        let cal = datasheet_calibration();
        let (_, t_fine) = cal.compensate_temperature(519_888);
        let pa = cal.compensate_pressure(415_148, t_fine) as f32 / 256.0;
        assert!((100_000.0..101_000.0).contains(&pa), "{pa}");
    }

    #[test]
    fn test_humidity_is_clamped() {
        let cal = Calibration {
            h1: 75,
            h2: 362,
            h3: 0,
            h4: 313,
            h5: 50,
            h6: 30,
            ..datasheet_calibration()
        };
        let h = cal.compensate_humidity(0, 128_422);
        assert_eq!(h, 0);
        let h = cal.compensate_humidity(30_000, 128_422) as f32 / 1024.0;
        assert!((0.0..=100.0).contains(&h), "{h}");
    }

    #[test]
    fn test_calibration_nibbles() {
        let mut block0 = [0u8; 26];
        block0[0..2].copy_from_slice(&27504u16.to_le_bytes());
        block0[25] = 75;
        let block1 = [0x6A, 0x01, 0x00, 0x13, 0x25, 0x03, 0x1E];
        let cal = Calibration::from_registers(&block0, &block1);
        assert_eq!(cal.t1, 27504);
        assert_eq!(cal.h1, 75);
        assert_eq!(cal.h2, 362);
        assert_eq!(cal.h4, (0x13 << 4) | 0x5);
        assert_eq!(cal.h5, (0x03 << 4) | 0x2);
        assert_eq!(cal.h6, 30);
    }

    #[test]
    fn test_wrong_chip_id_is_not_detected() {
        let mut i2c = TestI2c::default();
        i2c.registers[REG_CHIP_ID as usize] = 0x58;
        let mut sensor = Bme280::new(i2c, DEFAULT_ADDRESS);
        assert_eq!(
            block_on(sensor.init()),
            Err(SensorError::NotDetected { sensor: SENSOR })
        );
    }

    #[test]
    fn test_init_reads_calibration_and_sleeps() {
        let mut i2c = TestI2c::default();
        i2c.registers[REG_CHIP_ID as usize] = CHIP_ID;
        i2c.registers[REG_CALIB_00 as usize] = 0x70;
        i2c.registers[REG_CALIB_00 as usize + 1] = 0x6B;
        let mut sensor = Bme280::new(i2c, DEFAULT_ADDRESS);
        block_on(sensor.init()).unwrap();
        assert_eq!(sensor.calibration().unwrap().t1, 0x6B70);
        assert_eq!(sensor.i2c.registers[REG_CTRL_MEAS as usize], CTRL_MEAS_SLEEP);
        assert_eq!(sensor.i2c.registers[REG_CTRL_HUM as usize], CTRL_HUM_X1);

        block_on(sensor.start_measurement()).unwrap();
        assert_eq!(sensor.i2c.registers[REG_CTRL_MEAS as usize], CTRL_MEAS_FORCED);
        assert!(!block_on(sensor.is_measuring()).unwrap());
    }
}
