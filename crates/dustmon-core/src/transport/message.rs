//! Fixed-layout records exchanged with the companion unit.
//!
//! Both records use the C layout of the companion firmware, little-endian.
//!
//! Measurement message, 72 bytes:
//!
//! | Offset | Size | Field                        |
//! |--------|------|------------------------------|
//! | 0      | 32   | serial number, NUL padded    |
//! | 32     | 2    | PM1.0 (u16, 0xFFFF = none)   |
//! | 34     | 2    | PM2.5                        |
//! | 36     | 2    | PM10                         |
//! | 38     | 2    | padding                      |
//! | 40     | 4    | humidity (f32, %)            |
//! | 44     | 4    | temperature (f32, °C)        |
//! | 48     | 4    | pressure (f32, Pa)           |
//! | 52     | 4    | battery voltage (f32, V)     |
//! | 56     | 8    | timestamp (i64, Unix µs)     |
//! | 64     | 4    | fault flags (u32)            |
//! | 68     | 4    | padding                      |
//!
//! Correction reply, 16 bytes: receive time then send time, both i64 Unix µs.
//! Older companion firmware expects the two fields swapped (send time
//! first) and is not wire compatible with this reply.

use thiserror_no_std::Error;

use crate::view::{FaultFlags, SensorReading};

pub const SERIAL_LEN: usize = 32;
/// Particulate field value meaning "no data".
pub const PM_NONE: u16 = u16::MAX;
const PASCAL_PER_HPA: f32 = 100.0;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("expected {expected} bytes, got {actual}")]
    Size { expected: usize, actual: usize },
}

/// Measurement sent by the companion unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataMessage {
    pub serial: [u8; SERIAL_LEN],
    pub pm1_0: u16,
    pub pm2_5: u16,
    pub pm10: u16,
    pub humidity: f32,
    pub temperature: f32,
    /// Pascal.
    pub pressure: f32,
    pub voltage: f32,
    pub timestamp_micros: i64,
    pub flags: u32,
}

impl DataMessage {
    pub const SIZE: usize = 72;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != Self::SIZE {
            return Err(WireError::Size {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        let u16_at = |o: usize| u16::from_le_bytes([bytes[o], bytes[o + 1]]);
        let f32_at =
            |o: usize| f32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        let mut serial = [0u8; SERIAL_LEN];
        serial.copy_from_slice(&bytes[0..SERIAL_LEN]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[56..64]);
        Ok(Self {
            serial,
            pm1_0: u16_at(32),
            pm2_5: u16_at(34),
            pm10: u16_at(36),
            humidity: f32_at(40),
            temperature: f32_at(44),
            pressure: f32_at(48),
            voltage: f32_at(52),
            timestamp_micros: i64::from_le_bytes(ts),
            flags: u32::from_le_bytes([bytes[64], bytes[65], bytes[66], bytes[67]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..32].copy_from_slice(&self.serial);
        bytes[32..34].copy_from_slice(&self.pm1_0.to_le_bytes());
        bytes[34..36].copy_from_slice(&self.pm2_5.to_le_bytes());
        bytes[36..38].copy_from_slice(&self.pm10.to_le_bytes());
        bytes[40..44].copy_from_slice(&self.humidity.to_le_bytes());
        bytes[44..48].copy_from_slice(&self.temperature.to_le_bytes());
        bytes[48..52].copy_from_slice(&self.pressure.to_le_bytes());
        bytes[52..56].copy_from_slice(&self.voltage.to_le_bytes());
        bytes[56..64].copy_from_slice(&self.timestamp_micros.to_le_bytes());
        bytes[64..68].copy_from_slice(&self.flags.to_le_bytes());
        bytes
    }

    /// Serial number up to the first NUL, if it is valid UTF-8.
    pub fn serial_str(&self) -> &str {
        let end = self
            .serial
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SERIAL_LEN);
        core::str::from_utf8(&self.serial[..end]).unwrap_or("?")
    }

    pub fn reading(&self) -> SensorReading {
        let pm = |v: u16| (v != PM_NONE).then_some(v);
        SensorReading {
            pressure: Some(self.pressure / PASCAL_PER_HPA),
            temperature: Some(self.temperature),
            humidity: Some(self.humidity),
            pm1_0: pm(self.pm1_0),
            pm2_5: pm(self.pm2_5),
            pm10: pm(self.pm10),
            voltage: Some(self.voltage),
            flags: FaultFlags::from_bits(self.flags),
        }
    }
}

/// Reply that lets the companion unit compute its clock offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrectionMessage {
    pub receive_micros: i64,
    pub send_micros: i64,
}

impl CorrectionMessage {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.receive_micros.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.send_micros.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != Self::SIZE {
            return Err(WireError::Size {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        let mut receive = [0u8; 8];
        let mut send = [0u8; 8];
        receive.copy_from_slice(&bytes[0..8]);
        send.copy_from_slice(&bytes[8..16]);
        Ok(Self {
            receive_micros: i64::from_le_bytes(receive),
            send_micros: i64::from_le_bytes(send),
        })
    }
}
