//! Readings shown on the display.

use serde::{Deserialize, Serialize};

/// Fault indications carried with a reading.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultFlags(u32);

impl FaultFlags {
    pub const BATTERY_LOW: Self = Self(1 << 0);
    pub const METEO_FAULT: Self = Self(1 << 1);
    pub const PARTICULATE_FAULT: Self = Self(1 << 2);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

/// One station's measurements. `None` means no data.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorReading {
    /// hPa
    pub pressure: Option<f32>,
    /// °C
    pub temperature: Option<f32>,
    /// % relative humidity
    pub humidity: Option<f32>,
    /// µg/m³
    pub pm1_0: Option<u16>,
    pub pm2_5: Option<u16>,
    pub pm10: Option<u16>,
    /// Battery voltage
    pub voltage: Option<f32>,
    pub flags: FaultFlags,
}

/// Everything the display shows: the on-board station and, when a
/// companion unit reported recently, the outdoor one.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct ViewData {
    pub local: SensorReading,
    pub remote: Option<SensorReading>,
}

impl ViewData {
    /// Whether both views show the same set of sections.
    pub fn same_shape(&self, other: &ViewData) -> bool {
        self.remote.is_some() == other.remote.is_some()
    }
}
