//! Runtime configuration and fixed timing constants.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq)]
#[serde(bound(deserialize = "'de: 'a"))]
pub struct Config<'a> {
    pub internet: InternetConfig<'a>,
    pub time: TimeConfig<'a>,
    pub power: PowerConfig,
    pub peer: PeerConfig,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq)]
pub struct InternetConfig<'a> {
    pub ssid: &'a str,
    pub password: &'a str,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TimeConfig<'a> {
    /// Host name of the SNTP server.
    pub ntp_server: &'a str,
    /// Offset of local time from UTC, daylight saving included.
    pub utc_offset_secs: i32,
    /// Minimum time between two network resyncs.
    pub resync_interval_secs: u32,
}

impl Default for TimeConfig<'_> {
    fn default() -> Self {
        Self {
            ntp_server: "pool.ntp.org",
            utc_offset_secs: 0,
            resync_interval_secs: 20 * 3600,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PowerConfig {
    /// Multiplier applied on top of the nominal battery divider ratio.
    pub voltage_correction: f32,
    /// Below this battery voltage the battery-low fault flag is raised.
    pub battery_low_volts: f32,
    /// How long before the minute boundary the device must wake up.
    pub wakeup_lead_micros: u32,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            voltage_correction: 1.0,
            battery_low_volts: 3.4,
            wakeup_lead_micros: 870_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PeerConfig {
    /// How long a wake cycle keeps listening for a known companion unit.
    pub listen_window_secs: u32,
    /// Listening time while no companion unit is known yet, on a cold boot
    /// and every `discovery_interval_wakes` wakes. Covers a full minute so
    /// an unsynchronized sender is heard at least once. Other wakes without
    /// a known unit use `listen_window_secs`.
    pub discovery_window_secs: u32,
    pub discovery_interval_wakes: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen_window_secs: 10,
            discovery_window_secs: 65,
            discovery_interval_wakes: 60,
        }
    }
}

/// Fixed cadences and protocol constants.
pub mod timing {
    /// Remote readings older than this are dropped from the view.
    pub const REMOTE_DATA_TTL_SECS: i64 = 180;
    /// Minimum spacing between two meteo samples.
    pub const METEO_INTERVAL_SECS: i64 = 58;
    /// Particulate sensor warm-up before readings are valid.
    pub const PM_MATURATION_SECS: i64 = 30;
    /// Minute of the hour at which the hourly particulate measurement starts.
    pub const PM_START_MINUTE: u8 = 59;
    /// A minute-59 start is skipped when a measurement began this recently.
    pub const PM_RESTART_GUARD_SECS: i64 = 60;
    /// Partial refreshes between two display power-downs.
    pub const DISPLAY_POWER_DOWN_MODULUS: u32 = 10;
    /// Measurements between two manual fan cleanings.
    pub const FAN_CLEANING_PERIOD: u32 = 168;
    /// Any wall clock below this (2023-08-14) has never been synchronized.
    pub const PLAUSIBLE_EPOCH_SECS: i64 = 1_692_025_000;
    /// Fixed point scale of the oscillator calibration factor (Q13.19).
    pub const CALIBRATION_SCALE: u64 = 1 << 19;
    pub const CALIBRATION_PASSES: usize = 5;
    pub const CALIBRATION_CYCLES: u32 = 1000;
    pub const MAX_STATION_RETRIES: u8 = 5;
    pub const MAX_SEND_ATTEMPTS: u8 = 3;
    /// A send without status after this long counts as failed.
    pub const SEND_STATUS_TIMEOUT_MICROS: i64 = 2_000_000;
    /// Sleep cap while a particulate measurement matures.
    pub const MEASURING_SLEEP_CAP_SECS: u64 = 30;
    /// Retry spacing for a failed sync while the clock is still implausible.
    pub const SYNC_RETRY_SECS: i64 = 60;
    /// Retry spacing for a failed periodic resync.
    pub const RESYNC_RETRY_SECS: i64 = 15 * 60;
}
