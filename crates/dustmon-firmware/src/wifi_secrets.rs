//! Build-time network configuration.
//!
//! `build.rs` exports these from the environment or a `.env` file.

use dustmon_core::config::{Config, InternetConfig, TimeConfig};

pub const WIFI_SSID: &str = env!("WIFI_SSID");
pub const WIFI_PASSWORD: &str = env!("WIFI_PASSWORD");
pub const NTP_SERVER: &str = env!("NTP_SERVER");
const UTC_OFFSET_SECS: &str = env!("UTC_OFFSET_SECS");

/// Runtime configuration with the baked-in credentials.
pub fn config() -> Config<'static> {
    Config {
        internet: InternetConfig {
            ssid: WIFI_SSID,
            password: WIFI_PASSWORD,
        },
        time: TimeConfig {
            ntp_server: NTP_SERVER,
            utc_offset_secs: UTC_OFFSET_SECS.parse().unwrap_or(0),
            ..TimeConfig::default()
        },
        ..Config::default()
    }
}
