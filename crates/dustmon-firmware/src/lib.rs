//! ESP32-S3 firmware-specific modules for dustmon
//!
//! This crate contains hardware-specific code that cannot compile on desktop
//! targets: the esp-radio bridge for Wi-Fi station mode and ESP-NOW, RTC
//! register access for the slow clock, deep sleep with RTC fast memory, the
//! power rail and battery adapters, and build-time network credentials.

#![no_std]

extern crate alloc;

pub mod board;
pub mod clock;
pub mod radio;
pub mod sleep;
pub mod wifi_secrets;
