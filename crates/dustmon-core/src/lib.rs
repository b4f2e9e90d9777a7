//! Hardware-independent core library for dustmon
//!
//! This crate contains all platform-agnostic logic of the dust and meteo
//! hub: the wake-cycle controller, clock drift correction and network time
//! sync, the radio state machines, sensor and e-paper drivers written
//! against the embedded-hal traits, and the deep-sleep record store.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32-S3) and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod app_state;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod display;
pub mod events;
pub mod power;
pub mod sensors;
pub mod storage;
pub mod transport;
pub mod view;

#[cfg(test)]
mod test_support;
