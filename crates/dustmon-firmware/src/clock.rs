//! Wall clock and RTC slow-clock access for ESP32-S3.
//!
//! The wall clock is the embassy monotonic time plus an offset. The RTC
//! timer keeps counting through deep sleep and is read and calibrated
//! through raw register access.

use core::cell::Cell;
use core::ptr::{read_volatile, write_volatile};

use dustmon_core::clock::LowPowerOscillator;
use dustmon_core::clock::WallClock;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Instant;
use log::warn;

/// Unix time minus monotonic time, in microseconds.
static OFFSET_MICROS: BlockingMutex<CriticalSectionRawMutex, Cell<i64>> =
    BlockingMutex::new(Cell::new(0));

/// Handle to the single system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_micros(&self) -> i64 {
        Instant::now().as_micros() as i64 + OFFSET_MICROS.lock(|offset| offset.get())
    }

    fn set_micros(&self, unix_micros: i64) {
        let monotonic = Instant::now().as_micros() as i64;
        OFFSET_MICROS.lock(|offset| offset.set(unix_micros - monotonic));
    }
}

// RTC_CNTL timer
const RTC_CNTL_TIME_UPDATE_REG: u32 = 0x6000_800C;
const RTC_CNTL_TIME_LOW0_REG: u32 = 0x6000_8010;
const RTC_CNTL_TIME_HIGH0_REG: u32 = 0x6000_8014;
const TIME_UPDATE: u32 = 1 << 31;

// TIMG0 slow clock calibration
const TIMG_RTCCALICFG_REG: u32 = 0x6001_F068;
const TIMG_RTCCALICFG1_REG: u32 = 0x6001_F06C;
const CALI_CLK_SEL_SHIFT: u32 = 13;
const CALI_CLK_SEL_RC_SLOW: u32 = 0;
const CALI_RDY: u32 = 1 << 15;
const CALI_MAX_SHIFT: u32 = 16;
const CALI_MAX_MASK: u32 = 0x7FFF;
const CALI_START: u32 = 1 << 31;
const CALI_VALUE_SHIFT: u32 = 7;

const XTAL_MHZ: u64 = 40;
/// Fraction bits of the calibration value.
const CAL_FRACT: u32 = 19;
const READY_POLL_LIMIT: u32 = 1_000_000;

/// The RTC slow clock. Only one instance may exist.
pub struct RtcOscillator {
    _private: (),
}

impl RtcOscillator {
    /// # Safety
    /// The RTC timer and the TIMG0 calibration unit must not be driven by
    /// anything else.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl LowPowerOscillator for RtcOscillator {
    fn ticks(&self) -> u64 {
        critical_section::with(|_| unsafe {
            write_volatile(RTC_CNTL_TIME_UPDATE_REG as *mut u32, TIME_UPDATE);
            let low = read_volatile(RTC_CNTL_TIME_LOW0_REG as *const u32);
            let high = read_volatile(RTC_CNTL_TIME_HIGH0_REG as *const u32) & 0xFFFF;
            ((high as u64) << 32) | low as u64
        })
    }

    /// Count crystal cycles over `cycles` slow clock periods.
    fn measure_period(&mut self, cycles: u32) -> u32 {
        let cycles = cycles.min(CALI_MAX_MASK);
        let xtal_cycles = critical_section::with(|_| unsafe {
            let cfg = TIMG_RTCCALICFG_REG as *mut u32;
            let base = (CALI_CLK_SEL_RC_SLOW << CALI_CLK_SEL_SHIFT)
                | ((cycles & CALI_MAX_MASK) << CALI_MAX_SHIFT);
            // One-shot mode, restart the measurement
            write_volatile(cfg, base);
            write_volatile(cfg, base | CALI_START);

            let mut polls = 0;
            while read_volatile(cfg) & CALI_RDY == 0 {
                polls += 1;
                if polls >= READY_POLL_LIMIT {
                    write_volatile(cfg, base);
                    return None;
                }
            }
            let value = read_volatile(TIMG_RTCCALICFG1_REG as *const u32) >> CALI_VALUE_SHIFT;
            write_volatile(cfg, base);
            Some(value)
        });

        match xtal_cycles {
            Some(xtal_cycles) if cycles > 0 => {
                let period = ((xtal_cycles as u64) << CAL_FRACT) / (cycles as u64 * XTAL_MHZ);
                u32::try_from(period).unwrap_or(0)
            }
            _ => {
                warn!(" Slow clock calibration timed out");
                0
            }
        }
    }
}
