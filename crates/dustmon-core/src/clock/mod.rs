//! Wall-clock tracking across deep sleep.
//!
//! While the device sleeps only the low-power oscillator keeps counting.
//! Before sleeping the controller snapshots the wall clock and the tick
//! counter; on wake the elapsed ticks are scaled by the calibration factor
//! and added back to the snapshot.

pub mod sntp;
pub mod time_sync;

use embassy_time::Duration;
use log::info;

use crate::config::timing::{
    CALIBRATION_CYCLES, CALIBRATION_PASSES, CALIBRATION_SCALE, MEASURING_SLEEP_CAP_SECS,
    PLAUSIBLE_EPOCH_SECS,
};

pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// Settable wall clock in microseconds since the Unix epoch.
pub trait WallClock {
    fn now_micros(&self) -> i64;

    fn set_micros(&self, unix_micros: i64);

    fn now_secs(&self) -> i64 {
        self.now_micros().div_euclid(MICROS_PER_SECOND)
    }
}

/// Free-running low-power oscillator that keeps counting in deep sleep.
pub trait LowPowerOscillator {
    fn ticks(&self) -> u64;

    /// Measure the oscillator period over `cycles` cycles against the main
    /// clock. Returns microseconds per tick in Q13.19 fixed point, or 0 when
    /// the measurement failed.
    fn measure_period(&mut self, cycles: u32) -> u32;
}

/// Run the calibration passes and keep the last reading.
pub fn calibrate<O: LowPowerOscillator>(oscillator: &mut O) -> u32 {
    let mut factor = 0;
    for _ in 0..CALIBRATION_PASSES {
        factor = oscillator.measure_period(CALIBRATION_CYCLES);
    }
    if factor != 0 {
        let millihertz = CALIBRATION_SCALE * 1_000_000_000 / factor as u64;
        info!(
            " Low-power oscillator calibrated: factor {} ({}.{:03} Hz)",
            factor,
            millihertz / 1000,
            millihertz % 1000
        );
    }
    factor
}

/// Microseconds covered by `elapsed_ticks` at the given calibration factor.
///
/// The product is computed in 128 bits so multi-day sleeps cannot overflow.
pub fn ticks_to_micros(elapsed_ticks: u64, calibration: u32) -> i64 {
    let micros = elapsed_ticks as u128 * calibration as u128 / CALIBRATION_SCALE as u128;
    i64::try_from(micros).unwrap_or(i64::MAX)
}

/// Wall-clock value after a sleep, or `None` when drift correction is
/// disabled because the oscillator was never calibrated.
///
/// A tick counter that went backwards counts as zero elapsed ticks.
pub fn corrected_time(
    before_sleep_micros: i64,
    ticks_before_sleep: u64,
    ticks_now: u64,
    calibration: u32,
) -> Option<i64> {
    if calibration == 0 {
        return None;
    }
    let elapsed = ticks_now.saturating_sub(ticks_before_sleep);
    Some(before_sleep_micros.saturating_add(ticks_to_micros(elapsed, calibration)))
}

/// Whether the clock has ever been synchronized.
pub fn is_time_plausible(unix_secs: i64) -> bool {
    unix_secs > PLAUSIBLE_EPOCH_SECS
}

/// Broken-down local time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl LocalTime {
    pub fn from_unix(unix_secs: i64, utc_offset_secs: i32) -> Self {
        let of_day = (unix_secs + utc_offset_secs as i64).rem_euclid(86_400);
        Self {
            hour: (of_day / 3600) as u8,
            minute: (of_day / 60 % 60) as u8,
            second: (of_day % 60) as u8,
        }
    }
}

/// Sleep length that wakes the device `wakeup_lead_micros` ahead of the next
/// minute boundary.
///
/// When the boundary is closer than the lead the following minute is
/// targeted. While a particulate measurement is running the sleep is capped
/// so the result is collected on time.
pub fn hibernation_delay(now_micros: i64, wakeup_lead_micros: u32, measuring: bool) -> Duration {
    let minute = 60 * MICROS_PER_SECOND;
    let lead = wakeup_lead_micros as i64;
    let mut until_boundary = minute - now_micros.rem_euclid(minute);
    if until_boundary <= lead {
        until_boundary += minute;
    }
    let mut delay = (until_boundary - lead) as u64;
    if measuring {
        delay = delay.min(MEASURING_SLEEP_CAP_SECS * MICROS_PER_SECOND as u64);
    }
    Duration::from_micros(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedOscillator {
        readings: [u32; CALIBRATION_PASSES],
        pass: usize,
    }

    impl LowPowerOscillator for FixedOscillator {
        fn ticks(&self) -> u64 {
            0
        }

        fn measure_period(&mut self, cycles: u32) -> u32 {
            assert_eq!(cycles, CALIBRATION_CYCLES);
            let value = self.readings[self.pass];
            self.pass += 1;
            value
        }
    }

    #[test]
    fn test_calibration_keeps_last_pass() {
        let mut osc = FixedOscillator {
            readings: [1, 2, 3, 4, 16_000_000],
            pass: 0,
        };
        assert_eq!(calibrate(&mut osc), 16_000_000);
        assert_eq!(osc.pass, CALIBRATION_PASSES);
    }

    #[test]
    fn test_zero_elapsed_ticks_is_identity() {
        let before = 1_700_000_000_123_456;
        assert_eq!(corrected_time(before, 5000, 5000, 16_000_000), Some(before));
    }

    #[test]
    fn test_uncalibrated_disables_correction() {
        assert_eq!(corrected_time(1_700_000_000_000_000, 0, 1000, 0), None);
    }

    #[test]
    fn test_counter_reset_counts_as_zero() {
        let before = 1_700_000_000_000_000;
        assert_eq!(corrected_time(before, 9000, 10, 1 << 19), Some(before));
    }

    #[test]
    fn test_drift_correction_scales_ticks() {
        // 32768 Hz crystal: one tick is 30.517578125 us.
        let factor = (30.517578125 * (1u64 << 19) as f64) as u32;
        let before = 1_700_000_000_000_000;
        let woke = corrected_time(before, 0, 32_768 * 60, factor).unwrap();
        assert_eq!(woke - before, 60_000_000);
    }

    #[test]
    fn test_week_long_sleep_does_not_overflow() {
        let ticks = 150_000u64 * 86_400 * 7;
        let factor = 6.67 * (1u64 << 19) as f64;
        let micros = ticks_to_micros(ticks, factor as u32);
        assert!(micros > 6 * 86_400 * MICROS_PER_SECOND);
    }

    #[test]
    fn test_plausible_epoch() {
        assert!(!is_time_plausible(0));
        assert!(!is_time_plausible(PLAUSIBLE_EPOCH_SECS));
        assert!(is_time_plausible(PLAUSIBLE_EPOCH_SECS + 1));
    }

    #[test]
    fn test_local_time_applies_offset() {
        // 2024-01-01T23:59:30Z
        let t = LocalTime::from_unix(1_704_153_570, 3600);
        assert_eq!(
            t,
            LocalTime {
                hour: 0,
                minute: 59,
                second: 30
            }
        );
    }

    #[test]
    fn test_hibernation_delay_targets_lead_before_minute() {
        let now = 1_704_153_540 * MICROS_PER_SECOND + 10 * MICROS_PER_SECOND;
        let delay = hibernation_delay(now, 870_000, false);
        assert_eq!(delay, Duration::from_micros(50_000_000 - 870_000));
    }

    #[test]
    fn test_hibernation_delay_skips_minute_inside_lead() {
        let now = 1_704_153_540 * MICROS_PER_SECOND + 59_500_000;
        let delay = hibernation_delay(now, 870_000, false);
        assert_eq!(delay, Duration::from_micros(60_500_000 - 870_000));
    }

    #[test]
    fn test_hibernation_delay_capped_while_measuring() {
        let now = 1_704_153_540 * MICROS_PER_SECOND + 1_000_000;
        let delay = hibernation_delay(now, 870_000, true);
        assert_eq!(delay, Duration::from_secs(30));
    }
}
