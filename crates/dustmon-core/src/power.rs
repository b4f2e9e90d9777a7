//! Sensor power rail and battery measurement.

/// Switchable step-up converter feeding the sensors.
///
/// `hold` latches the current level so it survives deep sleep.
pub trait PowerRail {
    fn enable(&mut self);

    fn disable(&mut self);

    fn hold(&mut self, latched: bool);
}

/// Raw ADC access to the battery divider.
pub trait BatteryMonitor {
    /// 12-bit conversion result, or `None` when the ADC failed.
    fn read_raw(&mut self) -> Option<u16>;
}

const ADC_FULL_SCALE: f32 = 4095.0;
const ADC_REFERENCE_VOLTS: f32 = 3.3;
/// The battery reaches the ADC through a 1:2 divider.
const DIVIDER_RATIO: f32 = 0.5;

/// Battery voltage for a raw conversion.
pub fn battery_volts(raw: u16, correction: f32) -> f32 {
    raw as f32 * ADC_REFERENCE_VOLTS / DIVIDER_RATIO / ADC_FULL_SCALE * correction
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_conversion() {
        assert_eq!(battery_volts(0, 1.0), 0.0);
        assert!((battery_volts(4095, 1.0) - 6.6).abs() < 1e-4);
        assert!((battery_volts(2482, 1.02) - 4.08).abs() < 0.01);
    }
}
