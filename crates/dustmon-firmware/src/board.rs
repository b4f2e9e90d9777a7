//! Power rail and battery adapters.

use dustmon_core::power::{BatteryMonitor, PowerRail};
use esp_hal::Blocking;
use esp_hal::analog::adc::{Adc, AdcChannel, AdcPin};
use esp_hal::gpio::{Output, RtcPin};
use esp_hal::peripherals::ADC1;
use log::debug;

const BATTERY_SAMPLES: u32 = 4;

/// Enable line of the sensor step-up converter.
///
/// `pad` is the same GPIO as `output`, kept to drive the RTC pad hold so
/// the level survives deep sleep.
pub struct StepUpRail<'d, P> {
    output: Output<'d>,
    pad: P,
    held: bool,
}

impl<'d, P: RtcPin> StepUpRail<'d, P> {
    pub fn new(output: Output<'d>, pad: P) -> Self {
        Self {
            output,
            pad,
            held: false,
        }
    }
}

impl<P: RtcPin> PowerRail for StepUpRail<'_, P> {
    fn enable(&mut self) {
        if self.held {
            // A held pad ignores writes until released.
            self.pad.rtcio_pad_hold(false);
        }
        self.output.set_high();
        if self.held {
            self.pad.rtcio_pad_hold(true);
        }
    }

    fn disable(&mut self) {
        self.pad.rtcio_pad_hold(false);
        self.held = false;
        self.output.set_low();
    }

    fn hold(&mut self, latched: bool) {
        debug!(" Step-up hold {}", latched);
        self.pad.rtcio_pad_hold(latched);
        self.held = latched;
    }
}

/// Battery divider on an ADC1 channel.
pub struct AdcBattery<'d, P> {
    adc: Adc<'d, ADC1<'d>, Blocking>,
    pin: AdcPin<P, ADC1<'d>>,
}

impl<'d, P: AdcChannel> AdcBattery<'d, P> {
    pub fn new(adc: Adc<'d, ADC1<'d>, Blocking>, pin: AdcPin<P, ADC1<'d>>) -> Self {
        Self { adc, pin }
    }
}

impl<P: AdcChannel> BatteryMonitor for AdcBattery<'_, P> {
    fn read_raw(&mut self) -> Option<u16> {
        let sum: u32 = (0..BATTERY_SAMPLES)
            .map(|_| self.adc.read_blocking(&mut self.pin) as u32)
            .sum();
        u16::try_from(sum / BATTERY_SAMPLES).ok()
    }
}
