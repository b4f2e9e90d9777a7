//! Deep sleep and the RTC fast memory that survives it.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration as CoreDuration;

use dustmon_core::app_state::ProcessStatus;
use dustmon_core::controller::runner::{Scheduler, wait_for_progress};
use dustmon_core::events::RadioEvents;
use dustmon_core::storage::RetainedStore;
use embassy_time::{Duration, Timer};
use esp_hal::rtc_cntl::sleep::TimerWakeupSource;
use esp_hal::rtc_cntl::{Rtc, wakeup_cause};
use esp_hal::system::SleepSource;
use log::info;

pub const RETAINED_LEN: usize = 2048;
/// Time for the radio task to drain queued stop commands.
const RADIO_DRAIN: Duration = Duration::from_millis(20);

#[esp_hal::ram(unstable(rtc_fast, persistent))]
static mut RETAINED: [u8; RETAINED_LEN] = [0; RETAINED_LEN];

static RETAINED_TAKEN: AtomicBool = AtomicBool::new(false);

pub type RetainedRegion = &'static mut [u8; RETAINED_LEN];

/// Whether this boot is a timer wake from deep sleep, as opposed to a
/// power-on or any kind of reset.
pub fn woken_from_deep_sleep() -> bool {
    matches!(wakeup_cause(), SleepSource::Timer)
}

/// Open the record store over RTC fast memory. Returns `None` when it was
/// opened before.
pub fn retained_store(woken: bool) -> Option<RetainedStore<RetainedRegion>> {
    if RETAINED_TAKEN.swap(true, Ordering::AcqRel) {
        return None;
    }
    // SAFETY: guarded above, this is the only reference ever handed out.
    let region = unsafe { &mut *(&raw mut RETAINED) };
    Some(RetainedStore::new(region, woken))
}

/// Ends every cycle in deep sleep; the next wake reboots into `main`.
pub struct DeepSleep {
    rtc: Rtc<'static>,
    events: &'static RadioEvents,
}

impl DeepSleep {
    pub fn new(rtc: Rtc<'static>, events: &'static RadioEvents) -> Self {
        Self { rtc, events }
    }
}

impl Scheduler for DeepSleep {
    async fn pause(&mut self, status: ProcessStatus) {
        wait_for_progress(self.events, status).await;
    }

    async fn rest(&mut self, delay: Duration) {
        Timer::after(RADIO_DRAIN).await;
        info!(" Entering deep sleep");
        let timer = TimerWakeupSource::new(CoreDuration::from_micros(delay.as_micros()));
        self.rtc.sleep_deep(&[&timer]);
    }
}
