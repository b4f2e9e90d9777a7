//! Drives wake cycles with a pluggable way of waiting and sleeping.

use embassy_time::{Duration, Timer};
use log::{debug, error, info, warn};

use super::{Controller, Platform};
use crate::app_state::ProcessStatus;
use crate::events::{PEER_EVENT_BIT, RadioEvents, STATION_EVENT_BIT};

/// Upper bound of one wait while a radio exchange is outstanding.
pub const SYNC_POLL: Duration = Duration::from_secs(1);
/// Poll period while waiting for the minute boundary.
pub const CLOCK_POLL: Duration = Duration::from_millis(100);

pub trait Scheduler {
    /// Wait before the next pass of an unfinished cycle.
    fn pause(&mut self, status: ProcessStatus) -> impl Future<Output = ()>;

    /// Sleep once the state is saved. Returns only when RAM survived the
    /// sleep; a deep sleep restarts the program instead.
    fn rest(&mut self, delay: Duration) -> impl Future<Output = ()>;
}

/// Wait matching `status`: radio events end an `AwaitingSync` wait early.
pub async fn wait_for_progress(events: &RadioEvents, status: ProcessStatus) {
    match status {
        ProcessStatus::AwaitingSync => {
            events
                .signals
                .wait_any(STATION_EVENT_BIT | PEER_EVENT_BIT, SYNC_POLL)
                .await;
        }
        ProcessStatus::NeedRefreshClock | ProcessStatus::Completed => {
            Timer::after(CLOCK_POLL).await
        }
    }
}

/// Run passes until the cycle may end, then hibernate. Returns the sleep
/// length.
pub async fn run_cycle<P: Platform, S: Scheduler>(
    controller: &mut Controller<'_, P>,
    scheduler: &mut S,
) -> Duration {
    let mut passes: u32 = 0;
    loop {
        let status = controller.process().await;
        passes += 1;
        if status == ProcessStatus::Completed && controller.can_hibernate() {
            break;
        }
        scheduler.pause(status).await;
    }
    debug!(" Cycle finished after {} passes", passes);

    if let Err(e) = controller.hibernate().await {
        error!(" {}", e);
    }
    controller.next_wake_delay()
}

pub async fn run<P: Platform, S: Scheduler>(
    controller: &mut Controller<'_, P>,
    scheduler: &mut S,
) -> ! {
    loop {
        let delay = run_cycle(controller, scheduler).await;
        info!(" Sleeping {} ms", delay.as_millis());
        scheduler.rest(delay).await;
        if let Err(e) = controller.resume().await {
            warn!(" {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{MICROS_PER_SECOND, WallClock};
    use crate::config::{Config, PeerConfig};
    use crate::test_support::{TestClock, TestOscillator, TestRail, test_board};
    use alloc::vec;
    use alloc::vec::Vec;
    use embassy_futures::block_on;

    /// Advances the shared test clock instead of waiting.
    struct SteppingScheduler {
        clock: TestClock,
        pauses: Vec<ProcessStatus>,
    }

    impl Scheduler for SteppingScheduler {
        async fn pause(&mut self, status: ProcessStatus) {
            self.pauses.push(status);
            let step = match status {
                ProcessStatus::AwaitingSync => SYNC_POLL,
                _ => CLOCK_POLL,
            };
            self.clock.advance_micros(step.as_micros() as i64);
        }

        async fn rest(&mut self, delay: Duration) {
            self.clock.advance_micros(delay.as_micros() as i64);
        }
    }

    fn config() -> Config<'static> {
        Config {
            peer: PeerConfig {
                listen_window_secs: 0,
                discovery_window_secs: 0,
                ..PeerConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_cycle_waits_for_minute_boundary() {
        let events = RadioEvents::new();
        // 2023-11-14 22:14:59 UTC
        let clock = TestClock::new(1_700_000_099 * MICROS_PER_SECOND);
        let oscillator = TestOscillator::default();
        let rail = TestRail::default();
        let board = test_board(vec![0u8; 2048], false, &clock, &oscillator, &rail);
        let mut controller = Controller::new(board, config(), &events);
        block_on(controller.setup(true)).unwrap();

        let mut scheduler = SteppingScheduler {
            clock: clock.clone(),
            pauses: Vec::new(),
        };
        let delay = block_on(run_cycle(&mut controller, &mut scheduler));

        assert_eq!(scheduler.pauses.len(), 10);
        assert!(
            scheduler
                .pauses
                .iter()
                .all(|s| *s == ProcessStatus::NeedRefreshClock)
        );
        assert_eq!(clock.now_secs() % 60, 0);
        // The particulate measurement started this cycle caps the sleep.
        assert!(controller.is_measuring());
        assert_eq!(delay, Duration::from_secs(30));
    }

    #[test]
    fn test_cycle_without_measurement_sleeps_to_lead_time() {
        let events = RadioEvents::new();
        let clock = TestClock::new(1_700_000_099 * MICROS_PER_SECOND);
        let oscillator = TestOscillator::default();
        let rail = TestRail::default();
        let board = test_board(vec![0u8; 2048], false, &clock, &oscillator, &rail);
        let mut controller = Controller::new(board, config(), &events);
        controller.particulate.sensor_mut().absent = true;
        block_on(controller.setup(true)).unwrap();

        let mut scheduler = SteppingScheduler {
            clock: clock.clone(),
            pauses: Vec::new(),
        };
        let delay = block_on(run_cycle(&mut controller, &mut scheduler));
        assert!(!controller.is_measuring());
        assert_eq!(delay, Duration::from_micros(60_000_000 - 870_000));
    }
}
