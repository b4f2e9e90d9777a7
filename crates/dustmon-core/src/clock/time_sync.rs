//! Network time synchronization over the station link.
//!
//! A sync attempt connects to the access point, asks the SNTP server for
//! the time, sets the wall clock and brings the link back down. Attempts
//! are driven one step per controller pass by [`TimeSync::process`].

use log::{debug, info, warn};

use super::{LocalTime, MICROS_PER_SECOND, WallClock, is_time_plausible};
use crate::app_state::ControllerData;
use crate::config::timing::{RESYNC_RETRY_SECS, SYNC_RETRY_SECS};
use crate::config::{InternetConfig, TimeConfig};
use crate::connectivity::{ConnectivityManager, LinkError, StationDriver};
use crate::events::RadioEvents;

/// An attempt that has not finished after this long is abandoned.
pub const SYNC_ATTEMPT_TIMEOUT_SECS: i64 = 45;
/// Local hour in which periodic resyncs run.
const RESYNC_HOUR: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    AwaitingTime,
}

pub struct TimeSync<'a, D> {
    link: ConnectivityManager<'a, D>,
    internet: InternetConfig<'a>,
    time: TimeConfig<'a>,
    phase: Phase,
    started_at: i64,
}

impl<'a, D: StationDriver> TimeSync<'a, D> {
    pub fn new(
        driver: D,
        events: &'a RadioEvents,
        internet: InternetConfig<'a>,
        time: TimeConfig<'a>,
    ) -> Self {
        Self {
            link: ConnectivityManager::new(driver, events),
            internet,
            time,
            phase: Phase::Idle,
            started_at: 0,
        }
    }

    /// Bring the station driver up. A cold boot or a clock that was never
    /// set starts an attempt right away.
    pub fn setup(
        &mut self,
        woken: bool,
        now: i64,
        data: &mut ControllerData,
    ) -> Result<(), LinkError> {
        self.phase = Phase::Idle;
        self.link.init().map_err(|e| {
            warn!(" Station init failed: {}", e);
            e
        })?;
        if !woken || !is_time_plausible(now) {
            self.restart(now, data);
        }
        Ok(())
    }

    /// Start a new attempt, abandoning any attempt in progress.
    pub fn restart(&mut self, now: i64, data: &mut ControllerData) {
        data.last_sync_attempt_time = now;
        match self.link.connect(self.internet.ssid, self.internet.password) {
            Ok(()) => {
                info!(" Time sync started");
                self.phase = Phase::Connecting;
                self.started_at = now;
            }
            Err(e) => {
                warn!(" Time sync could not start: {}", e);
                self.phase = Phase::Idle;
            }
        }
    }

    pub fn in_progress(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Advance the attempt in progress, or schedule a retry while the clock
    /// is still unset.
    pub fn process<C: WallClock>(&mut self, clock: &C, data: &mut ControllerData) {
        self.link.poll();
        let now = clock.now_secs();
        let timed_out = now - self.started_at > SYNC_ATTEMPT_TIMEOUT_SECS;
        match self.phase {
            Phase::Idle => {
                if !is_time_plausible(now) && now - data.last_sync_attempt_time >= SYNC_RETRY_SECS
                {
                    debug!(" Retrying time sync");
                    self.restart(now, data);
                }
            }
            Phase::Connecting => {
                if self.link.is_connected() {
                    match self.link.request_time(self.time.ntp_server) {
                        Ok(()) => self.phase = Phase::AwaitingTime,
                        Err(e) => self.fail(e),
                    }
                } else if self.link.has_failed() {
                    self.fail("access point unreachable");
                } else if timed_out {
                    self.fail("connect timeout");
                }
            }
            Phase::AwaitingTime => match self.link.take_time() {
                Some(Some(unix_micros)) => {
                    clock.set_micros(unix_micros);
                    data.last_sync_time = unix_micros.div_euclid(MICROS_PER_SECOND);
                    info!(" Clock set to {} s", data.last_sync_time);
                    self.finish();
                }
                Some(None) => self.fail("no reply from time server"),
                None if !self.link.is_connected() => self.fail("connection lost"),
                None if timed_out => self.fail("time server timeout"),
                None => {}
            },
        }
    }

    /// Whether a periodic resync should start now.
    pub fn is_due(
        &self,
        now: i64,
        local: LocalTime,
        data: &ControllerData,
        measuring: bool,
    ) -> bool {
        !self.in_progress()
            && !measuring
            && local.hour == RESYNC_HOUR
            && now - data.last_sync_time >= self.time.resync_interval_secs as i64
            && now - data.last_sync_attempt_time >= RESYNC_RETRY_SECS
    }

    /// Power the station radio down so the peer link can take it over.
    pub fn release_radio(&mut self) {
        if let Err(e) = self.link.stop() {
            warn!(" Station stop failed: {}", e);
        }
    }

    pub fn shutdown(&mut self) {
        self.phase = Phase::Idle;
        self.release_radio();
        self.link.deinit();
    }

    fn finish(&mut self) {
        self.phase = Phase::Idle;
        if let Err(e) = self.link.disconnect() {
            warn!(" Station disconnect failed: {}", e);
        }
        self.release_radio();
    }

    fn fail(&mut self, reason: impl core::fmt::Display) {
        warn!(" Time sync failed: {}", reason);
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StationEvent;
    use crate::test_support::{StationCall, TestClock, TestStation};
    use alloc::vec;

    const SYNCED: i64 = 1_700_000_000;

    fn sync(events: &RadioEvents) -> TimeSync<'_, TestStation> {
        TimeSync::new(
            TestStation::default(),
            events,
            InternetConfig {
                ssid: "ap",
                password: "secret",
            },
            TimeConfig::default(),
        )
    }

    fn connect(events: &RadioEvents, ts: &mut TimeSync<'_, TestStation>, clock: &TestClock) {
        let mut data = ControllerData::default();
        events.post_station(StationEvent::Started);
        events.post_station(StationEvent::GotIp);
        ts.process(clock, &mut data);
    }

    #[test]
    fn test_cold_boot_syncs_clock() {
        let events = RadioEvents::new();
        let clock = TestClock::new(5 * MICROS_PER_SECOND);
        let mut data = ControllerData::default();
        let mut ts = sync(&events);
        ts.setup(false, clock.now_secs(), &mut data).unwrap();
        assert!(ts.in_progress());
        assert_eq!(data.last_sync_attempt_time, 5);

        connect(&events, &mut ts, &clock);
        assert_eq!(
            ts.link.driver_mut().calls,
            vec![
                StationCall::Init,
                StationCall::Start,
                StationCall::Connect,
                StationCall::RequestTime
            ]
        );

        events.post_station(StationEvent::TimeReceived {
            unix_micros: SYNCED * MICROS_PER_SECOND + 250_000,
        });
        ts.process(&clock, &mut data);
        assert!(!ts.in_progress());
        assert_eq!(clock.now_secs(), SYNCED);
        assert_eq!(data.last_sync_time, SYNCED);
        let calls = &ts.link.driver_mut().calls;
        assert!(calls.ends_with(&[StationCall::Disconnect, StationCall::Stop]));
    }

    #[test]
    fn test_warm_wake_with_valid_clock_stays_idle() {
        let events = RadioEvents::new();
        let mut data = ControllerData::default();
        let mut ts = sync(&events);
        ts.setup(true, SYNCED, &mut data).unwrap();
        assert!(!ts.in_progress());
        assert_eq!(data.last_sync_attempt_time, 0);
    }

    #[test]
    fn test_warm_wake_with_unset_clock_restarts() {
        let events = RadioEvents::new();
        let mut data = ControllerData::default();
        let mut ts = sync(&events);
        ts.setup(true, 100, &mut data).unwrap();
        assert!(ts.in_progress());
    }

    #[test]
    fn test_failed_time_request_retries_after_a_minute() {
        let events = RadioEvents::new();
        let clock = TestClock::new(10 * MICROS_PER_SECOND);
        let mut data = ControllerData::default();
        let mut ts = sync(&events);
        ts.setup(false, clock.now_secs(), &mut data).unwrap();
        connect(&events, &mut ts, &clock);

        events.post_station(StationEvent::TimeFailed);
        ts.process(&clock, &mut data);
        assert!(!ts.in_progress());

        clock.advance_secs(SYNC_RETRY_SECS - 1);
        ts.process(&clock, &mut data);
        assert!(!ts.in_progress());

        clock.advance_secs(1);
        ts.process(&clock, &mut data);
        assert!(ts.in_progress());
        assert_eq!(data.last_sync_attempt_time, 10 + SYNC_RETRY_SECS);
    }

    #[test]
    fn test_unreachable_access_point_gives_up() {
        let events = RadioEvents::new();
        let clock = TestClock::new(0);
        let mut data = ControllerData::default();
        let mut ts = sync(&events);
        ts.setup(false, 0, &mut data).unwrap();
        events.post_station(StationEvent::Started);
        for _ in 0..=crate::config::timing::MAX_STATION_RETRIES {
            events.post_station(StationEvent::Disconnected);
        }
        ts.process(&clock, &mut data);
        assert!(!ts.in_progress());
    }

    #[test]
    fn test_stalled_connect_times_out() {
        let events = RadioEvents::new();
        let clock = TestClock::new(0);
        let mut data = ControllerData::default();
        let mut ts = sync(&events);
        ts.setup(false, 0, &mut data).unwrap();
        clock.advance_secs(SYNC_ATTEMPT_TIMEOUT_SECS + 1);
        ts.process(&clock, &mut data);
        assert!(!ts.in_progress());
    }

    #[test]
    fn test_resync_window() {
        let events = RadioEvents::new();
        let ts = sync(&events);
        let interval = TimeConfig::default().resync_interval_secs as i64;
        let data = ControllerData {
            last_sync_time: SYNCED,
            last_sync_attempt_time: SYNCED,
            ..Default::default()
        };
        let midnight = LocalTime {
            hour: 0,
            minute: 5,
            second: 0,
        };
        let noon = LocalTime { hour: 12, ..midnight };
        let later = SYNCED + interval;

        assert!(ts.is_due(later, midnight, &data, false));
        assert!(!ts.is_due(later, noon, &data, false));
        assert!(!ts.is_due(later, midnight, &data, true));
        assert!(!ts.is_due(later - 1, midnight, &data, false));

        let retried = ControllerData {
            last_sync_attempt_time: later - 60,
            ..data
        };
        assert!(!ts.is_due(later, midnight, &retried, false));
    }
}
