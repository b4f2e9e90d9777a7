//! Station-mode connection state machine.
//!
//! Commands go to a [`StationDriver`] and return immediately; the driver
//! reports completion through [`RadioEvents`]. [`ConnectivityManager::poll`]
//! applies queued events to the state.

use log::{debug, info, warn};
use thiserror_no_std::Error;

use crate::config::timing::MAX_STATION_RETRIES;
use crate::events::{RadioEvents, StationEvent};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("radio not initialized")]
    NotInitialized,
    #[error("radio command queue full")]
    Busy,
    #[error("radio rejected {0}")]
    Rejected(&'static str),
}

/// Non-blocking station-mode commands.
pub trait StationDriver {
    fn init(&mut self) -> Result<(), LinkError>;

    fn deinit(&mut self);

    /// Configure credentials and bring station mode up. Completes with
    /// [`StationEvent::Started`].
    fn start(&mut self, ssid: &str, password: &str) -> Result<(), LinkError>;

    /// Completes with [`StationEvent::GotIp`] or [`StationEvent::Disconnected`].
    fn connect(&mut self) -> Result<(), LinkError>;

    fn disconnect(&mut self) -> Result<(), LinkError>;

    /// Completes with [`StationEvent::Stopped`].
    fn stop(&mut self) -> Result<(), LinkError>;

    /// Query network time. Completes with [`StationEvent::TimeReceived`] or
    /// [`StationEvent::TimeFailed`].
    fn request_time(&mut self, server: &str) -> Result<(), LinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotInitialized,
    Stopped,
    Started,
    Connecting,
    Connected,
    Disconnected,
}

pub struct ConnectivityManager<'a, D> {
    driver: D,
    events: &'a RadioEvents,
    state: ConnectionState,
    retries: u8,
    wants_connection: bool,
    gave_up: bool,
    time: Option<Option<i64>>,
}

impl<'a, D: StationDriver> ConnectivityManager<'a, D> {
    pub fn new(driver: D, events: &'a RadioEvents) -> Self {
        Self {
            driver,
            events,
            state: ConnectionState::NotInitialized,
            retries: 0,
            wants_connection: false,
            gave_up: false,
            time: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// The last connection attempt ran out of retries.
    pub fn has_failed(&self) -> bool {
        self.gave_up
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn init(&mut self) -> Result<(), LinkError> {
        if self.state == ConnectionState::NotInitialized {
            self.driver.init()?;
            self.state = ConnectionState::Stopped;
        }
        Ok(())
    }

    pub fn deinit(&mut self) {
        if self.state != ConnectionState::NotInitialized {
            self.driver.deinit();
            self.state = ConnectionState::NotInitialized;
        }
        self.wants_connection = false;
    }

    /// Start connecting to the access point.
    pub fn connect(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        self.retries = 0;
        self.gave_up = false;
        self.time = None;
        match self.state {
            ConnectionState::NotInitialized => return Err(LinkError::NotInitialized),
            ConnectionState::Stopped => {
                info!(" Starting station mode for '{}'", ssid);
                self.driver.start(ssid, password)?;
            }
            ConnectionState::Started | ConnectionState::Disconnected => {
                self.driver.connect()?;
                self.state = ConnectionState::Connecting;
            }
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }
        self.wants_connection = true;
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<(), LinkError> {
        self.wants_connection = false;
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            self.driver.disconnect()?;
        }
        Ok(())
    }

    /// Power the station radio down.
    pub fn stop(&mut self) -> Result<(), LinkError> {
        self.wants_connection = false;
        if !matches!(
            self.state,
            ConnectionState::NotInitialized | ConnectionState::Stopped
        ) {
            self.driver.stop()?;
        }
        Ok(())
    }

    pub fn request_time(&mut self, server: &str) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Rejected("time request without connection"));
        }
        self.time = None;
        self.driver.request_time(server)
    }

    /// Result of the last time request: `Some(Some(t))` on success,
    /// `Some(None)` on failure, `None` while outstanding.
    pub fn take_time(&mut self) -> Option<Option<i64>> {
        self.time.take()
    }

    /// Apply every queued station event.
    pub fn poll(&mut self) {
        while let Some(event) = self.events.next_station() {
            self.apply(event);
        }
    }

    fn apply(&mut self, event: StationEvent) {
        debug!(" Station event {:?} in {:?}", event, self.state);
        match event {
            StationEvent::Started => {
                self.state = ConnectionState::Started;
                if self.wants_connection {
                    self.try_connect();
                }
            }
            StationEvent::Connected => {}
            StationEvent::GotIp => {
                info!(" Station connected");
                self.retries = 0;
                self.state = ConnectionState::Connected;
            }
            StationEvent::Disconnected => {
                if self.wants_connection && self.retries < MAX_STATION_RETRIES {
                    self.retries += 1;
                    debug!(" Reconnecting, attempt {}", self.retries);
                    self.try_connect();
                } else {
                    if self.wants_connection {
                        warn!(" Giving up after {} reconnect attempts", self.retries);
                        self.gave_up = true;
                    }
                    self.wants_connection = false;
                    self.state = ConnectionState::Disconnected;
                }
            }
            StationEvent::Stopped => {
                self.state = ConnectionState::Stopped;
                self.wants_connection = false;
            }
            StationEvent::TimeReceived { unix_micros } => self.time = Some(Some(unix_micros)),
            StationEvent::TimeFailed => self.time = Some(None),
        }
    }

    fn try_connect(&mut self) {
        match self.driver.connect() {
            Ok(()) => self.state = ConnectionState::Connecting,
            Err(e) => {
                warn!(" Connect command failed: {}", e);
                self.gave_up = true;
                self.wants_connection = false;
                self.state = ConnectionState::Disconnected;
            }
        }
    }
}
