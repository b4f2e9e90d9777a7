//! State records shared across the controller and its error type.

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::connectivity::LinkError;
use crate::display::DisplayError;
use crate::sensors::SensorError;
use crate::storage::StorageError;

/// Result of one controller pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Clock not synchronized, or a radio exchange is still outstanding.
    AwaitingSync,
    /// Only the minute-boundary clock refresh is outstanding.
    NeedRefreshClock,
    /// Nothing left to do this cycle.
    Completed,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParticulateStatus {
    /// Never measured since power-on.
    #[default]
    Startup,
    Sleeping,
    Measuring,
}

/// Controller bookkeeping kept across deep sleep. Timestamps are Unix
/// seconds; zero means never.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerData {
    pub particulate: ParticulateStatus,
    pub last_meteo_time: i64,
    pub last_pm_time: i64,
    pub last_remote_time: i64,
    pub last_sync_time: i64,
    pub last_sync_attempt_time: i64,
}

/// Wake counter, oscillator calibration and the pre-sleep clock snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WakeCycleState {
    pub wakeup_counter: u32,
    /// Q13.19 microseconds per oscillator tick; zero when uncalibrated.
    pub calibration: u32,
    pub wall_clock_before_sleep_micros: i64,
    pub ticks_before_sleep: u64,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("sensor error: {0}")]
    Sensor(#[from] SensorError),
    #[error("radio error: {0}")]
    Link(#[from] LinkError),
    #[error("display error: {0}")]
    Display(#[from] DisplayError),
}
