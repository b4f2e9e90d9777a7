//! E-paper refresh orchestration.
//!
//! Partial refreshes are fast and quiet but leave ghosting behind, so the
//! orchestrator cycles the panel through refresh modes:
//!
//! ```text
//! FullRefreshNeeded -> PartialOk -> .. (10 partial renders) .. -> PowerDownNeeded -> PartialOk
//! ```
//!
//! A render in `PowerDownNeeded` mode is a full refresh after the panel was
//! put to sleep and re-initialized. The state is persisted so the cycle
//! continues across deep sleep.

pub mod framebuffer;
pub mod layout;
pub mod ssd1677;

pub use framebuffer::FrameBuffer;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::clock::LocalTime;
use crate::config::timing::DISPLAY_POWER_DOWN_MODULUS;
use crate::storage::{DISPLAY_STATE_TAG, PersistentStorage, StorageError};
use crate::view::ViewData;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayError {
    #[error("display bus error")]
    Bus,
    #[error("display busy timeout")]
    Busy,
    #[error("display not initialized")]
    NotReady,
}

/// How the panel applies a new frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelRefresh {
    Full,
    Partial,
}

/// E-paper panel driver.
pub trait EpdDisplay {
    /// Hardware reset and full controller setup.
    fn init(&mut self) -> impl Future<Output = Result<(), DisplayError>>;

    /// Resume a panel that kept its configuration.
    fn wake_up(&mut self) -> impl Future<Output = Result<(), DisplayError>>;

    /// Deep sleep; only `init` brings the panel back.
    fn sleep(&mut self) -> impl Future<Output = Result<(), DisplayError>>;

    fn display_frame(
        &mut self,
        frame: &mut FrameBuffer,
        refresh: PanelRefresh,
    ) -> impl Future<Output = Result<(), DisplayError>>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshMode {
    #[default]
    FullRefreshNeeded,
    PartialOk,
    PowerDownNeeded,
}

/// Persisted orchestration state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct DisplayState {
    /// What the panel currently shows.
    pub shown: ViewData,
    pub refresh_counter: u32,
    pub mode: RefreshMode,
}

impl DisplayState {
    /// Advance the refresh-mode cycle after one render.
    fn advance(&mut self) {
        self.mode = match self.mode {
            RefreshMode::FullRefreshNeeded | RefreshMode::PowerDownNeeded => RefreshMode::PartialOk,
            RefreshMode::PartialOk => {
                self.refresh_counter = self.refresh_counter.wrapping_add(1);
                if self.refresh_counter % DISPLAY_POWER_DOWN_MODULUS == 0 {
                    RefreshMode::PowerDownNeeded
                } else {
                    RefreshMode::PartialOk
                }
            }
        };
    }
}

/// Outcome of one render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderReport {
    /// Mode the render was performed in.
    pub mode: RefreshMode,
    pub refresh: PanelRefresh,
}

pub struct DisplayOrchestrator<D> {
    display: D,
    frame: FrameBuffer,
    state: DisplayState,
    ready: bool,
}

impl<D: EpdDisplay> DisplayOrchestrator<D> {
    pub fn new(display: D, frame: FrameBuffer) -> Self {
        Self {
            display,
            frame,
            state: DisplayState::default(),
            ready: false,
        }
    }

    pub fn state(&self) -> &DisplayState {
        &self.state
    }

    pub fn frame(&self) -> &FrameBuffer {
        &self.frame
    }

    pub fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }

    /// Restore the refresh cycle and bring the panel up. Only a panel left
    /// in `PartialOk` mode kept its configuration through the sleep.
    pub async fn setup<S: PersistentStorage>(
        &mut self,
        woken: bool,
        storage: &S,
    ) -> Result<(), DisplayError> {
        self.state = if woken {
            storage.get_or_default(DISPLAY_STATE_TAG)
        } else {
            DisplayState::default()
        };
        let result = if self.state.mode == RefreshMode::PartialOk {
            self.display.wake_up().await
        } else {
            info!(" Initializing display ({:?})", self.state.mode);
            self.display.init().await
        };
        self.ready = result.is_ok();
        if let Err(e) = result {
            error!(" Display setup failed: {}", e);
        }
        result
    }

    /// Draw `view` and push it to the panel.
    pub async fn update_view(
        &mut self,
        view: &ViewData,
        time: LocalTime,
    ) -> Result<RenderReport, DisplayError> {
        if !self.ready {
            return Err(DisplayError::NotReady);
        }
        let shape_changed = !self.state.shown.same_shape(view);
        if shape_changed {
            debug!(" View shape changed, forcing full refresh");
        }
        let mode = self.state.mode;
        let refresh = if shape_changed || mode != RefreshMode::PartialOk {
            PanelRefresh::Full
        } else {
            PanelRefresh::Partial
        };

        // Drawing into RAM cannot fail.
        let _ = layout::render(&mut self.frame, view, time);
        self.display.display_frame(&mut self.frame, refresh).await?;

        self.state.shown = *view;
        self.state.advance();
        debug!(
            " Rendered {:?} in {:?}, next {:?}",
            refresh, mode, self.state.mode
        );
        Ok(RenderReport { mode, refresh })
    }

    /// Put the panel to sleep when the cycle asks for a power-down.
    pub async fn hibernate(&mut self) {
        if self.ready && self.state.mode == RefreshMode::PowerDownNeeded {
            if let Err(e) = self.display.sleep().await {
                warn!(" Display sleep failed: {}", e);
            }
        }
    }

    pub fn save<S: PersistentStorage>(&self, storage: &mut S) -> Result<(), StorageError> {
        storage.set(DISPLAY_STATE_TAG, &self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RetainedStore;
    use crate::test_support::{EpdCall, TestEpd};
    use crate::view::SensorReading;
    use alloc::vec;
    use embassy_futures::block_on;

    const NOON: LocalTime = LocalTime {
        hour: 12,
        minute: 0,
        second: 0,
    };

    fn orchestrator() -> DisplayOrchestrator<TestEpd> {
        DisplayOrchestrator::new(TestEpd::default(), FrameBuffer::new(true))
    }

    #[test]
    fn test_cold_boot_full_then_partial() {
        let storage = RetainedStore::new(vec![0u8; 512], false);
        let mut view = orchestrator();
        block_on(view.setup(false, &storage)).unwrap();
        assert_eq!(view.display_mut().calls, vec![EpdCall::Init]);

        let first = block_on(view.update_view(&ViewData::default(), NOON)).unwrap();
        assert_eq!(first.mode, RefreshMode::FullRefreshNeeded);
        assert_eq!(first.refresh, PanelRefresh::Full);
        let second = block_on(view.update_view(&ViewData::default(), NOON)).unwrap();
        assert_eq!(second.mode, RefreshMode::PartialOk);
        assert_eq!(second.refresh, PanelRefresh::Partial);
    }

    #[test]
    fn test_power_down_after_ten_partials() {
        let storage = RetainedStore::new(vec![0u8; 512], false);
        let mut view = orchestrator();
        block_on(view.setup(false, &storage)).unwrap();
        block_on(view.update_view(&ViewData::default(), NOON)).unwrap();

        for _ in 0..10 {
            let report = block_on(view.update_view(&ViewData::default(), NOON)).unwrap();
            assert_eq!(report.mode, RefreshMode::PartialOk);
        }
        let eleventh = block_on(view.update_view(&ViewData::default(), NOON)).unwrap();
        assert_eq!(eleventh.mode, RefreshMode::PowerDownNeeded);
        assert_eq!(eleventh.refresh, PanelRefresh::Full);
        let next = block_on(view.update_view(&ViewData::default(), NOON)).unwrap();
        assert_eq!(next.mode, RefreshMode::PartialOk);
    }

    #[test]
    fn test_panel_sleeps_only_on_power_down() {
        let mut storage = RetainedStore::new(vec![0u8; 512], false);
        let mut view = orchestrator();
        block_on(view.setup(false, &storage)).unwrap();
        block_on(view.update_view(&ViewData::default(), NOON)).unwrap();
        block_on(view.hibernate());
        assert!(!view.display_mut().calls.contains(&EpdCall::Sleep));

        for _ in 0..10 {
            block_on(view.update_view(&ViewData::default(), NOON)).unwrap();
        }
        assert_eq!(view.state().mode, RefreshMode::PowerDownNeeded);
        block_on(view.hibernate());
        assert_eq!(view.display_mut().calls.last(), Some(&EpdCall::Sleep));
        view.save(&mut storage).unwrap();

        // The next wake re-initializes the sleeping panel.
        let mut resumed = orchestrator();
        block_on(resumed.setup(true, &storage)).unwrap();
        assert_eq!(resumed.display_mut().calls, vec![EpdCall::Init]);
    }

    #[test]
    fn test_partial_mode_wakes_without_init() {
        let mut storage = RetainedStore::new(vec![0u8; 512], false);
        let mut view = orchestrator();
        block_on(view.setup(false, &storage)).unwrap();
        block_on(view.update_view(&ViewData::default(), NOON)).unwrap();
        view.save(&mut storage).unwrap();

        let mut resumed = orchestrator();
        block_on(resumed.setup(true, &storage)).unwrap();
        assert_eq!(resumed.display_mut().calls, vec![EpdCall::WakeUp]);
        assert_eq!(resumed.state().mode, RefreshMode::PartialOk);
    }

    #[test]
    fn test_remote_appearing_forces_full_refresh() {
        let storage = RetainedStore::new(vec![0u8; 512], false);
        let mut view = orchestrator();
        block_on(view.setup(false, &storage)).unwrap();
        block_on(view.update_view(&ViewData::default(), NOON)).unwrap();

        let with_remote = ViewData {
            remote: Some(SensorReading::default()),
            ..ViewData::default()
        };
        let report = block_on(view.update_view(&with_remote, NOON)).unwrap();
        assert_eq!(report.mode, RefreshMode::PartialOk);
        assert_eq!(report.refresh, PanelRefresh::Full);
        let report = block_on(view.update_view(&with_remote, NOON)).unwrap();
        assert_eq!(report.refresh, PanelRefresh::Partial);
        let report = block_on(view.update_view(&ViewData::default(), NOON)).unwrap();
        assert_eq!(report.refresh, PanelRefresh::Full);
    }

    #[test]
    fn test_render_requires_setup() {
        let mut view = orchestrator();
        assert_eq!(
            block_on(view.update_view(&ViewData::default(), NOON)),
            Err(DisplayError::NotReady)
        );
    }
}
