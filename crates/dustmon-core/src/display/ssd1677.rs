//! SSD1677 controller driving a 3.7" 280x480 black/white e-paper panel.
//!
//! Uses the waveforms stored in the controller OTP: display update sequence
//! 0xF7 for a full refresh and 0xFF for a partial one. After a partial
//! refresh the new image is mirrored into the "previous" RAM so the next
//! partial refresh only drives pixels that changed.

use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::digital::Wait;
use embedded_hal_async::spi::SpiDevice;
use embassy_time::{Duration, with_timeout};
use log::{debug, error};

use super::framebuffer::{FrameBuffer, PANEL_HEIGHT_PX, PANEL_WIDTH_PX, ROW_BYTES};
use super::{DisplayError, EpdDisplay, PanelRefresh};

const CMD_DRIVER_OUTPUT: u8 = 0x01;
const CMD_DEEP_SLEEP: u8 = 0x10;
const CMD_DATA_ENTRY_MODE: u8 = 0x11;
const CMD_SW_RESET: u8 = 0x12;
const CMD_TEMPERATURE_SENSOR: u8 = 0x18;
const CMD_MASTER_ACTIVATION: u8 = 0x20;
const CMD_UPDATE_CONTROL_2: u8 = 0x22;
const CMD_WRITE_RAM_BW: u8 = 0x24;
const CMD_WRITE_RAM_PREVIOUS: u8 = 0x26;
const CMD_BORDER: u8 = 0x3C;
const CMD_RAM_X_RANGE: u8 = 0x44;
const CMD_RAM_Y_RANGE: u8 = 0x45;
const CMD_RAM_X_COUNTER: u8 = 0x4E;
const CMD_RAM_Y_COUNTER: u8 = 0x4F;

const SEQUENCE_FULL: u8 = 0xF7;
const SEQUENCE_PARTIAL: u8 = 0xFF;
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Panel on an SPI device with data/command, reset and busy lines.
pub struct Ssd1677<SPI, DC, RST, BUSY, DELAY> {
    spi: SPI,
    dc: DC,
    rst: RST,
    busy: BUSY,
    delay: DELAY,
}

impl<SPI, DC, RST, BUSY, DELAY> Ssd1677<SPI, DC, RST, BUSY, DELAY>
where
    SPI: SpiDevice,
    DC: OutputPin,
    RST: OutputPin,
    BUSY: Wait,
    DELAY: DelayNs,
{
    pub fn new(spi: SPI, dc: DC, rst: RST, busy: BUSY, delay: DELAY) -> Self {
        Self {
            spi,
            dc,
            rst,
            busy,
            delay,
        }
    }

    async fn command(&mut self, command: u8, data: &[u8]) -> Result<(), DisplayError> {
        self.dc.set_low().map_err(|_| DisplayError::Bus)?;
        self.spi.write(&[command]).await.map_err(|_| DisplayError::Bus)?;
        if !data.is_empty() {
            self.dc.set_high().map_err(|_| DisplayError::Bus)?;
            self.spi.write(data).await.map_err(|_| DisplayError::Bus)?;
        }
        Ok(())
    }

    async fn wait_idle(&mut self) -> Result<(), DisplayError> {
        match with_timeout(BUSY_TIMEOUT, self.busy.wait_for_low()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DisplayError::Bus),
            Err(_) => {
                error!(" SSD1677 stayed busy");
                Err(DisplayError::Busy)
            }
        }
    }

    async fn hardware_reset(&mut self) -> Result<(), DisplayError> {
        self.rst.set_low().map_err(|_| DisplayError::Bus)?;
        self.delay.delay_ms(10).await;
        self.rst.set_high().map_err(|_| DisplayError::Bus)?;
        self.delay.delay_ms(10).await;
        Ok(())
    }

    async fn configure(&mut self) -> Result<(), DisplayError> {
        self.command(CMD_SW_RESET, &[]).await?;
        self.wait_idle().await?;
        let gates = (PANEL_HEIGHT_PX - 1) as u16;
        self.command(CMD_DRIVER_OUTPUT, &[gates as u8, (gates >> 8) as u8, 0x00])
            .await?;
        // X increment, Y increment.
        self.command(CMD_DATA_ENTRY_MODE, &[0x03]).await?;
        let x_end = (PANEL_WIDTH_PX - 1) as u16;
        self.command(CMD_RAM_X_RANGE, &[0, 0, x_end as u8, (x_end >> 8) as u8])
            .await?;
        self.command(CMD_RAM_Y_RANGE, &[0, 0, gates as u8, (gates >> 8) as u8])
            .await?;
        self.command(CMD_BORDER, &[0x01]).await?;
        self.command(CMD_TEMPERATURE_SENSOR, &[0x80]).await
    }

    async fn write_rows(&mut self, ram: u8, frame: &FrameBuffer, first: usize, last: usize) -> Result<(), DisplayError> {
        self.command(CMD_RAM_X_COUNTER, &[0, 0]).await?;
        self.command(CMD_RAM_Y_COUNTER, &[first as u8, (first >> 8) as u8])
            .await?;
        let bytes = &frame.as_bytes()[first * ROW_BYTES..(last + 1) * ROW_BYTES];
        self.command(ram, bytes).await
    }

    async fn update(&mut self, sequence: u8) -> Result<(), DisplayError> {
        self.command(CMD_UPDATE_CONTROL_2, &[sequence]).await?;
        self.command(CMD_MASTER_ACTIVATION, &[]).await?;
        self.wait_idle().await
    }
}

impl<SPI, DC, RST, BUSY, DELAY> EpdDisplay for Ssd1677<SPI, DC, RST, BUSY, DELAY>
where
    SPI: SpiDevice,
    DC: OutputPin,
    RST: OutputPin,
    BUSY: Wait,
    DELAY: DelayNs,
{
    async fn init(&mut self) -> Result<(), DisplayError> {
        self.hardware_reset().await?;
        self.configure().await
    }

    async fn wake_up(&mut self) -> Result<(), DisplayError> {
        // The controller kept its RAM; only make sure it is responsive.
        self.wait_idle().await
    }

    async fn sleep(&mut self) -> Result<(), DisplayError> {
        self.command(CMD_DEEP_SLEEP, &[0x01]).await
    }

    async fn display_frame(
        &mut self,
        frame: &mut FrameBuffer,
        refresh: PanelRefresh,
    ) -> Result<(), DisplayError> {
        let last_row = PANEL_HEIGHT_PX - 1;
        match refresh {
            PanelRefresh::Full => {
                self.write_rows(CMD_WRITE_RAM_BW, frame, 0, last_row).await?;
                self.write_rows(CMD_WRITE_RAM_PREVIOUS, frame, 0, last_row).await?;
                self.update(SEQUENCE_FULL).await?;
            }
            PanelRefresh::Partial => {
                let Some(rows) = frame.dirty_rows() else {
                    debug!(" Frame unchanged, skipping partial refresh");
                    return Ok(());
                };
                self.write_rows(CMD_WRITE_RAM_BW, frame, rows.first, rows.last).await?;
                self.update(SEQUENCE_PARTIAL).await?;
                self.write_rows(CMD_WRITE_RAM_PREVIOUS, frame, rows.first, rows.last).await?;
            }
        }
        frame.mark_clean();
        Ok(())
    }
}
