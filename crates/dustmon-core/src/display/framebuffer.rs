//! 1-bit framebuffer for the e-paper panel with changed-row tracking.
//!
//! All drawing targets this RAM buffer. The panel driver copies the rows
//! that changed since the last transfer into display RAM, then clears the
//! dirty state.

use alloc::vec;
use alloc::vec::Vec;
use core::convert::Infallible;
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::Rectangle;

/// Panel width in its native orientation.
pub const PANEL_WIDTH_PX: usize = 280;
/// Panel height in its native orientation.
pub const PANEL_HEIGHT_PX: usize = 480;
pub const ROW_BYTES: usize = PANEL_WIDTH_PX / 8;
const BUFFER_LEN: usize = ROW_BYTES * PANEL_HEIGHT_PX;

/// Range of rows changed since the last transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRows {
    pub first: usize,
    pub last: usize,
}

impl DirtyRows {
    fn expand(&mut self, y: usize) {
        self.first = self.first.min(y);
        self.last = self.last.max(y);
    }
}

/// Framebuffer implementing `DrawTarget<Color = BinaryColor>`.
///
/// Bits are stored row-major, MSB first, in the panel's RAM format where a
/// set bit is white. `BinaryColor::On` is ink. With `rotated` the logical
/// image is turned 180° for a panel mounted upside down.
pub struct FrameBuffer {
    bits: Vec<u8>,
    rotated: bool,
    dirty: Option<DirtyRows>,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FrameBuffer {
    /// Allocate a white framebuffer. Every row starts dirty since the panel
    /// content is unknown.
    pub fn new(rotated: bool) -> Self {
        Self {
            bits: vec![0xFF; BUFFER_LEN],
            rotated,
            dirty: Some(DirtyRows {
                first: 0,
                last: PANEL_HEIGHT_PX - 1,
            }),
        }
    }

    /// Raw panel RAM image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Bytes of one physical row.
    pub fn row(&self, y: usize) -> &[u8] {
        &self.bits[y * ROW_BYTES..(y + 1) * ROW_BYTES]
    }

    pub fn dirty_rows(&self) -> Option<DirtyRows> {
        self.dirty
    }

    /// Forget the changed rows once they reached the panel.
    pub fn mark_clean(&mut self) {
        self.dirty = None;
    }

    /// Ink state of a logical pixel.
    pub fn pixel(&self, x: usize, y: usize) -> BinaryColor {
        let (px, py) = self.physical(x, y);
        let byte = self.bits[py * ROW_BYTES + px / 8];
        if byte & (0x80 >> (px % 8)) == 0 {
            BinaryColor::On
        } else {
            BinaryColor::Off
        }
    }

    #[inline]
    fn physical(&self, x: usize, y: usize) -> (usize, usize) {
        if self.rotated {
            (PANEL_WIDTH_PX - 1 - x, PANEL_HEIGHT_PX - 1 - y)
        } else {
            (x, y)
        }
    }

    /// Write a logical pixel, marking its row dirty only if the color changed.
    #[inline]
    fn set_pixel(&mut self, x: usize, y: usize, color: BinaryColor) {
        let (px, py) = self.physical(x, y);
        let idx = py * ROW_BYTES + px / 8;
        let mask = 0x80 >> (px % 8);
        let old = self.bits[idx];
        let new = match color {
            BinaryColor::On => old & !mask,
            BinaryColor::Off => old | mask,
        };
        if new != old {
            self.bits[idx] = new;
            match &mut self.dirty {
                Some(rows) => rows.expand(py),
                None => {
                    self.dirty = Some(DirtyRows {
                        first: py,
                        last: py,
                    })
                }
            }
        }
    }
}

impl OriginDimensions for FrameBuffer {
    fn size(&self) -> Size {
        Size::new(PANEL_WIDTH_PX as u32, PANEL_HEIGHT_PX as u32)
    }
}

impl DrawTarget for FrameBuffer {
    type Color = BinaryColor;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(coord, color) in pixels {
            let x = coord.x;
            let y = coord.y;
            if x >= 0 && y >= 0 && (x as usize) < PANEL_WIDTH_PX && (y as usize) < PANEL_HEIGHT_PX
            {
                self.set_pixel(x as usize, y as usize, color);
            }
        }
        Ok(())
    }

    fn fill_solid(&mut self, area: &Rectangle, color: Self::Color) -> Result<(), Self::Error> {
        let w = PANEL_WIDTH_PX;
        let h = PANEL_HEIGHT_PX;

        let x_start = (area.top_left.x.max(0) as usize).min(w);
        let y_start = (area.top_left.y.max(0) as usize).min(h);
        let x_end = ((area.top_left.x.max(0) as usize).saturating_add(area.size.width as usize)).min(w);
        let y_end =
            ((area.top_left.y.max(0) as usize).saturating_add(area.size.height as usize)).min(h);

        for y in y_start..y_end {
            for x in x_start..x_end {
                self.set_pixel(x, y, color);
            }
        }
        Ok(())
    }

    fn clear(&mut self, color: Self::Color) -> Result<(), Self::Error> {
        let fill = match color {
            BinaryColor::On => 0x00,
            BinaryColor::Off => 0xFF,
        };
        if self.bits.iter().any(|&b| b != fill) {
            self.bits.fill(fill);
            self.dirty = Some(DirtyRows {
                first: 0,
                last: PANEL_HEIGHT_PX - 1,
            });
        }
        Ok(())
    }
}
