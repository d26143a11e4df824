//! Frame buffers and their memory layout.
//!
//! Pixel data is row-major, top-to-bottom. Row `y` starts at byte
//! `y * bytes_per_row`; the first `width * bytes_per_pixel` bytes of a row are
//! pixels in the channel order of [`FrameLayout::pixel_format`], anything after
//! that is backend padding and is passed through untouched.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::traits::PixelFormat;

/// Geometry of delivered frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Bytes between the starts of consecutive rows.
    pub bytes_per_row: u32,
    /// Delivered pixel layout.
    pub pixel_format: PixelFormat,
}

impl FrameLayout {
    /// Layout with tightly packed rows.
    ///
    /// A row too long for `u32` yields `bytes_per_row == 0`, which
    /// [`FrameLayout::validate`] rejects.
    #[must_use]
    pub const fn packed(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        let pixel_format = pixel_format.delivered();
        let bytes_per_row = match width.checked_mul(pixel_format.bytes_per_pixel()) {
            Some(bytes) => bytes,
            None => 0,
        };
        Self {
            width,
            height,
            bytes_per_row,
            pixel_format,
        }
    }

    /// Layout with rows padded up to a multiple of `alignment` bytes.
    #[must_use]
    pub const fn aligned(width: u32, height: u32, pixel_format: PixelFormat, alignment: u32) -> Self {
        let mut layout = Self::packed(width, height, pixel_format);
        if alignment > 1 {
            layout.bytes_per_row = match layout.bytes_per_row.checked_next_multiple_of(alignment) {
                Some(bytes) => bytes,
                None => 0,
            };
        }
        layout
    }

    /// Bytes of pixel data in one row, without padding.
    pub const fn row_bytes(&self) -> usize {
        (self.width as usize).saturating_mul(self.pixel_format.bytes_per_pixel() as usize)
    }

    /// Total frame size: `height * bytes_per_row`.
    pub const fn frame_len(&self) -> usize {
        (self.height as usize).saturating_mul(self.bytes_per_row as usize)
    }

    /// Check that dimensions and stride agree with each other.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CameraError::Backend(format!(
                "degenerate frame size {}x{}",
                self.width, self.height
            )));
        }
        if u32::try_from(self.row_bytes()).is_err() {
            return Err(CameraError::Backend(format!(
                "row of {} {} pixels overflows the stride type",
                self.width, self.pixel_format
            )));
        }
        if (self.height as usize).checked_mul(self.bytes_per_row as usize).is_none() {
            return Err(CameraError::Backend(format!(
                "{} rows of {} bytes overflow the address space",
                self.height, self.bytes_per_row
            )));
        }
        if (self.bytes_per_row as usize) < self.row_bytes() {
            return Err(CameraError::Backend(format!(
                "bytes_per_row {} shorter than {} bytes of {} pixels",
                self.bytes_per_row,
                self.row_bytes(),
                self.pixel_format
            )));
        }
        Ok(())
    }
}

/// Immutable snapshot of one captured image.
///
/// Cloning shares the pixel bytes.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    layout: FrameLayout,
    data: Arc<[u8]>,
    timestamp: Duration,
    sequence: u64,
}

impl FrameBuffer {
    /// Wrap pixel bytes, rejecting data whose length disagrees with `layout`.
    pub fn new(layout: FrameLayout, data: Vec<u8>, timestamp: Duration, sequence: u64) -> Result<Self> {
        layout.validate()?;
        if data.len() != layout.frame_len() {
            return Err(CameraError::Backend(format!(
                "frame holds {} bytes, layout {}x{} stride {} needs {}",
                data.len(),
                layout.width,
                layout.height,
                layout.bytes_per_row,
                layout.frame_len()
            )));
        }
        Ok(Self {
            layout,
            data: data.into(),
            timestamp,
            sequence,
        })
    }

    /// Frame geometry.
    pub const fn layout(&self) -> FrameLayout {
        self.layout
    }

    /// Frame width in pixels.
    pub const fn width(&self) -> u32 {
        self.layout.width
    }

    /// Frame height in pixels.
    pub const fn height(&self) -> u32 {
        self.layout.height
    }

    /// Bytes between the starts of consecutive rows.
    pub const fn bytes_per_row(&self) -> u32 {
        self.layout.bytes_per_row
    }

    /// Delivered pixel layout.
    pub const fn pixel_format(&self) -> PixelFormat {
        self.layout.pixel_format
    }

    /// Capture timestamp relative to stream start.
    pub const fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Frame sequence number.
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// All pixel bytes, padding included.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of the pixel data in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false for a validated frame.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Row `y` including its trailing padding.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let stride = self.layout.bytes_per_row as usize;
        let start = (y as usize).checked_mul(stride)?;
        self.data.get(start..start + stride)
    }

    /// Copy the frame into `out`, which must hold `height * bytes_per_row` bytes.
    ///
    /// Nothing is written when `out` is too small.
    pub fn copy_to(&self, out: &mut [u8]) -> Result<usize> {
        let required = self.data.len();
        let Some(dst) = out.get_mut(..required) else {
            return Err(CameraError::BufferTooSmall {
                required,
                capacity: out.len(),
            });
        };
        dst.copy_from_slice(&self.data);
        Ok(required)
    }
}
