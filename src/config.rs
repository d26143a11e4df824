//! Core configuration and the best-match format policy.

use std::cmp::Reverse;
use std::time::Duration;

use crate::traits::{FormatDescriptor, PixelFormat};

/// Tunables shared by the registry and its sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Longest a `grab_frame` call waits for the backend.
    pub grab_timeout: Duration,
    /// Number of driver buffers a backend stream allocates.
    pub buffer_count: u32,
    /// Pixel formats in order of preference for size-only format selection.
    pub format_priority: Vec<PixelFormat>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            grab_timeout: Duration::from_secs(2),
            buffer_count: 4,
            format_priority: vec![
                PixelFormat::Rgb24,
                PixelFormat::Nv12,
                PixelFormat::Yuyv,
                PixelFormat::Gray,
                PixelFormat::Mjpeg,
            ],
        }
    }
}

impl CoreConfig {
    /// Set the grab timeout.
    #[must_use]
    pub const fn with_grab_timeout(mut self, timeout: Duration) -> Self {
        self.grab_timeout = timeout;
        self
    }

    /// Set the number of driver buffers.
    #[must_use]
    pub fn with_buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count.max(1);
        self
    }

    /// Set the pixel format preference order.
    #[must_use]
    pub fn with_format_priority(mut self, priority: Vec<PixelFormat>) -> Self {
        self.format_priority = priority;
        self
    }

    /// Pick the format to use for a `width` x `height` capture.
    ///
    /// Only exact size matches qualify. Among them the earliest entry of
    /// `format_priority` wins, then the highest frame rate, then the earliest
    /// listed format. Formats missing from `format_priority` rank last.
    pub fn best_match(
        &self,
        formats: &[FormatDescriptor],
        width: u32,
        height: u32,
    ) -> Option<(usize, FormatDescriptor)> {
        formats
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, f)| f.width == width && f.height == height)
            .min_by_key(|&(index, f)| (self.rank(f.pixel_format), Reverse(f.frame_rate), index))
    }

    fn rank(&self, pixel_format: PixelFormat) -> usize {
        self.format_priority
            .iter()
            .position(|&p| p == pixel_format)
            .unwrap_or(self.format_priority.len())
    }
}
