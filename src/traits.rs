//! Backend capability traits and the types that cross them.

use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::frame::FrameLayout;

/// Four-character pixel format code (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }
}

#[cfg(target_os = "linux")]
impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

#[cfg(target_os = "linux")]
impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Pixel format tag of a format descriptor or a delivered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed 24-bit RGB, bytes in R, G, B order.
    Rgb24,
    /// Packed YUV 4:2:2, bytes in Y0, U, Y1, V order.
    Yuyv,
    /// 8-bit luminance.
    Gray,
    /// Planar Y with interleaved half-resolution UV; delivered to callers as
    /// [`PixelFormat::Rgb24`].
    Nv12,
    /// Motion JPEG; delivered to callers as [`PixelFormat::Rgb24`].
    Mjpeg,
}

impl PixelFormat {
    /// Map a V4L2 FourCC onto a supported pixel format.
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.0 {
            b"RGB3" => Some(Self::Rgb24),
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Gray),
            b"NV12" => Some(Self::Nv12),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }

    /// V4L2 FourCC for this format.
    pub const fn fourcc(self) -> FourCC {
        match self {
            Self::Rgb24 => FourCC::new(b"RGB3"),
            Self::Yuyv => FourCC::new(b"YUYV"),
            Self::Gray => FourCC::new(b"GREY"),
            Self::Nv12 => FourCC::new(b"NV12"),
            Self::Mjpeg => FourCC::new(b"MJPG"),
        }
    }

    /// Layout the bytes of a frame captured in this format are delivered in.
    pub const fn delivered(self) -> Self {
        match self {
            Self::Nv12 | Self::Mjpeg => Self::Rgb24,
            other => other,
        }
    }

    /// Bytes per pixel of the delivered layout.
    pub const fn bytes_per_pixel(self) -> u32 {
        match self.delivered() {
            Self::Yuyv => 2,
            Self::Gray => 1,
            Self::Rgb24 | Self::Nv12 | Self::Mjpeg => 3,
        }
    }

    /// Parse a boundary tag produced by [`PixelFormat::as_str`].
    pub fn from_tag(tag: &str) -> Option<Self> {
        [Self::Rgb24, Self::Yuyv, Self::Gray, Self::Nv12, Self::Mjpeg]
            .into_iter()
            .find(|format| format.as_str() == tag)
    }

    /// Tag used across the boundary.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rgb24 => "RGB24",
            Self::Yuyv => "YUYV",
            Self::Gray => "GRAY",
            Self::Nv12 => "NV12",
            Self::Mjpeg => "MJPEG",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (width, height, frame rate, pixel format) combination a device can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatDescriptor {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frames per second.
    pub frame_rate: u32,
    /// Pixel format tag.
    pub pixel_format: PixelFormat,
}

impl FormatDescriptor {
    /// Create a new format descriptor.
    #[must_use]
    pub const fn new(width: u32, height: u32, frame_rate: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            frame_rate,
            pixel_format,
        }
    }

    /// Whether every dimension and the frame rate are positive.
    pub const fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.frame_rate > 0
    }
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {}fps {}",
            self.width, self.height, self.frame_rate, self.pixel_format
        )
    }
}

/// Identity strings of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Human-readable name.
    pub name: String,
    /// Stable identifier, unique among connected devices.
    pub unique_id: String,
    /// Model identifier.
    pub model_id: String,
}

/// Backend-specific opaque device handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendDeviceId(pub String);

/// One entry of a backend enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Identity strings.
    pub info: DeviceInfo,
    /// Handle the backend uses to reopen the device.
    pub id: BackendDeviceId,
}

/// OS camera authorization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    /// Capture is authorized.
    Granted,
    /// Capture was refused.
    Denied,
    /// The user has not been asked yet.
    Undetermined,
}

/// Pixel bytes pulled from a backend, laid out as negotiated by `configure`.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Pixel data, `height * bytes_per_row` bytes.
    pub data: Vec<u8>,
    /// Capture timestamp relative to stream start.
    pub timestamp: Duration,
    /// Frame sequence number.
    pub sequence: u64,
}

/// Per-OS camera subsystem adapter.
///
/// Implementations are selected at build time (see [`crate::native_backend`])
/// or injected by the host; the core never inspects their concrete type.
pub trait PlatformBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// List the physical devices currently present.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// List the formats a device supports, in backend order.
    fn formats(&self, device: &DeviceDescriptor) -> Result<Vec<FormatDescriptor>>;

    /// Open an exclusive capture handle on a device.
    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn BackendCapture>>;

    /// Current authorization state; must not prompt.
    fn query_permission(&self) -> PermissionState;

    /// Trigger the OS permission flow and return immediately.
    fn request_permission(&self);
}

/// Exclusive capture handle opened by a [`PlatformBackend`].
pub trait BackendCapture: Send {
    /// Apply a format. Returns the layout frames will be delivered in.
    fn configure(&mut self, format: &FormatDescriptor) -> Result<FrameLayout>;

    /// Begin streaming.
    fn start(&mut self) -> Result<()>;

    /// Whether a frame can be pulled without waiting. Never blocks.
    fn frame_ready(&mut self) -> Result<bool>;

    /// Pull the next frame, waiting at most `timeout`.
    fn pull_frame(&mut self, timeout: Duration) -> Result<RawFrame>;

    /// Stop streaming and release native resources.
    fn stop(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_mapping() {
        for format in [
            PixelFormat::Rgb24,
            PixelFormat::Yuyv,
            PixelFormat::Gray,
            PixelFormat::Nv12,
            PixelFormat::Mjpeg,
        ] {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(format));
            assert_eq!(PixelFormat::from_tag(format.as_str()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YU12")), None);
        assert_eq!(PixelFormat::from_tag("H264"), None);
    }

    #[test]
    fn test_delivered_layout() {
        assert_eq!(PixelFormat::Mjpeg.delivered(), PixelFormat::Rgb24);
        assert_eq!(PixelFormat::Mjpeg.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::Nv12.delivered(), PixelFormat::Rgb24);
        assert_eq!(PixelFormat::Nv12.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::Yuyv.bytes_per_pixel(), 2);
        assert_eq!(PixelFormat::Gray.bytes_per_pixel(), 1);
    }

    #[test]
    fn test_format_descriptor_display() {
        let format = FormatDescriptor::new(1920, 1080, 30, PixelFormat::Mjpeg);
        assert_eq!(format.to_string(), "1920x1080 30fps MJPEG");
        assert!(format.is_valid());
        assert!(!FormatDescriptor::new(0, 1080, 30, PixelFormat::Mjpeg).is_valid());
    }
}
