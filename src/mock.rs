//! Synthetic backend for testing without hardware.
//!
//! The backend is cheap to clone; clones share state so a test can keep a
//! handle and inject faults after giving the backend to a registry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{CameraError, Result};
use crate::frame::FrameLayout;
use crate::traits::{
    BackendCapture, BackendDeviceId, DeviceDescriptor, DeviceInfo, FormatDescriptor,
    PermissionState, PixelFormat, PlatformBackend, RawFrame,
};
use crate::validation::yuv_to_rgb;

/// Value written into row padding so tests can see it was passed through.
pub const PAD_BYTE: u8 = 0xEE;

/// YUV values of the 8 color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black.
const COLOR_BARS_YUV: [(u8, u8, u8); 8] = [
    (235, 128, 128), // White
    (210, 16, 146),  // Yellow
    (170, 166, 16),  // Cyan
    (145, 54, 34),   // Green
    (106, 202, 222), // Magenta
    (81, 90, 240),   // Red
    (41, 240, 110),  // Blue
    (16, 128, 128),  // Black
];

/// Test pattern types for synthetic frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color; channel values in the delivered layout's order
    /// (Y, U, V for YUYV; R, G, B for RGB24; the first value for GRAY).
    Solid(u8, u8, u8),
}

/// A device exposed by the synthetic backend.
#[derive(Debug, Clone)]
pub struct SyntheticDevice {
    info: DeviceInfo,
    formats: Vec<FormatDescriptor>,
    fail_formats: bool,
    reject_configure: bool,
    disconnected: bool,
}

impl SyntheticDevice {
    /// Create a device with no formats. Its unique id is derived from `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let slug = name.to_lowercase().replace(' ', "-");
        Self {
            info: DeviceInfo {
                name: name.to_owned(),
                unique_id: format!("synthetic:{slug}"),
                model_id: format!("synthetic-{slug}"),
            },
            formats: Vec::new(),
            fail_formats: false,
            reject_configure: false,
            disconnected: false,
        }
    }

    /// Override the unique id.
    #[must_use]
    pub fn with_unique_id(mut self, unique_id: &str) -> Self {
        unique_id.clone_into(&mut self.info.unique_id);
        self
    }

    /// Append a supported format.
    #[must_use]
    pub fn with_format(mut self, width: u32, height: u32, frame_rate: u32, pixel_format: PixelFormat) -> Self {
        self.formats
            .push(FormatDescriptor::new(width, height, frame_rate, pixel_format));
        self
    }

    /// Make format queries for this device fail.
    #[must_use]
    pub const fn failing_formats(mut self) -> Self {
        self.fail_formats = true;
        self
    }

    /// Make `configure` reject every format on this device.
    #[must_use]
    pub const fn rejecting_configure(mut self) -> Self {
        self.reject_configure = true;
        self
    }
}

#[derive(Debug)]
struct SyntheticState {
    devices: Vec<SyntheticDevice>,
    reachable: bool,
    permission: PermissionState,
    permission_after_request: PermissionState,
    permission_requests: u32,
    row_alignment: u32,
    frames_until_ready: u32,
    pattern: TestPattern,
    fail_reads: bool,
    stall_reads: bool,
    stream_ended: bool,
    fail_teardown: bool,
    start_delay: Duration,
    open_handles: HashSet<String>,
}

impl SyntheticState {
    fn device(&self, unique_id: &str) -> Option<&SyntheticDevice> {
        self.devices.iter().find(|d| d.info.unique_id == unique_id)
    }

    fn is_connected(&self, unique_id: &str) -> bool {
        self.device(unique_id).is_some_and(|d| !d.disconnected)
    }
}

/// In-process reference backend with configurable devices and faults.
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    state: Arc<Mutex<SyntheticState>>,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticBackend {
    /// Create a backend with no devices and granted permission.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SyntheticState {
                devices: Vec::new(),
                reachable: true,
                permission: PermissionState::Granted,
                permission_after_request: PermissionState::Granted,
                permission_requests: 0,
                row_alignment: 1,
                frames_until_ready: 0,
                pattern: TestPattern::ColorBars,
                fail_reads: false,
                stall_reads: false,
                stream_ended: false,
                fail_teardown: false,
                start_delay: Duration::ZERO,
                open_handles: HashSet::new(),
            })),
        }
    }

    /// Two cameras: a 1080p MJPEG/VGA YUYV webcam and a 720p YUYV/GRAY camera.
    #[must_use]
    pub fn with_default_devices() -> Self {
        Self::new()
            .with_device(
                SyntheticDevice::new("Synthetic HD Camera")
                    .with_format(1920, 1080, 30, PixelFormat::Mjpeg)
                    .with_format(640, 480, 30, PixelFormat::Yuyv),
            )
            .with_device(
                SyntheticDevice::new("Synthetic IR Camera")
                    .with_format(1280, 720, 30, PixelFormat::Yuyv)
                    .with_format(1280, 720, 60, PixelFormat::Yuyv)
                    .with_format(640, 480, 15, PixelFormat::Gray),
            )
    }

    /// Add a device.
    #[must_use]
    pub fn with_device(self, device: SyntheticDevice) -> Self {
        self.state.lock().devices.push(device);
        self
    }

    /// Pad rows to a multiple of `alignment` bytes.
    #[must_use]
    pub fn with_row_alignment(self, alignment: u32) -> Self {
        self.state.lock().row_alignment = alignment.max(1);
        self
    }

    /// Number of `frame_ready` polls that report no frame after each start.
    #[must_use]
    pub fn with_frames_until_ready(self, polls: u32) -> Self {
        self.state.lock().frames_until_ready = polls;
        self
    }

    /// Set the pattern of generated frames.
    #[must_use]
    pub fn with_pattern(self, pattern: TestPattern) -> Self {
        self.state.lock().pattern = pattern;
        self
    }

    /// Set the current permission state and the state a request resolves to.
    #[must_use]
    pub fn with_permission(self, current: PermissionState, after_request: PermissionState) -> Self {
        {
            let mut state = self.state.lock();
            state.permission = current;
            state.permission_after_request = after_request;
        }
        self
    }

    /// Make the whole camera subsystem unreachable (or reachable again).
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Change the permission state as the OS would.
    pub fn set_permission(&self, permission: PermissionState) {
        self.state.lock().permission = permission;
    }

    /// Make frame reads fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Make frame reads time out as if the camera stopped delivering.
    pub fn set_stall_reads(&self, stall: bool) {
        self.state.lock().stall_reads = stall;
    }

    /// End the frame stream of every open capture, as a driver does after a
    /// failed dequeue.
    pub fn set_stream_ended(&self, ended: bool) {
        self.state.lock().stream_ended = ended;
    }

    /// Make every capture `start` take `delay` before streaming.
    pub fn set_start_delay(&self, delay: Duration) {
        self.state.lock().start_delay = delay;
    }

    /// Make `stop` report an error after releasing the device.
    pub fn set_fail_teardown(&self, fail: bool) {
        self.state.lock().fail_teardown = fail;
    }

    /// Unplug the device with `unique_id`; it stays out of enumeration.
    pub fn disconnect(&self, unique_id: &str) {
        let mut state = self.state.lock();
        if let Some(device) = state.devices.iter_mut().find(|d| d.info.unique_id == unique_id) {
            device.disconnected = true;
        }
    }

    /// Number of devices currently held open.
    pub fn open_handle_count(&self) -> usize {
        self.state.lock().open_handles.len()
    }

    /// Number of permission requests received.
    pub fn permission_requests(&self) -> u32 {
        self.state.lock().permission_requests
    }
}

impl PlatformBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let state = self.state.lock();
        if !state.reachable {
            return Err(CameraError::BackendUnavailable(
                "synthetic subsystem offline".to_owned(),
            ));
        }
        Ok(state
            .devices
            .iter()
            .filter(|d| !d.disconnected)
            .map(|d| DeviceDescriptor {
                info: d.info.clone(),
                id: BackendDeviceId(d.info.unique_id.clone()),
            })
            .collect())
    }

    fn formats(&self, device: &DeviceDescriptor) -> Result<Vec<FormatDescriptor>> {
        let state = self.state.lock();
        let dev = state
            .device(&device.id.0)
            .filter(|d| !d.disconnected)
            .ok_or_else(|| CameraError::DeviceUnavailable(device.info.name.clone()))?;
        if dev.fail_formats {
            return Err(CameraError::Backend(format!(
                "format query failed on {}",
                dev.info.name
            )));
        }
        Ok(dev.formats.clone())
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn BackendCapture>> {
        let mut state = self.state.lock();
        if !state.is_connected(&device.id.0) {
            return Err(CameraError::DeviceUnavailable(device.info.name.clone()));
        }
        if !state.open_handles.insert(device.id.0.clone()) {
            return Err(CameraError::DeviceBusy(device.info.name.clone()));
        }
        debug!(device = %device.info.name, "synthetic device opened");
        Ok(Box::new(SyntheticCapture {
            state: Arc::clone(&self.state),
            unique_id: device.id.0.clone(),
            layout: None,
            frame_rate: 30,
            streaming: false,
            polls: 0,
            sequence: 0,
            released: false,
        }))
    }

    fn query_permission(&self) -> PermissionState {
        self.state.lock().permission
    }

    fn request_permission(&self) {
        let mut state = self.state.lock();
        state.permission_requests += 1;
        if state.permission == PermissionState::Undetermined {
            state.permission = state.permission_after_request;
        }
    }
}

/// Capture handle of the synthetic backend.
struct SyntheticCapture {
    state: Arc<Mutex<SyntheticState>>,
    unique_id: String,
    layout: Option<FrameLayout>,
    frame_rate: u32,
    streaming: bool,
    polls: u32,
    sequence: u64,
    released: bool,
}

impl SyntheticCapture {
    fn ensure_connected(&self, state: &SyntheticState) -> Result<()> {
        if state.is_connected(&self.unique_id) {
            Ok(())
        } else {
            Err(CameraError::DeviceUnavailable(self.unique_id.clone()))
        }
    }

    fn ensure_streaming(&self, state: &SyntheticState) -> Result<()> {
        self.ensure_connected(state)?;
        if !self.streaming {
            return Err(CameraError::Backend("not streaming".to_owned()));
        }
        if state.stream_ended {
            return Err(CameraError::StreamEnded(format!(
                "synthetic stream of {} ended",
                self.unique_id
            )));
        }
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.state.lock().open_handles.remove(&self.unique_id);
            self.released = true;
        }
    }
}

impl BackendCapture for SyntheticCapture {
    fn configure(&mut self, format: &FormatDescriptor) -> Result<FrameLayout> {
        let state = self.state.lock();
        self.ensure_connected(&state)?;
        let device = state
            .device(&self.unique_id)
            .ok_or_else(|| CameraError::DeviceUnavailable(self.unique_id.clone()))?;
        if device.reject_configure || !device.formats.contains(format) {
            return Err(CameraError::BackendRejected(format!(
                "{} cannot produce {format}",
                device.info.name
            )));
        }
        let layout = FrameLayout::aligned(
            format.width,
            format.height,
            format.pixel_format,
            state.row_alignment,
        );
        self.layout = Some(layout);
        self.frame_rate = format.frame_rate;
        Ok(layout)
    }

    fn start(&mut self) -> Result<()> {
        if self.layout.is_none() {
            return Err(CameraError::Backend("start before configure".to_owned()));
        }
        let delay = {
            let state = self.state.lock();
            self.ensure_connected(&state)?;
            state.start_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.streaming = true;
        self.polls = 0;
        Ok(())
    }

    fn frame_ready(&mut self) -> Result<bool> {
        let state = self.state.lock();
        self.ensure_streaming(&state)?;
        self.polls = self.polls.saturating_add(1);
        Ok(self.polls > state.frames_until_ready)
    }

    fn pull_frame(&mut self, timeout: Duration) -> Result<RawFrame> {
        let state = self.state.lock();
        self.ensure_streaming(&state)?;
        let Some(layout) = self.layout else {
            return Err(CameraError::Backend("not streaming".to_owned()));
        };
        if state.fail_reads {
            return Err(CameraError::Backend("synthetic read failure".to_owned()));
        }
        if state.stall_reads || self.polls <= state.frames_until_ready {
            return Err(CameraError::GrabTimeout(timeout));
        }

        let data = generate_test_frame(&layout, state.pattern);
        let seq = self.sequence;
        self.sequence += 1;

        Ok(RawFrame {
            data,
            timestamp: Duration::from_millis(seq * 1000 / u64::from(self.frame_rate.max(1))),
            sequence: seq,
        })
    }

    fn stop(&mut self) -> Result<()> {
        self.streaming = false;
        self.release();
        if self.state.lock().fail_teardown {
            return Err(CameraError::Backend("synthetic teardown failure".to_owned()));
        }
        Ok(())
    }
}

impl Drop for SyntheticCapture {
    fn drop(&mut self) {
        self.release();
    }
}

/// Generate one frame of `pattern` in `layout`, padding rows with [`PAD_BYTE`].
pub fn generate_test_frame(layout: &FrameLayout, pattern: TestPattern) -> Vec<u8> {
    let stride = layout.bytes_per_row as usize;
    let row_bytes = layout.row_bytes();
    let mut data = vec![PAD_BYTE; layout.frame_len()];

    for row in data.chunks_exact_mut(stride) {
        let (pixels, _padding) = row.split_at_mut(row_bytes);
        match layout.pixel_format {
            PixelFormat::Yuyv => fill_yuyv_row(pixels, layout.width, pattern),
            PixelFormat::Gray => fill_gray_row(pixels, layout.width, pattern),
            PixelFormat::Rgb24 | PixelFormat::Nv12 | PixelFormat::Mjpeg => fill_rgb_row(pixels, layout.width, pattern),
        }
    }

    data
}

fn bar_at(x: u32, width: u32) -> (u8, u8, u8) {
    let bar_width = (width / 8).max(1);
    let idx = (x / bar_width).min(7) as usize;
    COLOR_BARS_YUV.get(idx).copied().unwrap_or((16, 128, 128))
}

fn ramp_at(x: u32, width: u32) -> u8 {
    #[allow(clippy::cast_possible_truncation)]
    let value = ((u64::from(x) * 255) / u64::from(width.max(1))) as u8;
    value
}

fn fill_yuyv_row(row: &mut [u8], width: u32, pattern: TestPattern) {
    for (pair, chunk) in row.chunks_exact_mut(4).enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let x = pair as u32 * 2;
        let (y, u, v) = match pattern {
            TestPattern::ColorBars => bar_at(x, width),
            TestPattern::Gradient => (ramp_at(x, width), 128, 128),
            TestPattern::Solid(y, u, v) => (y, u, v),
        };
        chunk.copy_from_slice(&[y, u, y, v]);
    }
}

fn fill_gray_row(row: &mut [u8], width: u32, pattern: TestPattern) {
    for (x, px) in row.iter_mut().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let x = x as u32;
        *px = match pattern {
            TestPattern::ColorBars => bar_at(x, width).0,
            TestPattern::Gradient => ramp_at(x, width),
            TestPattern::Solid(y, _, _) => y,
        };
    }
}

fn fill_rgb_row(row: &mut [u8], width: u32, pattern: TestPattern) {
    for (x, chunk) in row.chunks_exact_mut(3).enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let x = x as u32;
        let (r, g, b) = match pattern {
            TestPattern::ColorBars => {
                let (y, u, v) = bar_at(x, width);
                yuv_to_rgb(y, u, v)
            }
            TestPattern::Gradient => {
                let level = ramp_at(x, width);
                (level, level, level)
            }
            TestPattern::Solid(r, g, b) => (r, g, b),
        };
        chunk.copy_from_slice(&[r, g, b]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_device(backend: &SyntheticBackend) -> DeviceDescriptor {
        backend
            .enumerate()
            .expect("enumerate should succeed")
            .into_iter()
            .next()
            .expect("at least one device")
    }

    #[test]
    fn test_default_devices() {
        let backend = SyntheticBackend::with_default_devices();
        let devices = backend.enumerate().expect("enumerate should succeed");
        assert_eq!(devices.len(), 2);

        let formats = backend.formats(&devices[0]).expect("formats should succeed");
        assert_eq!(
            formats,
            vec![
                FormatDescriptor::new(1920, 1080, 30, PixelFormat::Mjpeg),
                FormatDescriptor::new(640, 480, 30, PixelFormat::Yuyv),
            ]
        );
    }

    #[test]
    fn test_unreachable_backend() {
        let backend = SyntheticBackend::with_default_devices();
        backend.set_reachable(false);
        assert!(matches!(
            backend.enumerate(),
            Err(CameraError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn test_second_open_is_busy() {
        let backend = SyntheticBackend::with_default_devices();
        let device = first_device(&backend);

        let mut first = backend.open(&device).expect("open should succeed");
        assert!(matches!(
            backend.open(&device),
            Err(CameraError::DeviceBusy(_))
        ));

        first.stop().expect("stop should succeed");
        assert_eq!(backend.open_handle_count(), 0);
        assert!(backend.open(&device).is_ok());
    }

    #[test]
    fn test_dropped_capture_releases_device() {
        let backend = SyntheticBackend::with_default_devices();
        let device = first_device(&backend);

        drop(backend.open(&device).expect("open should succeed"));
        assert_eq!(backend.open_handle_count(), 0);
    }

    #[test]
    fn test_capture_frames() {
        let backend = SyntheticBackend::with_default_devices().with_frames_until_ready(2);
        let device = first_device(&backend);
        let mut capture = backend.open(&device).expect("open should succeed");

        let format = FormatDescriptor::new(640, 480, 30, PixelFormat::Yuyv);
        let layout = capture.configure(&format).expect("configure should succeed");
        assert_eq!(layout.bytes_per_row, 1280);
        capture.start().expect("start should succeed");

        assert!(!capture.frame_ready().expect("poll should succeed"));
        assert!(!capture.frame_ready().expect("poll should succeed"));
        assert!(capture.frame_ready().expect("poll should succeed"));

        let frame1 = capture
            .pull_frame(Duration::from_millis(100))
            .expect("pull should succeed");
        assert_eq!(frame1.sequence, 0);
        assert_eq!(frame1.data.len(), layout.frame_len());

        let frame2 = capture
            .pull_frame(Duration::from_millis(100))
            .expect("pull should succeed");
        assert_eq!(frame2.sequence, 1);
        assert!(frame2.timestamp > frame1.timestamp);
    }

    #[test]
    fn test_stalled_and_ended_streams() {
        let backend = SyntheticBackend::with_default_devices();
        let device = first_device(&backend);
        let mut capture = backend.open(&device).expect("open should succeed");
        capture
            .configure(&FormatDescriptor::new(640, 480, 30, PixelFormat::Yuyv))
            .expect("configure should succeed");
        capture.start().expect("start should succeed");
        assert!(capture.frame_ready().expect("poll should succeed"));

        backend.set_stall_reads(true);
        let timeout = Duration::from_millis(20);
        assert!(matches!(
            capture.pull_frame(timeout),
            Err(CameraError::GrabTimeout(t)) if t == timeout
        ));
        backend.set_stall_reads(false);
        assert!(capture.pull_frame(timeout).is_ok());

        backend.set_stream_ended(true);
        assert!(matches!(
            capture.frame_ready(),
            Err(CameraError::StreamEnded(_))
        ));
        assert!(matches!(
            capture.pull_frame(timeout),
            Err(CameraError::StreamEnded(_))
        ));
    }

    #[test]
    fn test_configure_rejects_unknown_format() {
        let backend = SyntheticBackend::with_default_devices();
        let device = first_device(&backend);
        let mut capture = backend.open(&device).expect("open should succeed");

        let format = FormatDescriptor::new(320, 240, 30, PixelFormat::Yuyv);
        assert!(matches!(
            capture.configure(&format),
            Err(CameraError::BackendRejected(_))
        ));
    }

    #[test]
    fn test_color_bars_pattern() {
        let layout = FrameLayout::packed(640, 480, PixelFormat::Yuyv);
        let data = generate_test_frame(&layout, TestPattern::ColorBars);

        assert_eq!(data.len(), 640 * 480 * 2);

        // First bar should be white (Y=235)
        assert_eq!(data[0], 235);
    }

    #[test]
    fn test_gradient_pattern() {
        let layout = FrameLayout::packed(640, 480, PixelFormat::Yuyv);
        let data = generate_test_frame(&layout, TestPattern::Gradient);

        // Left edge should be dark
        assert!(data[0] < 10);

        // Right edge should be bright (check last row, last pixel)
        let last_row_start = 479 * 640 * 2;
        let last_pixel_y = data[last_row_start + 638 * 2];
        assert!(last_pixel_y > 200);
    }

    #[test]
    fn test_solid_rgb_pattern_with_padding() {
        let layout = FrameLayout::aligned(10, 2, PixelFormat::Rgb24, 16);
        let data = generate_test_frame(&layout, TestPattern::Solid(1, 2, 3));

        assert_eq!(layout.bytes_per_row, 32);
        assert_eq!(&data[..3], &[1, 2, 3]);
        assert_eq!(data[30], PAD_BYTE);
        assert_eq!(data[31], PAD_BYTE);
        assert_eq!(&data[32..35], &[1, 2, 3]);
    }

    #[test]
    fn test_permission_request_resolves() {
        let backend = SyntheticBackend::new()
            .with_permission(PermissionState::Undetermined, PermissionState::Denied);
        assert_eq!(backend.query_permission(), PermissionState::Undetermined);

        backend.request_permission();
        assert_eq!(backend.query_permission(), PermissionState::Denied);
        assert_eq!(backend.permission_requests(), 1);
    }
}
