//! V4L2 backend using the v4l crate.
//!
//! Each started capture owns a streaming thread. The thread holds the mmap
//! stream and publishes the newest frame into a slot; `frame_ready` peeks at
//! the slot and `pull_frame` waits on it. MJPEG and NV12 payloads are
//! converted to RGB24 on that thread.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::ImageFormat;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::fraction::Fraction;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::config::CoreConfig;
use crate::error::{CameraError, Result};
use crate::frame::FrameLayout;
use crate::traits::{
    BackendCapture, BackendDeviceId, DeviceDescriptor, DeviceInfo, FormatDescriptor, FourCC,
    PermissionState, PixelFormat, PlatformBackend, RawFrame,
};
use crate::validation::yuv_to_rgb;

const EBUSY: i32 = 16;
const ENODEV: i32 = 19;

/// Shortest time the streaming thread waits for the driver before giving up.
const MIN_STREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend over `/dev/video*` nodes.
#[derive(Debug, Clone)]
pub struct V4l2Backend {
    root: PathBuf,
    buffer_count: u32,
    stream_timeout: Duration,
}

impl V4l2Backend {
    /// Backend scanning `/dev`.
    pub fn new(config: &CoreConfig) -> Self {
        Self::with_root("/dev", config)
    }

    /// Backend scanning `root` for `video*` nodes.
    pub fn with_root<P: Into<PathBuf>>(root: P, config: &CoreConfig) -> Self {
        Self {
            root: root.into(),
            buffer_count: config.buffer_count.max(1),
            stream_timeout: config.grab_timeout.max(MIN_STREAM_TIMEOUT),
        }
    }

    fn video_nodes(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.root).map_err(|err| {
            CameraError::BackendUnavailable(format!("{}: {err}", self.root.display()))
        })?;
        let mut nodes: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("video"))
            })
            .collect();
        nodes.sort_by_key(|path| node_number(path));
        Ok(nodes)
    }
}

fn node_number(path: &Path) -> u32 {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("video"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(u32::MAX)
}

fn open_node(path: &Path) -> Result<Device> {
    Device::with_path(path).map_err(|err| map_io(path, &err))
}

fn map_io(path: &Path, err: &io::Error) -> CameraError {
    let what = format!("{}: {err}", path.display());
    match (err.kind(), err.raw_os_error()) {
        (io::ErrorKind::PermissionDenied, _) => CameraError::PermissionDenied,
        (io::ErrorKind::NotFound, _) | (_, Some(ENODEV)) => CameraError::DeviceUnavailable(what),
        (_, Some(EBUSY)) => CameraError::DeviceBusy(what),
        _ => CameraError::Backend(what),
    }
}

fn frames_per_second(interval: Fraction) -> u32 {
    if interval.numerator == 0 {
        return 0;
    }
    (interval.denominator + interval.numerator / 2) / interval.numerator
}

impl PlatformBackend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut devices = Vec::new();
        for path in self.video_nodes()? {
            let device = match Device::with_path(&path) {
                Ok(device) => device,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "skipping unopenable node");
                    continue;
                }
            };
            let Ok(caps) = device.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            // Metadata nodes of UVC cameras share the capture flag but list no formats.
            if !device.enum_formats().is_ok_and(|f| !f.is_empty()) {
                debug!(path = %path.display(), "skipping node without capture formats");
                continue;
            }

            let path_str = path.to_string_lossy().into_owned();
            devices.push(DeviceDescriptor {
                info: DeviceInfo {
                    name: caps.card,
                    unique_id: format!("{}@{path_str}", caps.bus),
                    model_id: caps.driver,
                },
                id: BackendDeviceId(path_str),
            });
        }
        Ok(devices)
    }

    fn formats(&self, descriptor: &DeviceDescriptor) -> Result<Vec<FormatDescriptor>> {
        let path = Path::new(&descriptor.id.0);
        let device = open_node(path)?;
        let descriptions = device.enum_formats().map_err(|err| map_io(path, &err))?;

        let mut formats = Vec::new();
        for description in descriptions {
            let Some(pixel_format) = PixelFormat::from_fourcc(FourCC::from(description.fourcc)) else {
                debug!(fourcc = %description.fourcc, "unsupported pixel format");
                continue;
            };
            let sizes = device
                .enum_framesizes(description.fourcc)
                .map_err(|err| map_io(path, &err))?;
            for size in sizes {
                let (width, height) = match size.size {
                    FrameSizeEnum::Discrete(discrete) => (discrete.width, discrete.height),
                    FrameSizeEnum::Stepwise(step) => (step.max_width, step.max_height),
                };
                let intervals = device
                    .enum_frameintervals(description.fourcc, width, height)
                    .map_err(|err| map_io(path, &err))?;
                for interval in intervals {
                    let frame_rate = match interval.interval {
                        FrameIntervalEnum::Discrete(fraction) => frames_per_second(fraction),
                        FrameIntervalEnum::Stepwise(step) => frames_per_second(step.min),
                    };
                    formats.push(FormatDescriptor::new(width, height, frame_rate, pixel_format));
                }
            }
        }
        Ok(formats)
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn BackendCapture>> {
        let path = PathBuf::from(&descriptor.id.0);
        let device = open_node(&path)?;
        debug!(path = %path.display(), "v4l2 device opened");
        Ok(Box::new(V4l2Capture {
            path,
            device: Some(device),
            buffer_count: self.buffer_count,
            stream_timeout: self.stream_timeout,
            plan: None,
            stream: None,
        }))
    }

    fn query_permission(&self) -> PermissionState {
        let Ok(nodes) = self.video_nodes() else {
            return PermissionState::Undetermined;
        };
        let mut denied = false;
        for path in &nodes {
            match Device::with_path(path) {
                Ok(_) => return PermissionState::Granted,
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => denied = true,
                Err(_) => {}
            }
        }
        if denied {
            PermissionState::Denied
        } else {
            PermissionState::Undetermined
        }
    }

    fn request_permission(&self) {
        info!("v4l2 access is governed by device node permissions, nothing to request");
    }
}

#[derive(Debug, Clone, Copy)]
struct StreamPlan {
    layout: FrameLayout,
    source: PixelFormat,
    /// Driver bytes per line of the source payload (the Y plane for NV12).
    source_stride: u32,
}

enum Fault {
    Disconnected(String),
    Failed(String),
}

#[derive(Default)]
struct Slot {
    latest: Option<RawFrame>,
    fault: Option<Fault>,
}

#[derive(Default)]
struct Shared {
    slot: Mutex<Slot>,
    ready: Condvar,
    running: AtomicBool,
}

impl Shared {
    fn publish(&self, frame: RawFrame) {
        self.slot.lock().latest = Some(frame);
        self.ready.notify_all();
    }

    fn fail(&self, fault: Fault) {
        self.slot.lock().fault = Some(fault);
        self.ready.notify_all();
    }
}

fn fault_error(slot: &Slot) -> Option<CameraError> {
    slot.fault.as_ref().map(|fault| match fault {
        Fault::Disconnected(what) => CameraError::DeviceUnavailable(what.clone()),
        Fault::Failed(what) => CameraError::StreamEnded(what.clone()),
    })
}

struct StreamThread {
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

/// Capture handle of one `/dev/video*` node.
struct V4l2Capture {
    path: PathBuf,
    device: Option<Device>,
    buffer_count: u32,
    stream_timeout: Duration,
    plan: Option<StreamPlan>,
    stream: Option<StreamThread>,
}

impl V4l2Capture {
    fn device(&self) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| CameraError::Backend(format!("{} already streaming", self.path.display())))
    }

    fn running(&self) -> Result<&Arc<Shared>> {
        self.stream
            .as_ref()
            .map(|s| &s.shared)
            .ok_or_else(|| CameraError::Backend("not streaming".to_owned()))
    }
}

impl BackendCapture for V4l2Capture {
    fn configure(&mut self, format: &FormatDescriptor) -> Result<FrameLayout> {
        let path = self.path.clone();
        let device = self.device()?;

        let requested = v4l::Format::new(
            format.width,
            format.height,
            format.pixel_format.fourcc().into(),
        );
        let applied = device
            .set_format(&requested)
            .map_err(|err| CameraError::BackendRejected(format!("{}: {err}", path.display())))?;
        if PixelFormat::from_fourcc(FourCC::from(applied.fourcc)) != Some(format.pixel_format) {
            return Err(CameraError::BackendRejected(format!(
                "requested {}, driver chose {}",
                format.pixel_format, applied.fourcc
            )));
        }
        if let Err(err) = device.set_params(&Parameters::with_fps(format.frame_rate)) {
            warn!(path = %path.display(), error = %err, "failed to set frame rate");
        }

        let mut layout = FrameLayout::packed(applied.width, applied.height, format.pixel_format);
        let converted = format.pixel_format.delivered() != format.pixel_format;
        if !converted && applied.stride > layout.bytes_per_row {
            layout.bytes_per_row = applied.stride;
        }
        self.plan = Some(StreamPlan {
            layout,
            source: format.pixel_format,
            source_stride: applied.stride.max(applied.width),
        });
        debug!(path = %path.display(), ?layout, "v4l2 format negotiated");
        Ok(layout)
    }

    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let plan = self
            .plan
            .ok_or_else(|| CameraError::Backend("start before configure".to_owned()))?;
        let device = self
            .device
            .take()
            .ok_or_else(|| CameraError::Backend(format!("{} has no open handle", self.path.display())))?;

        let shared = Arc::new(Shared::default());
        shared.running.store(true, Ordering::Release);
        let (started_tx, started_rx) = sync_channel::<io::Result<()>>(1);
        let worker = StreamWorker {
            device,
            plan,
            buffer_count: self.buffer_count,
            timeout: self.stream_timeout,
            shared: Arc::clone(&shared),
            path: self.path.clone(),
        };

        let handle = std::thread::Builder::new()
            .name("v4l2-capture".to_owned())
            .spawn(move || worker.run(&started_tx))?;

        match started_rx.recv() {
            Ok(Ok(())) => {
                self.stream = Some(StreamThread { shared, handle });
                Ok(())
            }
            Ok(Err(err)) => {
                reap(&self.path, handle);
                Err(map_io(&self.path, &err))
            }
            Err(_) => {
                reap(&self.path, handle);
                Err(CameraError::Backend("capture thread exited during startup".to_owned()))
            }
        }
    }

    fn frame_ready(&mut self) -> Result<bool> {
        let slot = self.running()?.slot.lock();
        if let Some(err) = fault_error(&slot) {
            return Err(err);
        }
        Ok(slot.latest.is_some())
    }

    fn pull_frame(&mut self, timeout: Duration) -> Result<RawFrame> {
        let shared = Arc::clone(self.running()?);
        let deadline = Instant::now() + timeout;
        let mut slot = shared.slot.lock();
        loop {
            if let Some(err) = fault_error(&slot) {
                return Err(err);
            }
            if let Some(frame) = slot.latest.take() {
                return Ok(frame);
            }
            if shared.ready.wait_until(&mut slot, deadline).timed_out() {
                return Err(CameraError::GrabTimeout(timeout));
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.device = None;
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        stream.shared.running.store(false, Ordering::Release);
        stream
            .handle
            .join()
            .map_err(|_| CameraError::Backend("capture thread panicked".to_owned()))?;
        debug!(path = %self.path.display(), "v4l2 stream stopped");
        Ok(())
    }
}

impl Drop for V4l2Capture {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(path = %self.path.display(), error = %err, "v4l2 teardown on drop");
        }
    }
}

struct StreamWorker {
    device: Device,
    plan: StreamPlan,
    buffer_count: u32,
    timeout: Duration,
    shared: Arc<Shared>,
    path: PathBuf,
}

impl StreamWorker {
    fn run(self, started: &SyncSender<io::Result<()>>) {
        let mut stream = match Stream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = started.send(Err(err));
                return;
            }
        };
        stream.set_timeout(self.timeout);
        if started.send(Ok(())).is_err() {
            return;
        }

        let mut origin: Option<Duration> = None;
        while self.shared.running.load(Ordering::Acquire) {
            let (buf, meta) = match stream.next() {
                Ok(next) => next,
                Err(err) => {
                    // The mmap stream cannot resume after a failed dequeue.
                    let what = format!("{}: {err}", self.path.display());
                    warn!(error = %what, "v4l2 stream ended");
                    let fault = match map_io(&self.path, &err) {
                        CameraError::DeviceUnavailable(_) => Fault::Disconnected(what),
                        _ => Fault::Failed(what),
                    };
                    self.shared.fail(fault);
                    break;
                }
            };

            let used = usize::try_from(meta.bytesused).unwrap_or(usize::MAX);
            let payload = buf.get(..used).unwrap_or(buf);
            let data = match decode_payload(payload, &self.plan) {
                Ok(data) => data,
                Err(err) => {
                    warn!(sequence = meta.sequence, error = %err, "dropping undecodable frame");
                    continue;
                }
            };

            // V4L2 timestamps are non-negative in practice
            #[allow(clippy::cast_sign_loss)]
            let secs = meta.timestamp.sec.max(0) as u64;
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);
            let captured = Duration::new(secs, nanos);
            let origin = *origin.get_or_insert(captured);

            self.shared.publish(RawFrame {
                data,
                timestamp: captured.saturating_sub(origin),
                sequence: u64::from(meta.sequence),
            });
        }
    }
}

/// Turn one driver payload into bytes laid out as `plan.layout`.
fn decode_payload(payload: &[u8], plan: &StreamPlan) -> Result<Vec<u8>> {
    let layout = &plan.layout;
    if plan.source == PixelFormat::Nv12 {
        return decode_nv12(payload, layout.width, layout.height, plan.source_stride);
    }
    if plan.source == PixelFormat::Mjpeg {
        let image = image::load_from_memory_with_format(payload, ImageFormat::Jpeg)
            .map_err(|err| CameraError::Backend(format!("MJPEG decode: {err}")))?
            .to_rgb8();
        if image.dimensions() != (layout.width, layout.height) {
            return Err(CameraError::Backend(format!(
                "MJPEG frame is {}x{}, expected {}x{}",
                image.width(),
                image.height(),
                layout.width,
                layout.height
            )));
        }
        return Ok(image.into_raw());
    }

    payload
        .get(..layout.frame_len())
        .map(<[u8]>::to_vec)
        .ok_or_else(|| {
            CameraError::Backend(format!(
                "short frame: {} of {} bytes",
                payload.len(),
                layout.frame_len()
            ))
        })
}

/// Convert an NV12 payload (Y plane, then interleaved UV at half resolution,
/// both `stride` bytes per line) into packed RGB24.
/// Join a capture thread that gave up during startup; `false` if it panicked.
fn reap(path: &Path, handle: JoinHandle<()>) -> bool {
    let clean = handle.join().is_ok();
    if !clean {
        warn!(path = %path.display(), "capture thread panicked during startup");
    }
    clean
}

fn decode_nv12(payload: &[u8], width: u32, height: u32, stride: u32) -> Result<Vec<u8>> {
    let (width, height, stride) = (width as usize, height as usize, stride as usize);
    if stride == 0 || stride < width {
        return Err(CameraError::Backend(format!("NV12 stride {stride} below width {width}")));
    }
    let luma_len = stride * height;
    let needed = luma_len + stride * height.div_ceil(2);
    let (Some(luma), Some(chroma)) = (payload.get(..luma_len), payload.get(luma_len..needed)) else {
        return Err(CameraError::Backend(format!(
            "short NV12 frame: {} of {needed} bytes",
            payload.len()
        )));
    };

    let mut rgb = Vec::with_capacity(width * height * 3);
    for (y, luma_row) in luma.chunks_exact(stride).enumerate() {
        let chroma_row = chroma
            .get((y / 2) * stride..(y / 2) * stride + stride)
            .unwrap_or_default();
        for x in 0..width {
            let pair = x & !1;
            let (Some(&l), Some(&u), Some(&v)) =
                (luma_row.get(x), chroma_row.get(pair), chroma_row.get(pair + 1))
            else {
                return Err(CameraError::Backend(format!("NV12 line {y} shorter than {width} pixels")));
            };
            let (r, g, b) = yuv_to_rgb(l, u, v);
            rgb.extend_from_slice(&[r, g, b]);
        }
    }
    Ok(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::ExtendedColorType;

    #[test]
    fn test_frames_per_second() {
        assert_eq!(frames_per_second(Fraction::new(1, 30)), 30);
        assert_eq!(frames_per_second(Fraction::new(1001, 30000)), 30);
        assert_eq!(frames_per_second(Fraction::new(0, 30)), 0);
    }

    #[test]
    fn test_node_ordering() {
        assert_eq!(node_number(Path::new("/dev/video10")), 10);
        assert_eq!(node_number(Path::new("/dev/video2")), 2);
        assert_eq!(node_number(Path::new("/dev/video-meta")), u32::MAX);
    }

    #[test]
    fn test_io_error_mapping() {
        let path = Path::new("/dev/video0");
        assert!(matches!(
            map_io(path, &io::Error::from(io::ErrorKind::PermissionDenied)),
            CameraError::PermissionDenied
        ));
        assert!(matches!(
            map_io(path, &io::Error::from_raw_os_error(EBUSY)),
            CameraError::DeviceBusy(_)
        ));
        assert!(matches!(
            map_io(path, &io::Error::from_raw_os_error(ENODEV)),
            CameraError::DeviceUnavailable(_)
        ));
    }

    #[test]
    fn test_raw_payload_keeps_stride() {
        let plan = StreamPlan {
            layout: FrameLayout {
                width: 4,
                height: 2,
                bytes_per_row: 16,
                pixel_format: PixelFormat::Yuyv,
            },
            source: PixelFormat::Yuyv,
            source_stride: 16,
        };
        let payload = vec![7u8; 40];
        let data = decode_payload(&payload, &plan).expect("decode should succeed");
        assert_eq!(data.len(), 32);

        assert!(decode_payload(&payload[..20], &plan).is_err());
    }

    #[test]
    fn test_mjpeg_payload_is_decoded_to_rgb() {
        let (width, height) = (16u32, 8u32);
        let rgb = vec![200u8; (width * height * 3) as usize];
        let mut jpeg = Vec::new();
        JpegEncoder::new(&mut jpeg)
            .encode(&rgb, width, height, ExtendedColorType::Rgb8)
            .expect("encode should succeed");

        let plan = StreamPlan {
            layout: FrameLayout::packed(width, height, PixelFormat::Mjpeg),
            source: PixelFormat::Mjpeg,
            source_stride: width,
        };
        let data = decode_payload(&jpeg, &plan).expect("decode should succeed");
        assert_eq!(data.len(), plan.layout.frame_len());
        assert!(data.iter().all(|&b| b.abs_diff(200) < 8));

        let wrong = StreamPlan {
            layout: FrameLayout::packed(8, 8, PixelFormat::Mjpeg),
            source: PixelFormat::Mjpeg,
            source_stride: 8,
        };
        assert!(decode_payload(&jpeg, &wrong).is_err());
    }

    #[test]
    fn test_nv12_payload_is_converted_to_rgb() {
        // 4x2 frame, stride 8: left pair white, right pair pure red, padding 0xEE.
        let mut payload = Vec::new();
        for _ in 0..2 {
            payload.extend_from_slice(&[235, 235, 81, 81, 0xEE, 0xEE, 0xEE, 0xEE]);
        }
        payload.extend_from_slice(&[128, 128, 90, 240, 0xEE, 0xEE, 0xEE, 0xEE]);

        let plan = StreamPlan {
            layout: FrameLayout::packed(4, 2, PixelFormat::Nv12),
            source: PixelFormat::Nv12,
            source_stride: 8,
        };
        let data = decode_payload(&payload, &plan).expect("decode should succeed");
        assert_eq!(data.len(), plan.layout.frame_len());
        assert_eq!(plan.layout.pixel_format, PixelFormat::Rgb24);

        let white = data.get(..3).expect("first pixel");
        assert!(white.iter().all(|&c| c >= 225));
        let red = data.get(9..12).expect("fourth pixel");
        assert!(red[0] > 200 && red[1] < 40 && red[2] < 40, "got {red:?}");

        assert!(decode_payload(&payload[..20], &plan).is_err());
    }

    #[test]
    fn test_reap_reports_panicked_thread() {
        let path = Path::new("/dev/video0");
        let clean = std::thread::spawn(|| ());
        assert!(reap(path, clean));

        let panicked = std::thread::spawn(|| std::panic::resume_unwind(Box::new("startup blew up")));
        assert!(!reap(path, panicked));
    }

    #[test]
    fn test_failed_stream_is_fatal() {
        let slot = Slot {
            latest: None,
            fault: Some(Fault::Failed("VIDIOC_DQBUF timed out".to_owned())),
        };
        let err = fault_error(&slot).expect("fault is reported");
        assert!(matches!(err, CameraError::StreamEnded(_)));
        assert!(err.is_fatal());

        let unplugged = Slot {
            latest: None,
            fault: Some(Fault::Disconnected("ENODEV".to_owned())),
        };
        assert!(fault_error(&unplugged).is_some_and(|err| err.is_fatal()));
        assert!(fault_error(&Slot::default()).is_none());
    }

    #[test]
    fn test_missing_root_is_unavailable() {
        let backend = V4l2Backend::with_root("/nonexistent/cam-capture", &CoreConfig::default());
        assert!(matches!(
            backend.enumerate(),
            Err(CameraError::BackendUnavailable(_))
        ));
        assert_eq!(backend.query_permission(), PermissionState::Undetermined);
    }
}
