//! Integer status-code interface over a process-wide [`Registry`].
//!
//! Every function here returns a status code, an integer value, or a string
//! length; nothing panics or propagates an error across this layer. Devices
//! are addressed by their index in the current catalog.
//!
//! Strings are written NUL-terminated into the caller's buffer, truncated on a
//! UTF-8 character boundary when they do not fit. The returned length is the
//! full byte length of the string without the NUL, so `ret >= buf.len()`
//! means the copy was truncated.

use std::sync::Arc;

use parking_lot::{const_rwlock, RwLock};
use tracing::{debug, error, warn};

use crate::config::CoreConfig;
use crate::error::{CameraError, Result};
use crate::native::native_backend;
use crate::registry::Registry;
use crate::session::{PollStatus, SessionState};
use crate::traits::{FormatDescriptor, PermissionState, PlatformBackend};

static REGISTRY: RwLock<Option<Arc<Registry>>> = const_rwlock(None);

/// Status codes returned across the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    /// Success.
    Ok = 0,
    /// Device index outside the catalog, or the device is gone.
    DeviceNotFound = -1,
    /// Format index outside the device's list, or no format matches.
    FormatNotFound = -2,
    /// The backend could not open or configure the device.
    OpeningDevice = -3,
    /// The device already has a running capture.
    SessionAlreadyStarted = -4,
    /// No running capture on the device.
    SessionNotStarted = -5,
    /// `initialize` has not succeeded yet.
    NotInitialized = -6,
    /// The device's session hit an unrecoverable error.
    ReadingSession = -7,
    /// The backend failed to deliver a frame.
    ReadingFrame = -8,
    /// The caller passed an empty buffer.
    BufferNull = -10,
    /// The caller's buffer cannot hold one frame.
    BufferNotEnough = -11,
    /// Camera authorization was denied.
    PermissionDenied = -12,
    /// No frame arrived within the grab timeout.
    GrabTimeout = -13,
    /// Malformed argument such as a negative index or size.
    InvalidArgument = -14,
    /// No frame has been produced yet.
    NoFrameYet = -256,
    /// Anything else.
    Unknown = -512,
}

/// Coarse grouping of non-success status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCategory {
    /// Try again later.
    NoDataYet,
    /// The OS refused camera access.
    PermissionDenied,
    /// Another capture owns the device.
    DeviceBusy,
    /// The caller asked for something that does not exist or is malformed.
    InvalidArgument,
    /// The camera subsystem failed.
    BackendError,
}

impl Status {
    /// Integer value of the code.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Category of a failure code; `None` for [`Status::Ok`].
    pub const fn category(self) -> Option<StatusCategory> {
        match self {
            Self::Ok => None,
            Self::NoFrameYet | Self::GrabTimeout => Some(StatusCategory::NoDataYet),
            Self::PermissionDenied => Some(StatusCategory::PermissionDenied),
            Self::SessionAlreadyStarted => Some(StatusCategory::DeviceBusy),
            Self::DeviceNotFound
            | Self::FormatNotFound
            | Self::SessionNotStarted
            | Self::NotInitialized
            | Self::BufferNull
            | Self::BufferNotEnough
            | Self::InvalidArgument => Some(StatusCategory::InvalidArgument),
            Self::OpeningDevice | Self::ReadingSession | Self::ReadingFrame | Self::Unknown => {
                Some(StatusCategory::BackendError)
            }
        }
    }

    /// Decode an integer code.
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Ok,
            -1 => Self::DeviceNotFound,
            -2 => Self::FormatNotFound,
            -3 => Self::OpeningDevice,
            -4 => Self::SessionAlreadyStarted,
            -5 => Self::SessionNotStarted,
            -6 => Self::NotInitialized,
            -7 => Self::ReadingSession,
            -8 => Self::ReadingFrame,
            -10 => Self::BufferNull,
            -11 => Self::BufferNotEnough,
            -12 => Self::PermissionDenied,
            -13 => Self::GrabTimeout,
            -14 => Self::InvalidArgument,
            -256 => Self::NoFrameYet,
            -512 => Self::Unknown,
            _ => return None,
        })
    }
}

impl From<&CameraError> for Status {
    fn from(err: &CameraError) -> Self {
        match err {
            CameraError::NotInitialized => Self::NotInitialized,
            CameraError::BackendUnavailable(_)
            | CameraError::DeviceUnavailable(_)
            | CameraError::BackendRejected(_) => Self::OpeningDevice,
            CameraError::IndexOutOfRange { .. } => Self::DeviceNotFound,
            CameraError::InvalidFormat(_) => Self::FormatNotFound,
            CameraError::InvalidArgument(_) => Self::InvalidArgument,
            CameraError::PermissionDenied => Self::PermissionDenied,
            CameraError::DeviceBusy(_) => Self::SessionAlreadyStarted,
            CameraError::Backend(_) => Self::ReadingFrame,
            CameraError::StreamEnded(_) => Self::ReadingSession,
            CameraError::NoFrameAvailable => Self::NoFrameYet,
            CameraError::GrabTimeout(_) => Self::GrabTimeout,
            CameraError::BufferTooSmall { .. } => Self::BufferNotEnough,
            CameraError::InvalidState { state, .. } => match state {
                SessionState::Started | SessionState::Configuring => Self::SessionAlreadyStarted,
                SessionState::Failed => Self::ReadingSession,
                SessionState::Idle | SessionState::Stopped => Self::SessionNotStarted,
            },
            CameraError::SessionNotStarted(_) => Self::SessionNotStarted,
            CameraError::EnumerationFailed(_) | CameraError::Validation(_) | CameraError::Io(_) => {
                Self::Unknown
            }
        }
    }
}

fn failure(operation: &str, err: &CameraError) -> i32 {
    let status = Status::from(err);
    debug!(operation, error = %err, code = status.code(), "boundary call failed");
    status.code()
}

fn status_of(operation: &str, result: Result<()>) -> i32 {
    match result {
        Ok(()) => Status::Ok.code(),
        Err(err) => failure(operation, &err),
    }
}

fn value_of(operation: &str, result: Result<u32>) -> i32 {
    match result {
        Ok(value) => i32::try_from(value).unwrap_or(i32::MAX),
        Err(err) => failure(operation, &err),
    }
}

fn registry() -> Result<Arc<Registry>> {
    REGISTRY.read().clone().ok_or(CameraError::NotInitialized)
}

fn to_index(value: i32) -> Result<usize> {
    usize::try_from(value).map_err(|_| CameraError::InvalidArgument(format!("negative index {value}")))
}

fn dimension(value: i32) -> Result<u32> {
    u32::try_from(value)
        .ok()
        .filter(|&v| v > 0)
        .ok_or_else(|| CameraError::InvalidArgument(format!("dimension {value}")))
}

fn lookup_format(device_index: i32, format_index: i32) -> std::result::Result<FormatDescriptor, Status> {
    let device = registry()
        .and_then(|r| r.device(to_index(device_index)?))
        .map_err(|err| Status::from(&err))?;
    let format_index = to_index(format_index).map_err(|err| Status::from(&err))?;
    device
        .formats()
        .get(format_index)
        .copied()
        .ok_or(Status::FormatNotFound)
}

/// Copy `value` into `buf` as a NUL-terminated string.
///
/// Returns the full byte length of `value`.
pub fn copy_str(value: &str, buf: &mut [u8]) -> usize {
    let Some(capacity) = buf.len().checked_sub(1) else {
        return value.len();
    };
    let end = (0..=value.len().min(capacity))
        .rev()
        .find(|&i| value.is_char_boundary(i))
        .unwrap_or(0);
    let bytes = value.as_bytes().get(..end).unwrap_or_default();
    if let Some(dst) = buf.get_mut(..end) {
        dst.copy_from_slice(bytes);
    }
    if let Some(nul) = buf.get_mut(end) {
        *nul = 0;
    }
    value.len()
}

fn string_of(operation: &str, result: Result<String>, buf: &mut [u8]) -> usize {
    match result {
        Ok(value) => copy_str(&value, buf),
        Err(err) => {
            failure(operation, &err);
            copy_str("", buf);
            0
        }
    }
}

/// Initialize the process-wide registry with the native backend.
///
/// Calling it again after a success does nothing and returns [`Status::Ok`].
pub fn initialize() -> i32 {
    let config = CoreConfig::default();
    initialize_with(native_backend(&config), config)
}

/// Initialize the process-wide registry with an explicit backend.
pub fn initialize_with(backend: Arc<dyn PlatformBackend>, config: CoreConfig) -> i32 {
    let mut slot = REGISTRY.write();
    if slot.is_some() {
        debug!("boundary already initialized");
        return Status::Ok.code();
    }

    let registry = Registry::new(backend, config);
    match registry.initialize() {
        Ok(()) => {
            *slot = Some(Arc::new(registry));
            Status::Ok.code()
        }
        Err(err) => {
            error!(error = %err, "camera core failed to initialize");
            Status::from(&err).code()
        }
    }
}

/// Stop every capture and drop the registry. `initialize` may be called again.
pub fn shutdown() -> i32 {
    let taken = REGISTRY.write().take();
    if let Some(registry) = taken {
        registry.shutdown();
    }
    Status::Ok.code()
}

/// 0 when granted, -1 when denied, -2 when undetermined, or a negative status
/// code when the core is not initialized.
pub fn has_authorization() -> i32 {
    match registry() {
        Ok(registry) => match registry.has_authorization() {
            PermissionState::Granted => 0,
            PermissionState::Denied => -1,
            PermissionState::Undetermined => -2,
        },
        Err(err) => failure("has_authorization", &err),
    }
}

/// Fire the OS permission request. Poll [`has_authorization`] for the result.
pub fn request_authorization() {
    match registry() {
        Ok(registry) => registry.request_authorization(),
        Err(err) => warn!(error = %err, "authorization requested before initialize"),
    }
}

/// Number of devices, or a negative status code.
pub fn device_count() -> i32 {
    let count = registry().and_then(|r| r.device_count());
    value_of(
        "device_count",
        count.map(|c| u32::try_from(c).unwrap_or(u32::MAX)),
    )
}

/// Write the name of device `index` into `buf`.
pub fn device_name(index: i32, buf: &mut [u8]) -> usize {
    let name = device_string(index, |d| d.name().to_owned());
    string_of("device_name", name, buf)
}

/// Write the unique id of device `index` into `buf`.
pub fn device_unique_id(index: i32, buf: &mut [u8]) -> usize {
    let id = device_string(index, |d| d.unique_id().to_owned());
    string_of("device_unique_id", id, buf)
}

/// Write the model id of device `index` into `buf`.
pub fn device_model_id(index: i32, buf: &mut [u8]) -> usize {
    let model = device_string(index, |d| d.model_id().to_owned());
    string_of("device_model_id", model, buf)
}

fn device_string<F>(device_index: i32, field: F) -> Result<String>
where
    F: FnOnce(&crate::catalog::Device) -> String,
{
    let registry = registry()?;
    let device = registry.device(to_index(device_index)?)?;
    Ok(field(&device))
}

/// Number of formats of device `index`, or a negative status code.
pub fn device_format_count(index: i32) -> i32 {
    let count = registry().and_then(|r| r.format_count(to_index(index)?));
    value_of(
        "device_format_count",
        count.map(|c| u32::try_from(c).unwrap_or(u32::MAX)),
    )
}

fn format_field<F>(device_index: i32, format_index: i32, field: F) -> i32
where
    F: FnOnce(&FormatDescriptor) -> u32,
{
    match lookup_format(device_index, format_index) {
        Ok(format) => i32::try_from(field(&format)).unwrap_or(i32::MAX),
        Err(status) => status.code(),
    }
}

/// Width of format `format_index` of device `index`.
pub fn device_format_width(index: i32, format_index: i32) -> i32 {
    format_field(index, format_index, |f| f.width)
}

/// Height of format `format_index` of device `index`.
pub fn device_format_height(index: i32, format_index: i32) -> i32 {
    format_field(index, format_index, |f| f.height)
}

/// Frame rate of format `format_index` of device `index`.
pub fn device_format_frame_rate(index: i32, format_index: i32) -> i32 {
    format_field(index, format_index, |f| f.frame_rate)
}

/// Write the pixel format tag (`"MJPEG"`, `"YUYV"`, ...) of format
/// `format_index` of device `index` into `buf`.
pub fn device_format_type(index: i32, format_index: i32, buf: &mut [u8]) -> usize {
    match lookup_format(index, format_index) {
        Ok(format) => copy_str(format.pixel_format.as_str(), buf),
        Err(status) => {
            debug!(code = status.code(), "device_format_type failed");
            copy_str("", buf);
            0
        }
    }
}

/// Start capturing `width` x `height` on device `index`.
pub fn start_capture(index: i32, width: i32, height: i32) -> i32 {
    let result = registry()
        .and_then(|r| r.start_capture(to_index(index)?, dimension(width)?, dimension(height)?));
    status_of("start_capture", result)
}

/// 0 when a frame can be grabbed, [`Status::NoFrameYet`] when not yet, or
/// another negative status code. Never blocks.
pub fn has_first_frame(index: i32) -> i32 {
    match registry().and_then(|r| r.poll_frame(to_index(index)?)) {
        Ok(PollStatus::FrameReady) => Status::Ok.code(),
        Ok(PollStatus::NoFrameYet) => Status::NoFrameYet.code(),
        Err(err) => failure("has_first_frame", &err),
    }
}

/// Width of frames delivered by the capture on device `index`.
pub fn frame_width(index: i32) -> i32 {
    let layout = registry().and_then(|r| r.frame_layout(to_index(index)?));
    value_of("frame_width", layout.map(|l| l.width))
}

/// Height of frames delivered by the capture on device `index`.
pub fn frame_height(index: i32) -> i32 {
    let layout = registry().and_then(|r| r.frame_layout(to_index(index)?));
    value_of("frame_height", layout.map(|l| l.height))
}

/// Row stride of frames delivered by the capture on device `index`.
pub fn frame_bytes_per_row(index: i32) -> i32 {
    let layout = registry().and_then(|r| r.frame_layout(to_index(index)?));
    value_of("frame_bytes_per_row", layout.map(|l| l.bytes_per_row))
}

/// Write the pixel layout tag of frames delivered by the capture on device
/// `index` into `buf`. MJPEG captures report `"RGB24"`.
pub fn frame_pixel_format(index: i32, buf: &mut [u8]) -> usize {
    let tag = registry()
        .and_then(|r| r.frame_layout(to_index(index)?))
        .map(|l| l.pixel_format.as_str().to_owned());
    string_of("frame_pixel_format", tag, buf)
}

/// Grab a frame from device `index` into `out`.
///
/// `out` must hold `frame_height * frame_bytes_per_row` bytes.
pub fn grab_frame(index: i32, out: &mut [u8]) -> i32 {
    if out.is_empty() {
        return Status::BufferNull.code();
    }
    let result = registry().and_then(|r| r.grab_frame(to_index(index)?, out).map(|_| ()));
    status_of("grab_frame", result)
}

/// Stop the capture on device `index`.
pub fn stop_capture(index: i32) -> i32 {
    let result = registry().and_then(|r| r.stop_capture(to_index(index)?));
    status_of("stop_capture", result)
}
