//! cam-capture: a camera capture core with a status-code boundary
//!
//! The core discovers video devices, lists their formats, runs capture
//! sessions with an explicit lifecycle and hands out frames with truthful
//! stride information. OS camera access sits behind [`PlatformBackend`]; the
//! [`SyntheticBackend`] stands in for hardware in tests, and the V4L2 backend
//! serves Linux.
//!
//! Hosts either drive a [`Registry`] directly or go through the integer
//! status-code functions in [`boundary`].

pub mod boundary;
pub mod catalog;
pub mod config;
pub mod error;
pub mod frame;
pub mod mock;
pub mod native;
pub mod permission;
pub mod registry;
pub mod session;
pub mod traits;
#[cfg(target_os = "linux")]
pub mod v4l2;
pub mod validation;

pub use boundary::{Status, StatusCategory};
pub use catalog::{Device, DeviceCatalog};
pub use config::CoreConfig;
pub use error::{CameraError, Result};
pub use frame::{FrameBuffer, FrameLayout};
pub use mock::{SyntheticBackend, SyntheticDevice, TestPattern};
pub use native::{native_backend, UnsupportedBackend};
pub use permission::PermissionGate;
pub use registry::Registry;
pub use session::{CaptureSession, PollStatus, SessionState};
pub use traits::{
    BackendCapture, BackendDeviceId, DeviceDescriptor, DeviceInfo, FormatDescriptor, FourCC,
    PermissionState, PixelFormat, PlatformBackend, RawFrame,
};
#[cfg(target_os = "linux")]
pub use v4l2::V4l2Backend;
