//! Error type shared by the catalog, sessions and backends.

use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// Error type for camera operations.
#[derive(Error, Debug)]
pub enum CameraError {
    /// The registry was used before `initialize`.
    #[error("Camera core not initialized")]
    NotInitialized,

    /// The OS camera subsystem cannot be reached.
    #[error("Camera backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend returned an unexpected enumeration response.
    #[error("Device enumeration failed: {0}")]
    EnumerationFailed(String),

    /// A device or format index outside the catalog.
    #[error("Index {index} out of range (count {count})")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of entries available.
        count: usize,
    },

    /// Format is not part of the device's catalog entry, or no format matches.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Malformed caller input (negative index, zero dimension, empty buffer).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Camera authorization was denied by the OS.
    #[error("Camera permission denied")]
    PermissionDenied,

    /// Device disconnected or not found by the backend.
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Device already has an open capture.
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Backend refused the requested configuration.
    #[error("Backend rejected configuration: {0}")]
    BackendRejected(String),

    /// Opaque native failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The backend's frame stream ended and cannot resume.
    #[error("Capture stream ended: {0}")]
    StreamEnded(String),

    /// `grab_frame` was called before a frame was reported ready.
    #[error("No frame available")]
    NoFrameAvailable,

    /// No frame arrived within the grab timeout.
    #[error("Timed out after {0:?} waiting for a frame")]
    GrabTimeout(Duration),

    /// Caller buffer cannot hold one frame.
    #[error("Buffer too small: {required} bytes required, {capacity} available")]
    BufferTooSmall {
        /// Bytes needed (`height * bytes_per_row`).
        required: usize,
        /// Bytes offered by the caller.
        capacity: usize,
    },

    /// Operation not allowed in the session's current state.
    #[error("Cannot {operation} while session is {state:?}")]
    InvalidState {
        /// State the session was in.
        state: SessionState,
        /// Rejected operation.
        operation: &'static str,
    },

    /// A delivered frame does not look the way it should.
    #[error("Frame validation failed: {0}")]
    Validation(String),

    /// No capture was ever started on the device.
    #[error("No capture session on device {0}")]
    SessionNotStarted(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Whether this error ends the session that observed it.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceUnavailable(_) | Self::StreamEnded(_))
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;
