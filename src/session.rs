//! Capture session lifecycle.
//!
//! ```text
//! Idle ──start──▶ Configuring ──▶ Started ──stop──▶ Stopped
//!                      │              │                │
//!                      ▼              ▼                │
//!                    Failed ◀──── fatal fault     start (restart)
//! ```
//!
//! A session is driven by one owner at a time. It spawns nothing: frames are
//! pulled by the caller through [`CaptureSession::poll_frame`] and
//! [`CaptureSession::grab_frame`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::catalog::{Device, DeviceLease};
use crate::config::CoreConfig;
use crate::error::{CameraError, Result};
use crate::frame::{FrameBuffer, FrameLayout};
use crate::permission::PermissionGate;
use crate::traits::{BackendCapture, FormatDescriptor, PlatformBackend};

/// Lifecycle state of a [`CaptureSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, never started.
    Idle,
    /// Negotiating with the backend.
    Configuring,
    /// Streaming.
    Started,
    /// Stopped; may be started again.
    Stopped,
    /// Hit an unrecoverable error; build a new session.
    Failed,
}

/// Result of a non-blocking frame check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Nothing to grab yet.
    NoFrameYet,
    /// A frame can be grabbed.
    FrameReady,
}

// Field order matters: the backend handle is dropped before the lease.
struct ActiveCapture {
    capture: Box<dyn BackendCapture>,
    _lease: DeviceLease,
}

/// One capture on one device.
pub struct CaptureSession {
    device: Arc<Device>,
    grab_timeout: Duration,
    state: SessionState,
    format: Option<FormatDescriptor>,
    layout: Option<FrameLayout>,
    active: Option<ActiveCapture>,
    frame_reported: bool,
    latest: Option<FrameBuffer>,
}

impl CaptureSession {
    /// Create an idle session bound to `device`.
    pub fn new(device: Arc<Device>, config: &CoreConfig) -> Self {
        Self {
            device,
            grab_timeout: config.grab_timeout,
            state: SessionState::Idle,
            format: None,
            layout: None,
            active: None,
            frame_reported: false,
            latest: None,
        }
    }

    /// Current state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Device the session is bound to.
    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Format of the current or last capture.
    pub const fn format(&self) -> Option<FormatDescriptor> {
        self.format
    }

    /// Layout negotiated for the current or last capture.
    pub const fn layout(&self) -> Option<FrameLayout> {
        self.layout
    }

    /// Most recently grabbed frame of the running capture.
    pub const fn latest_frame(&self) -> Option<&FrameBuffer> {
        self.latest.as_ref()
    }

    /// Start capturing in `format`, which must be one of the device's formats.
    ///
    /// Allowed from `Idle` and `Stopped`. An unknown format is rejected before
    /// anything else happens and leaves the state unchanged; every later
    /// failure moves the session to `Failed`.
    pub fn start(
        &mut self,
        backend: &dyn PlatformBackend,
        gate: &PermissionGate,
        format: &FormatDescriptor,
    ) -> Result<()> {
        match self.state {
            SessionState::Idle | SessionState::Stopped => {}
            state => {
                return Err(CameraError::InvalidState {
                    state,
                    operation: "start",
                })
            }
        }
        if !self.device.supports(format) {
            return Err(CameraError::InvalidFormat(format!(
                "{format} is not offered by {}",
                self.device.name()
            )));
        }

        self.state = SessionState::Configuring;
        debug!(device = %self.device.name(), %format, "configuring capture");

        match self.open_and_configure(backend, gate, format) {
            Ok((active, layout)) => {
                self.active = Some(active);
                self.format = Some(*format);
                self.layout = Some(layout);
                self.frame_reported = false;
                self.latest = None;
                self.state = SessionState::Started;
                info!(
                    device = %self.device.name(),
                    %format,
                    bytes_per_row = layout.bytes_per_row,
                    "capture started"
                );
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Failed;
                warn!(device = %self.device.name(), error = %err, "capture failed to start");
                Err(err)
            }
        }
    }

    fn open_and_configure(
        &self,
        backend: &dyn PlatformBackend,
        gate: &PermissionGate,
        format: &FormatDescriptor,
    ) -> Result<(ActiveCapture, FrameLayout)> {
        gate.check_for_capture()?;

        let lease = self
            .device
            .try_lease()
            .ok_or_else(|| CameraError::DeviceBusy(self.device.name().to_owned()))?;
        let mut capture = backend.open(self.device.descriptor())?;

        match configure_and_start(capture.as_mut(), format) {
            Ok(layout) => Ok((
                ActiveCapture {
                    capture,
                    _lease: lease,
                },
                layout,
            )),
            Err(err) => {
                if let Err(stop_err) = capture.stop() {
                    warn!(device = %self.device.name(), error = %stop_err, "teardown after failed start");
                }
                Err(err)
            }
        }
    }

    /// Check, without blocking, whether a frame is ready.
    pub fn poll_frame(&mut self) -> Result<PollStatus> {
        let active = self.started("poll")?;
        match active.capture.frame_ready() {
            Ok(true) => {
                self.frame_reported = true;
                Ok(PollStatus::FrameReady)
            }
            Ok(false) => Ok(PollStatus::NoFrameYet),
            Err(err) => Err(self.fault(err)),
        }
    }

    /// Pull a frame into the session-owned buffer, replacing the previous one.
    ///
    /// Blocks up to the configured grab timeout.
    pub fn grab_frame(&mut self) -> Result<&FrameBuffer> {
        self.started("grab")?;
        if !self.frame_reported {
            return Err(CameraError::NoFrameAvailable);
        }
        let Some(layout) = self.layout else {
            return Err(CameraError::Backend("capture has no negotiated layout".to_owned()));
        };

        let timeout = self.grab_timeout;
        let pulled = self.started("grab")?.capture.pull_frame(timeout);
        let raw = match pulled {
            Ok(raw) => raw,
            Err(err) => return Err(self.fault(err)),
        };
        let frame = FrameBuffer::new(layout, raw.data, raw.timestamp, raw.sequence)?;
        Ok(self.latest.insert(frame))
    }

    /// Pull a frame and copy it into `out`.
    ///
    /// `out` must hold `height * bytes_per_row` bytes; a smaller buffer fails
    /// before the backend is touched and is left unmodified.
    pub fn grab_frame_into(&mut self, out: &mut [u8]) -> Result<FrameLayout> {
        self.started("grab")?;
        let Some(layout) = self.layout else {
            return Err(CameraError::Backend("capture has no negotiated layout".to_owned()));
        };
        if out.len() < layout.frame_len() {
            return Err(CameraError::BufferTooSmall {
                required: layout.frame_len(),
                capacity: out.len(),
            });
        }

        let frame = self.grab_frame()?;
        frame.copy_to(out)?;
        Ok(frame.layout())
    }

    /// Stop capturing and release the device.
    ///
    /// The backend handle is released even when teardown reports an error;
    /// that error is returned afterwards. Stopping a `Stopped` or `Failed`
    /// session does nothing.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            SessionState::Stopped | SessionState::Failed => Ok(()),
            SessionState::Idle => Err(CameraError::InvalidState {
                state: SessionState::Idle,
                operation: "stop",
            }),
            SessionState::Configuring | SessionState::Started => {
                let result = self.release();
                self.state = SessionState::Stopped;
                match &result {
                    Ok(()) => info!(device = %self.device.name(), "capture stopped"),
                    Err(err) => {
                        warn!(device = %self.device.name(), error = %err, "capture stopped with teardown error");
                    }
                }
                result
            }
        }
    }

    fn started(&mut self, operation: &'static str) -> Result<&mut ActiveCapture> {
        match (self.state, self.active.as_mut()) {
            (SessionState::Started, Some(active)) => Ok(active),
            (state, _) => Err(CameraError::InvalidState { state, operation }),
        }
    }

    fn release(&mut self) -> Result<()> {
        self.frame_reported = false;
        self.latest = None;
        self.active
            .take()
            .map_or(Ok(()), |mut active| active.capture.stop())
    }

    fn fault(&mut self, err: CameraError) -> CameraError {
        if err.is_fatal() {
            warn!(device = %self.device.name(), error = %err, "fatal capture fault");
            if let Err(stop_err) = self.release() {
                debug!(error = %stop_err, "teardown after fault");
            }
            self.state = SessionState::Failed;
        }
        err
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.active.is_some() {
            if let Err(err) = self.release() {
                warn!(device = %self.device.name(), error = %err, "teardown on drop");
            }
        }
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("device", &self.device.name())
            .field("state", &self.state)
            .field("format", &self.format)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

fn configure_and_start(capture: &mut dyn BackendCapture, format: &FormatDescriptor) -> Result<FrameLayout> {
    let layout = capture.configure(format).map_err(|err| match err {
        CameraError::Backend(msg) => CameraError::BackendRejected(msg),
        other => other,
    })?;
    if layout.width != format.width || layout.height != format.height {
        return Err(CameraError::BackendRejected(format!(
            "requested {}x{}, backend negotiated {}x{}",
            format.width, format.height, layout.width, layout.height
        )));
    }
    layout.validate()?;
    capture.start()?;
    Ok(layout)
}
