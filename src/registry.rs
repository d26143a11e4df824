//! Handle table behind the integer-indexed boundary.
//!
//! Devices are addressed by their index in the current catalog. An index is
//! valid until the next [`Registry::refresh`]; sessions are keyed by the
//! device's unique id and therefore survive a refresh as long as the device
//! is still present. Lookups take shared locks; refresh and session creation
//! take exclusive ones.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::catalog::{Device, DeviceCatalog};
use crate::config::CoreConfig;
use crate::error::{CameraError, Result};
use crate::frame::{FrameBuffer, FrameLayout};
use crate::permission::PermissionGate;
use crate::session::{CaptureSession, PollStatus, SessionState};
use crate::traits::{FormatDescriptor, PermissionState, PlatformBackend};

type SharedSession = Arc<Mutex<CaptureSession>>;

/// Owns the catalog and every capture session of one backend.
pub struct Registry {
    backend: Arc<dyn PlatformBackend>,
    gate: PermissionGate,
    config: CoreConfig,
    catalog: RwLock<DeviceCatalog>,
    sessions: RwLock<HashMap<String, SharedSession>>,
    starting: Mutex<HashSet<String>>,
}

/// Claim on a device while its new session is being started.
struct StartClaim<'a> {
    starting: &'a Mutex<HashSet<String>>,
    unique_id: String,
}

impl Drop for StartClaim<'_> {
    fn drop(&mut self) {
        self.starting.lock().remove(&self.unique_id);
    }
}

impl Registry {
    /// Create an uninitialized registry over `backend`.
    pub fn new(backend: Arc<dyn PlatformBackend>, config: CoreConfig) -> Self {
        Self {
            gate: PermissionGate::new(Arc::clone(&backend)),
            backend,
            config,
            catalog: RwLock::new(DeviceCatalog::new()),
            sessions: RwLock::new(HashMap::new()),
            starting: Mutex::new(HashSet::new()),
        }
    }

    /// Configuration in use.
    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Permission gate of the backend.
    pub const fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    /// Build the catalog on first use. Later calls do nothing.
    pub fn initialize(&self) -> Result<()> {
        let mut catalog = self.catalog.write();
        if catalog.generation() > 0 {
            debug!("registry already initialized");
            return Ok(());
        }
        catalog.refresh(self.backend.as_ref())
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.catalog.read().generation() > 0
    }

    /// Rebuild the catalog. Device indices handed out before are invalid
    /// afterwards; sessions of devices that disappeared are stopped.
    pub fn refresh(&self) -> Result<()> {
        let mut catalog = self.catalog.write();
        catalog.refresh(self.backend.as_ref())?;

        let vanished: Vec<(String, SharedSession)> = {
            let mut sessions = self.sessions.write();
            let gone: Vec<String> = sessions
                .keys()
                .filter(|unique_id| catalog.find_by_unique_id(unique_id).is_none())
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|unique_id| sessions.remove_entry(&unique_id))
                .collect()
        };
        drop(catalog);

        for (unique_id, session) in vanished {
            warn!(device = %unique_id, "device disappeared, dropping its session");
            if let Err(err) = session.lock().stop() {
                warn!(device = %unique_id, error = %err, "teardown of vanished device");
            }
        }
        Ok(())
    }

    /// Current authorization state.
    pub fn has_authorization(&self) -> PermissionState {
        self.gate.has_authorization()
    }

    /// Fire the OS permission request.
    pub fn request_authorization(&self) {
        self.gate.request_authorization();
    }

    fn catalog(&self) -> Result<RwLockReadGuard<'_, DeviceCatalog>> {
        let catalog = self.catalog.read();
        if catalog.generation() == 0 {
            return Err(CameraError::NotInitialized);
        }
        Ok(catalog)
    }

    /// Number of cataloged devices.
    pub fn device_count(&self) -> Result<usize> {
        Ok(self.catalog()?.device_count())
    }

    /// Device at `index`.
    pub fn device(&self, index: usize) -> Result<Arc<Device>> {
        self.catalog()?.device(index).cloned()
    }

    /// Number of formats of device `index`.
    pub fn format_count(&self, index: usize) -> Result<usize> {
        self.catalog()?.format_count(index)
    }

    /// Format `format_index` of device `index`.
    pub fn format(&self, index: usize, format_index: usize) -> Result<FormatDescriptor> {
        self.catalog()?.format(index, format_index).copied()
    }

    /// Start capturing `width` x `height` on device `index`.
    ///
    /// The format is chosen by [`CoreConfig::best_match`].
    pub fn start_capture(&self, index: usize, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(CameraError::InvalidArgument(format!(
                "capture size {width}x{height}"
            )));
        }
        let device = self.device(index)?;
        let (format_index, format) = self
            .config
            .best_match(device.formats(), width, height)
            .ok_or_else(|| {
                CameraError::InvalidFormat(format!(
                    "{} has no {width}x{height} format",
                    device.name()
                ))
            })?;
        debug!(device = %device.name(), format_index, %format, "best-match format");
        self.start_session(device, format)
    }

    /// Start capturing on device `index` with an explicit catalog format.
    pub fn start_capture_with_format(&self, index: usize, format_index: usize) -> Result<()> {
        let device = self.device(index)?;
        let format = *device
            .formats()
            .get(format_index)
            .ok_or(CameraError::IndexOutOfRange {
                index: format_index,
                count: device.formats().len(),
            })?;
        self.start_session(device, format)
    }

    // The backend start runs without the session table lock so lookups on
    // other devices stay non-blocking; the claim keeps concurrent starts on
    // the same device out.
    fn start_session(&self, device: Arc<Device>, format: FormatDescriptor) -> Result<()> {
        let _claim = self.claim(&device)?;

        let existing = self.sessions.read().get(device.unique_id()).cloned();
        if let Some(existing) = existing {
            let state = existing.lock().state();
            if matches!(state, SessionState::Started | SessionState::Configuring) {
                return Err(CameraError::DeviceBusy(device.name().to_owned()));
            }
        }

        let mut session = CaptureSession::new(Arc::clone(&device), &self.config);
        session.start(self.backend.as_ref(), &self.gate, &format)?;
        self.sessions
            .write()
            .insert(device.unique_id().to_owned(), Arc::new(Mutex::new(session)));
        Ok(())
    }

    fn claim(&self, device: &Device) -> Result<StartClaim<'_>> {
        let unique_id = device.unique_id().to_owned();
        if !self.starting.lock().insert(unique_id.clone()) {
            debug!(device = %device.name(), "start already in progress");
            return Err(CameraError::DeviceBusy(device.name().to_owned()));
        }
        Ok(StartClaim {
            starting: &self.starting,
            unique_id,
        })
    }

    fn session(&self, index: usize) -> Result<SharedSession> {
        let device = self.device(index)?;
        self.sessions
            .read()
            .get(device.unique_id())
            .cloned()
            .ok_or(CameraError::SessionNotStarted(index))
    }

    /// State of the session on device `index`.
    pub fn session_state(&self, index: usize) -> Result<SessionState> {
        Ok(self.session(index)?.lock().state())
    }

    /// Non-blocking frame check on device `index`.
    pub fn poll_frame(&self, index: usize) -> Result<PollStatus> {
        self.session(index)?.lock().poll_frame()
    }

    /// Layout of frames the running capture on device `index` delivers.
    pub fn frame_layout(&self, index: usize) -> Result<FrameLayout> {
        let session = self.session(index)?;
        let session = session.lock();
        match (session.state(), session.layout()) {
            (SessionState::Started, Some(layout)) => Ok(layout),
            (state, _) => Err(CameraError::InvalidState {
                state,
                operation: "read frame layout",
            }),
        }
    }

    /// Grab a frame from device `index` into `out`.
    pub fn grab_frame(&self, index: usize, out: &mut [u8]) -> Result<FrameLayout> {
        self.session(index)?.lock().grab_frame_into(out)
    }

    /// Snapshot of the last frame grabbed on device `index`.
    pub fn latest_frame(&self, index: usize) -> Result<Option<FrameBuffer>> {
        Ok(self.session(index)?.lock().latest_frame().cloned())
    }

    /// Stop the capture on device `index`. Stopping twice is not an error.
    pub fn stop_capture(&self, index: usize) -> Result<()> {
        self.session(index)?.lock().stop()
    }

    /// Stop and forget every session.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.sessions.write().drain().collect();
        for (unique_id, session) in drained {
            if let Err(err) = session.lock().stop() {
                warn!(device = %unique_id, error = %err, "teardown during shutdown");
            }
        }
        info!(backend = self.backend.name(), "registry shut down");
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("sessions", &self.sessions.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{SyntheticBackend, SyntheticDevice};
    use crate::traits::PixelFormat;
    use std::thread;
    use std::time::{Duration, Instant};

    fn registry(backend: &SyntheticBackend) -> Registry {
        let registry = Registry::new(Arc::new(backend.clone()), CoreConfig::default());
        registry.initialize().expect("initialize should succeed");
        registry
    }

    #[test]
    fn test_requires_initialize() {
        let registry = Registry::new(
            Arc::new(SyntheticBackend::with_default_devices()),
            CoreConfig::default(),
        );
        assert!(matches!(
            registry.device_count(),
            Err(CameraError::NotInitialized)
        ));
        assert!(!registry.is_initialized());
    }

    #[test]
    fn test_initialize_twice_is_noop() {
        let backend = SyntheticBackend::with_default_devices();
        let registry = registry(&backend);

        backend.set_reachable(false);
        registry.initialize().expect("second initialize is a no-op");
        assert_eq!(registry.device_count().expect("count"), 2);
    }

    #[test]
    fn test_start_capture_picks_best_match() {
        let backend = SyntheticBackend::with_default_devices();
        let registry = registry(&backend);

        registry.start_capture(1, 1280, 720).expect("start should succeed");
        let session = registry.session(1).expect("session exists");
        let format = session.lock().format().expect("format chosen");
        assert_eq!(format, FormatDescriptor::new(1280, 720, 60, PixelFormat::Yuyv));
    }

    #[test]
    fn test_start_capture_unknown_size() {
        let backend = SyntheticBackend::with_default_devices();
        let registry = registry(&backend);

        assert!(matches!(
            registry.start_capture(0, 800, 600),
            Err(CameraError::InvalidFormat(_))
        ));
        assert!(matches!(
            registry.start_capture(0, 0, 600),
            Err(CameraError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.start_capture(5, 640, 480),
            Err(CameraError::IndexOutOfRange { index: 5, count: 2 })
        ));
    }

    #[test]
    fn test_second_start_is_busy() {
        let backend = SyntheticBackend::with_default_devices();
        let registry = registry(&backend);

        registry.start_capture(0, 640, 480).expect("start should succeed");
        assert!(matches!(
            registry.start_capture(0, 1920, 1080),
            Err(CameraError::DeviceBusy(_))
        ));
        assert_eq!(
            registry.session_state(0).expect("state"),
            SessionState::Started
        );
    }

    #[test]
    fn test_slow_start_does_not_block_other_devices() {
        let backend = SyntheticBackend::with_default_devices();
        let registry = registry(&backend);
        registry.start_capture(0, 640, 480).expect("start should succeed");
        assert_eq!(
            registry.poll_frame(0).expect("poll"),
            PollStatus::FrameReady
        );

        backend.set_start_delay(Duration::from_millis(800));
        thread::scope(|scope| {
            let slow = scope.spawn(|| registry.start_capture(1, 1280, 720));

            let deadline = Instant::now() + Duration::from_secs(5);
            while !registry
                .starting
                .lock()
                .contains("synthetic:synthetic-ir-camera")
            {
                assert!(Instant::now() < deadline, "slow start never began");
                thread::yield_now();
            }

            let polled_at = Instant::now();
            assert_eq!(
                registry.poll_frame(0).expect("poll"),
                PollStatus::FrameReady
            );
            assert_eq!(registry.device_count().expect("count"), 2);
            assert!(
                polled_at.elapsed() < Duration::from_millis(200),
                "lookups waited {:?} on an unrelated start",
                polled_at.elapsed()
            );

            assert!(matches!(
                registry.start_capture(1, 1280, 720),
                Err(CameraError::DeviceBusy(_))
            ));
            assert!(matches!(
                registry.poll_frame(1),
                Err(CameraError::SessionNotStarted(1))
            ));

            slow.join()
                .expect("start thread should not panic")
                .expect("slow start should succeed");
        });

        assert_eq!(
            registry.session_state(1).expect("state"),
            SessionState::Started
        );
        assert!(registry.starting.lock().is_empty());
    }

    #[test]
    fn test_failed_start_releases_claim() {
        let backend = SyntheticBackend::with_default_devices()
            .with_permission(PermissionState::Denied, PermissionState::Denied);
        let registry = registry(&backend);

        assert!(matches!(
            registry.start_capture(0, 640, 480),
            Err(CameraError::PermissionDenied)
        ));
        assert!(registry.starting.lock().is_empty());

        backend.set_permission(PermissionState::Granted);
        registry.start_capture(0, 640, 480).expect("start after grant");
    }

    #[test]
    fn test_stop_without_session() {
        let backend = SyntheticBackend::with_default_devices();
        let registry = registry(&backend);

        assert!(matches!(
            registry.stop_capture(0),
            Err(CameraError::SessionNotStarted(0))
        ));
    }

    #[test]
    fn test_failed_session_is_replaced() {
        let backend = SyntheticBackend::with_default_devices();
        let registry = registry(&backend);

        backend.set_permission(PermissionState::Denied);
        assert!(matches!(
            registry.start_capture(0, 640, 480),
            Err(CameraError::PermissionDenied)
        ));
        assert!(matches!(
            registry.session_state(0),
            Err(CameraError::SessionNotStarted(0))
        ));

        backend.set_permission(PermissionState::Granted);
        registry.start_capture(0, 640, 480).expect("start should succeed");
    }

    #[test]
    fn test_frame_layout_requires_running_capture() {
        let backend = SyntheticBackend::with_default_devices().with_row_alignment(1024);
        let registry = registry(&backend);

        registry.start_capture(0, 640, 480).expect("start should succeed");
        let layout = registry.frame_layout(0).expect("layout");
        assert_eq!(layout.bytes_per_row, 2048);

        registry.stop_capture(0).expect("stop should succeed");
        assert!(matches!(
            registry.frame_layout(0),
            Err(CameraError::InvalidState {
                state: SessionState::Stopped,
                ..
            })
        ));
    }

    #[test]
    fn test_refresh_drops_vanished_sessions() {
        let backend = SyntheticBackend::with_default_devices()
            .with_device(SyntheticDevice::new("Spare").with_format(320, 240, 30, PixelFormat::Gray));
        let registry = registry(&backend);

        registry.start_capture(2, 320, 240).expect("start should succeed");
        registry.start_capture(0, 640, 480).expect("start should succeed");
        let spare = registry.device(2).expect("device");
        backend.disconnect(spare.unique_id());

        registry.refresh().expect("refresh should succeed");
        assert_eq!(registry.device_count().expect("count"), 2);
        assert_eq!(backend.open_handle_count(), 1);
        assert_eq!(
            registry.session_state(0).expect("state"),
            SessionState::Started
        );
    }

    #[test]
    fn test_shutdown_stops_everything() {
        let backend = SyntheticBackend::with_default_devices();
        let registry = registry(&backend);

        registry.start_capture(0, 640, 480).expect("start should succeed");
        registry.start_capture(1, 640, 480).expect("start should succeed");
        assert_eq!(backend.open_handle_count(), 2);

        registry.shutdown();
        assert_eq!(backend.open_handle_count(), 0);
    }
}
