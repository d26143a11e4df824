//! Camera authorization gate.
//!
//! A request and the state observed afterwards are not linked: the OS may
//! resolve the prompt at any later point, so callers poll
//! [`PermissionGate::has_authorization`] after [`PermissionGate::request_authorization`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{CameraError, Result};
use crate::traits::{PermissionState, PlatformBackend};

/// Queries and requests OS camera authorization.
#[derive(Clone)]
pub struct PermissionGate {
    backend: Arc<dyn PlatformBackend>,
    requested: Arc<AtomicBool>,
}

impl PermissionGate {
    /// Gate over `backend`'s permission model.
    pub fn new(backend: Arc<dyn PlatformBackend>) -> Self {
        Self {
            backend,
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current state. Never prompts.
    pub fn has_authorization(&self) -> PermissionState {
        self.backend.query_permission()
    }

    /// Trigger the OS permission flow; returns before it resolves.
    pub fn request_authorization(&self) {
        info!(backend = self.backend.name(), "requesting camera authorization");
        self.requested.store(true, Ordering::Release);
        self.backend.request_permission();
    }

    /// Whether a request was fired through this gate.
    pub fn request_issued(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Decide whether a capture may proceed.
    ///
    /// `Undetermined` is allowed through; the backend may prompt on open.
    pub fn check_for_capture(&self) -> Result<PermissionState> {
        match self.has_authorization() {
            PermissionState::Denied => Err(CameraError::PermissionDenied),
            PermissionState::Undetermined => {
                warn!(
                    requested = self.request_issued(),
                    "camera authorization undetermined, starting anyway"
                );
                Ok(PermissionState::Undetermined)
            }
            PermissionState::Granted => Ok(PermissionState::Granted),
        }
    }
}

impl std::fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGate")
            .field("backend", &self.backend.name())
            .field("requested", &self.request_issued())
            .finish()
    }
}
