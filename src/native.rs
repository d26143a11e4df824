//! Build-time selection of the OS backend.

use std::sync::Arc;

use crate::config::CoreConfig;
use crate::error::{CameraError, Result};
use crate::traits::{BackendCapture, DeviceDescriptor, FormatDescriptor, PermissionState, PlatformBackend};

/// Backend for the target OS.
#[cfg(target_os = "linux")]
pub fn native_backend(config: &CoreConfig) -> Arc<dyn PlatformBackend> {
    Arc::new(crate::v4l2::V4l2Backend::new(config))
}

/// Backend for the target OS.
#[cfg(not(target_os = "linux"))]
pub fn native_backend(_config: &CoreConfig) -> Arc<dyn PlatformBackend> {
    Arc::new(UnsupportedBackend)
}

/// Stand-in for targets without a camera backend. Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedBackend;

impl UnsupportedBackend {
    fn unavailable() -> CameraError {
        CameraError::BackendUnavailable(format!(
            "no camera backend for {}",
            std::env::consts::OS
        ))
    }
}

impl PlatformBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        Err(Self::unavailable())
    }

    fn formats(&self, _device: &DeviceDescriptor) -> Result<Vec<FormatDescriptor>> {
        Err(Self::unavailable())
    }

    fn open(&self, _device: &DeviceDescriptor) -> Result<Box<dyn BackendCapture>> {
        Err(Self::unavailable())
    }

    fn query_permission(&self) -> PermissionState {
        PermissionState::Undetermined
    }

    fn request_permission(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_backend_fails_enumeration() {
        assert!(matches!(
            UnsupportedBackend.enumerate(),
            Err(CameraError::BackendUnavailable(_))
        ));
        assert_eq!(
            UnsupportedBackend.query_permission(),
            PermissionState::Undetermined
        );
    }

    #[test]
    fn test_native_backend_has_a_name() {
        let backend = native_backend(&CoreConfig::default());
        assert!(!backend.name().is_empty());
    }
}
