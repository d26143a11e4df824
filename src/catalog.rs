//! Device and format catalog.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CameraError, Result};
use crate::traits::{BackendDeviceId, DeviceDescriptor, DeviceInfo, FormatDescriptor, PlatformBackend};

/// Unique ids of devices that currently have a started session.
///
/// Shared by every catalog generation so a rebuilt catalog still sees
/// captures opened through the previous one.
#[derive(Debug, Default)]
pub struct LeaseTable {
    held: Mutex<HashSet<String>>,
}

impl LeaseTable {
    fn acquire(self: &Arc<Self>, unique_id: &str) -> Option<DeviceLease> {
        self.held.lock().insert(unique_id.to_owned()).then(|| DeviceLease {
            table: Arc::clone(self),
            unique_id: unique_id.to_owned(),
        })
    }

    /// Whether a session holds the device.
    pub fn is_held(&self, unique_id: &str) -> bool {
        self.held.lock().contains(unique_id)
    }
}

/// Exclusive claim on a device, released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    table: Arc<LeaseTable>,
    unique_id: String,
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.table.held.lock().remove(&self.unique_id);
    }
}

/// A camera as seen at the last catalog refresh.
#[derive(Debug)]
pub struct Device {
    descriptor: DeviceDescriptor,
    formats: Vec<FormatDescriptor>,
    formats_incomplete: bool,
    leases: Arc<LeaseTable>,
}

impl Device {
    /// Identity strings.
    pub const fn info(&self) -> &DeviceInfo {
        &self.descriptor.info
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.descriptor.info.name
    }

    /// Stable identifier.
    pub fn unique_id(&self) -> &str {
        &self.descriptor.info.unique_id
    }

    /// Model identifier.
    pub fn model_id(&self) -> &str {
        &self.descriptor.info.model_id
    }

    /// Backend handle.
    pub const fn backend_id(&self) -> &BackendDeviceId {
        &self.descriptor.id
    }

    /// Enumeration entry this device was built from.
    pub const fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Supported formats in backend order.
    pub fn formats(&self) -> &[FormatDescriptor] {
        &self.formats
    }

    /// Set when the format query failed or returned malformed entries.
    pub const fn formats_incomplete(&self) -> bool {
        self.formats_incomplete
    }

    /// Whether `format` is one of this device's formats.
    pub fn supports(&self, format: &FormatDescriptor) -> bool {
        self.formats.contains(format)
    }

    /// Whether a started session currently owns this device.
    pub fn is_busy(&self) -> bool {
        self.leases.is_held(self.unique_id())
    }

    pub(crate) fn try_lease(&self) -> Option<DeviceLease> {
        self.leases.acquire(self.unique_id())
    }
}

/// Cached list of devices and their formats.
#[derive(Debug, Default)]
pub struct DeviceCatalog {
    devices: Vec<Arc<Device>>,
    generation: u64,
    leases: Arc<LeaseTable>,
}

impl DeviceCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the catalog from the backend.
    ///
    /// The new list replaces the old one only once it is complete; on error the
    /// previous contents stay in place.
    pub fn refresh(&mut self, backend: &dyn PlatformBackend) -> Result<()> {
        let descriptors = backend.enumerate()?;

        {
            let mut seen = HashSet::new();
            if let Some(dup) = descriptors
                .iter()
                .find(|d| !seen.insert(d.info.unique_id.as_str()))
            {
                return Err(CameraError::EnumerationFailed(format!(
                    "duplicate unique id {:?}",
                    dup.info.unique_id
                )));
            }
        }

        let devices = descriptors
            .into_iter()
            .map(|descriptor| Arc::new(self.build_device(backend, descriptor)))
            .collect::<Vec<_>>();

        self.devices = devices;
        self.generation += 1;
        info!(
            backend = backend.name(),
            devices = self.devices.len(),
            generation = self.generation,
            "device catalog refreshed"
        );
        Ok(())
    }

    fn build_device(&self, backend: &dyn PlatformBackend, descriptor: DeviceDescriptor) -> Device {
        let (formats, formats_incomplete) = match backend.formats(&descriptor) {
            Ok(reported) => {
                let mut formats: Vec<FormatDescriptor> = Vec::with_capacity(reported.len());
                let mut malformed = 0usize;
                for format in reported {
                    if !format.is_valid() {
                        malformed += 1;
                    } else if !formats.contains(&format) {
                        formats.push(format);
                    }
                }
                if malformed > 0 {
                    warn!(device = %descriptor.info.name, malformed, "dropped malformed format entries");
                }
                (formats, malformed > 0)
            }
            Err(err) => {
                warn!(device = %descriptor.info.name, error = %err, "format enumeration failed");
                (Vec::new(), true)
            }
        };
        debug!(device = %descriptor.info.name, formats = formats.len(), "device cataloged");

        Device {
            descriptor,
            formats,
            formats_incomplete,
            leases: Arc::clone(&self.leases),
        }
    }

    /// Number of devices from the last successful refresh.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Device at `index`.
    pub fn device(&self, index: usize) -> Result<&Arc<Device>> {
        self.devices.get(index).ok_or(CameraError::IndexOutOfRange {
            index,
            count: self.devices.len(),
        })
    }

    /// Format `format_index` of device `index`.
    pub fn format(&self, index: usize, format_index: usize) -> Result<&FormatDescriptor> {
        let formats = self.device(index)?.formats();
        formats.get(format_index).ok_or(CameraError::IndexOutOfRange {
            index: format_index,
            count: formats.len(),
        })
    }

    /// Number of formats of device `index`.
    pub fn format_count(&self, index: usize) -> Result<usize> {
        Ok(self.device(index)?.formats().len())
    }

    /// Iterate over devices in catalog order.
    pub fn devices(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.iter()
    }

    /// Look a device up by its unique id.
    pub fn find_by_unique_id(&self, unique_id: &str) -> Option<(usize, &Arc<Device>)> {
        self.devices
            .iter()
            .enumerate()
            .find(|(_, d)| d.unique_id() == unique_id)
    }

    /// Incremented by every successful refresh; 0 before the first.
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}
