//! The set of cameras a process can open.
//!
//! Each entry is a [`CameraSpec`]. A camera id can be open at most once at a
//! time; the lease is given back when the camera is released.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::camera::{Camera, CameraInfo};
use crate::config::{CameraSpec, Facing};
use crate::error::{CaptureError, Result};
use crate::traits::DeviceProvider;

/// Default location of the camera list.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/camera.cfg";

#[derive(Debug)]
struct Entry {
    spec: CameraSpec,
    open: Arc<AtomicBool>,
}

/// Cameras known to the process.
#[derive(Debug)]
pub struct CameraRegistry<P: DeviceProvider> {
    provider: P,
    entries: Vec<Entry>,
}

impl<P: DeviceProvider> CameraRegistry<P> {
    /// Registry over explicit specs, in id order.
    ///
    /// A node forced by one camera is excluded from every other camera, so
    /// two ids never stream from the same device.
    pub fn from_specs(provider: P, mut specs: Vec<CameraSpec>) -> Self {
        let claimed: Vec<PathBuf> = specs
            .iter()
            .flat_map(|spec| spec.devices.iter().cloned())
            .collect();
        for spec in &mut specs {
            let foreign: Vec<PathBuf> = claimed
                .iter()
                .filter(|path| !spec.devices.contains(path) && !spec.is_excluded(path))
                .cloned()
                .collect();
            spec.nodevices.extend(foreign);
        }
        let entries = specs
            .into_iter()
            .map(|spec| Entry {
                spec,
                open: Arc::new(AtomicBool::new(false)),
            })
            .collect();
        Self { provider, entries }
    }

    /// Registry from a config file; see [`CameraSpec::parse_all`].
    ///
    /// An unreadable or empty file falls back to [`Self::with_default_nodes`].
    pub fn from_config_file(provider: P, path: &Path) -> Self {
        match CameraSpec::load_all_from_file(path) {
            Ok(specs) if !specs.is_empty() => {
                info!(path = %path.display(), cameras = specs.len(), "loaded camera config");
                Self::from_specs(provider, specs)
            }
            Ok(_) => {
                warn!(path = %path.display(), "camera config lists no cameras; using defaults");
                Self::with_default_nodes(provider)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot load camera config; using defaults");
                Self::with_default_nodes(provider)
            }
        }
    }

    /// `/dev/video0` as the back camera and `/dev/video1` as the front one,
    /// each only if the node exists.
    pub fn with_default_nodes(provider: P) -> Self {
        let nodes = provider.list_nodes();
        let specs = [("/dev/video0", Facing::Back), ("/dev/video1", Facing::Front)]
            .into_iter()
            .filter(|(path, _)| nodes.iter().any(|node| node == Path::new(path)))
            .map(|(path, facing)| CameraSpec {
                facing,
                ..CameraSpec::with_device(PathBuf::from(path))
            })
            .collect();
        Self::from_specs(provider, specs)
    }

    /// Number of cameras.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no camera is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, id: usize) -> Result<&Entry> {
        self.entries.get(id).ok_or(CaptureError::UnknownCamera(id))
    }

    /// Facing and orientation of camera `id`.
    pub fn camera_info(&self, id: usize) -> Result<CameraInfo> {
        Ok(CameraInfo::from(&self.entry(id)?.spec))
    }

    /// Whether camera `id` is currently open.
    pub fn is_open(&self, id: usize) -> Result<bool> {
        Ok(self.entry(id)?.open.load(Ordering::SeqCst))
    }

    /// Open camera `id`. Fails with [`CaptureError::CameraBusy`] while a
    /// previous instance is still alive.
    pub fn open(&self, id: usize) -> Result<Camera<P>> {
        let entry = self.entry(id)?;
        if entry
            .open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CaptureError::CameraBusy(id));
        }
        match Camera::new(self.provider.clone(), entry.spec.clone()) {
            Ok(camera) => {
                info!(id, "camera opened");
                Ok(camera.with_lease(Arc::clone(&entry.open)))
            }
            Err(err) => {
                entry.open.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }
}
