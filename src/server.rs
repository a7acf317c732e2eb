//! Camera registry and capture process orchestration

use std::fmt;

use nix::unistd::Pid;
use tracing::{info, instrument, warn};

use crate::camera::{CameraConfig, ManagedCamera, SharedCameraConfig};
use crate::capture::process::{self, CaptureExit, CaptureHandle};
use crate::capture::Camera;
use crate::error::{Result, ServerError};
use crate::ServerConfig;

/// A camera reference: its unique name or its registry index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSelector {
    Name(String),
    Index(usize),
}

impl From<&str> for CameraSelector {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<String> for CameraSelector {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<&String> for CameraSelector {
    fn from(name: &String) -> Self {
        Self::Name(name.clone())
    }
}

impl From<usize> for CameraSelector {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl fmt::Display for CameraSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "'{}'", name),
            Self::Index(index) => write!(f, "#{}", index),
        }
    }
}

/// Streaming state of one registry slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Idle,
    Running,
    /// The capture process ended on its own; deactivate to clear the slot
    Exited(CaptureExit),
}

struct CameraSlot {
    camera: ManagedCamera,
    capture: Option<CaptureHandle>,
}

/// Registry of cameras and their capture processes
///
/// All mutation goes through `&mut self`; share it across threads only
/// behind a lock.
#[derive(Default)]
pub struct SharedCameraServer {
    slots: Vec<CameraSlot>,
}

impl SharedCameraServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `configs` in order; see [`Self::extend_cameras`]
    pub fn with_cameras(configs: Vec<CameraConfig>) -> Result<Self> {
        let mut server = Self::new();
        server.extend_cameras(configs)?;
        Ok(server)
    }

    /// Register every camera of a loaded config, in file order
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let mut server = Self::new();
        for entry in &config.cameras {
            server.append_camera(entry.camera.clone(), entry.shared_memory_name.as_deref())?;
        }
        Ok(server)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains_camera(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn camera_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.slots.iter().map(|slot| slot.camera.name())
    }

    /// Register a camera whose driver is built from `config.device`
    ///
    /// The shared memory name defaults to the camera name. No process is
    /// started.
    pub fn append_camera(
        &mut self,
        config: CameraConfig,
        shared_memory_name: Option<&str>,
    ) -> Result<SharedCameraConfig> {
        self.ensure_unique(&config.name)?;
        let camera = ManagedCamera::new(config, shared_memory_name)?;
        Ok(self.push(camera))
    }

    /// Register a camera with a caller-provided driver
    pub fn append_camera_with(
        &mut self,
        config: CameraConfig,
        shared_memory_name: Option<&str>,
        camera: Box<dyn Camera>,
    ) -> Result<SharedCameraConfig> {
        self.ensure_unique(&config.name)?;
        let camera = ManagedCamera::with_camera(config, shared_memory_name, camera)?;
        Ok(self.push(camera))
    }

    /// Append each config in turn
    ///
    /// Not transactional: if item `k` fails, items before it stay registered.
    pub fn extend_cameras(
        &mut self,
        configs: impl IntoIterator<Item = CameraConfig>,
    ) -> Result<Vec<SharedCameraConfig>> {
        configs
            .into_iter()
            .map(|config| self.append_camera(config, None))
            .collect()
    }

    /// Drop an idle camera from the registry
    pub fn remove_camera(
        &mut self,
        selector: impl Into<CameraSelector>,
    ) -> Result<SharedCameraConfig> {
        let index = self.resolve(&selector.into())?;
        if self.slots[index].capture.is_some() {
            return Err(ServerError::AlreadyStreaming(self.name_at(index)));
        }
        let slot = self.slots.remove(index);
        for (index, later) in self.slots.iter_mut().enumerate().skip(index) {
            if let Some(handle) = later.capture.as_mut() {
                handle.set_camera_index(index);
            }
        }
        info!("Removed camera '{}'", slot.camera.name());
        Ok(slot.camera.export_shared_camera_config())
    }

    pub fn shared_camera_config(
        &self,
        selector: impl Into<CameraSelector>,
    ) -> Result<SharedCameraConfig> {
        let index = self.resolve(&selector.into())?;
        Ok(self.slots[index].camera.export_shared_camera_config())
    }

    pub fn shared_camera_configs(&self) -> Vec<SharedCameraConfig> {
        self.slots
            .iter()
            .map(|slot| slot.camera.export_shared_camera_config())
            .collect()
    }

    /// Whether the slot holds a capture process, live or not yet deactivated
    pub fn is_streaming(&self, selector: impl Into<CameraSelector>) -> Result<bool> {
        let index = self.resolve(&selector.into())?;
        Ok(self.slots[index].capture.is_some())
    }

    pub fn capture_status(&self, selector: impl Into<CameraSelector>) -> Result<SlotStatus> {
        let index = self.resolve(&selector.into())?;
        Ok(match &self.slots[index].capture {
            None => SlotStatus::Idle,
            Some(handle) => match handle.exit() {
                None => SlotStatus::Running,
                Some(exit) => SlotStatus::Exited(exit),
            },
        })
    }

    /// Pid of the camera's capture process, while the slot holds one
    pub fn capture_pid(&self, selector: impl Into<CameraSelector>) -> Result<Option<Pid>> {
        let index = self.resolve(&selector.into())?;
        Ok(self.slots[index].capture.as_ref().map(CaptureHandle::pid))
    }

    /// Launch the capture process for one camera
    ///
    /// Returns once the process exists, not once its buffer is ready; attach
    /// with [`crate::SharedFrameBuffer::attach_with_retry`].
    #[instrument(skip(self, selector), fields(camera = tracing::field::Empty))]
    pub fn activate_camera_streaming(&mut self, selector: impl Into<CameraSelector>) -> Result<()> {
        let index = self.resolve(&selector.into())?;
        tracing::Span::current().record("camera", self.slots[index].camera.name());

        let slot = &mut self.slots[index];
        if slot.capture.is_some() {
            return Err(ServerError::AlreadyStreaming(slot.camera.name().to_owned()));
        }

        let handle = process::spawn(&mut slot.camera, index).map_err(ServerError::Spawn)?;
        info!(
            "Camera '{}' streaming to '{}' (pid {})",
            slot.camera.name(),
            slot.camera.shared_memory_name(),
            handle.pid()
        );
        slot.capture = Some(handle);
        Ok(())
    }

    /// Stop one camera's capture process and wait until its buffer is unlinked
    #[instrument(skip(self, selector), fields(camera = tracing::field::Empty))]
    pub fn deactivate_camera_streaming(
        &mut self,
        selector: impl Into<CameraSelector>,
    ) -> Result<CaptureExit> {
        let index = self.resolve(&selector.into())?;
        tracing::Span::current().record("camera", self.slots[index].camera.name());

        let slot = &mut self.slots[index];
        let Some(handle) = slot.capture.as_mut() else {
            return Err(ServerError::NotStreaming(slot.camera.name().to_owned()));
        };

        // The slot keeps its handle until the process is confirmed reaped
        handle.signal_stop();
        let exit = handle.join().map_err(ServerError::Wait)?;
        slot.capture = None;
        if exit.is_success() {
            info!("Camera '{}' stopped", slot.camera.name());
        } else {
            warn!("Camera '{}' capture process {}", slot.camera.name(), exit);
        }
        Ok(exit)
    }

    /// Reap capture processes that exited on their own
    ///
    /// Slots are not cleared; each reported camera still needs a
    /// `deactivate_camera_streaming` before it can be activated again.
    pub fn poll_captures(&mut self) -> Result<Vec<(String, CaptureExit)>> {
        let mut exited = Vec::new();
        for slot in &mut self.slots {
            let Some(handle) = slot.capture.as_mut() else {
                continue;
            };
            if handle.exit().is_some() {
                continue;
            }
            if let Some(exit) = handle.try_wait().map_err(ServerError::Wait)? {
                warn!(
                    "Capture process for camera '{}' exited: {}",
                    slot.camera.name(),
                    exit
                );
                exited.push((slot.camera.name().to_owned(), exit));
            }
        }
        Ok(exited)
    }

    /// Stop every active stream, then clear the registry
    ///
    /// All processes are signalled before any is joined so they wind down
    /// in parallel. The registry is cleared even when a process could not be
    /// reaped; the first such error is returned.
    pub fn shutdown(&mut self) -> Result<()> {
        for handle in self.slots.iter().filter_map(|slot| slot.capture.as_ref()) {
            handle.signal_stop();
        }

        let mut first_error = None;
        for slot in &mut self.slots {
            if let Some(handle) = slot.capture.take() {
                match handle.stop() {
                    Ok(exit) => info!("Camera '{}' {}", slot.camera.name(), exit),
                    Err(errno) => {
                        warn!("Failed to reap camera '{}': {}", slot.camera.name(), errno);
                        first_error.get_or_insert(ServerError::Wait(errno));
                    }
                }
            }
        }
        self.slots.clear();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn resolve(&self, selector: &CameraSelector) -> Result<usize> {
        match selector {
            CameraSelector::Name(name) if name.trim().is_empty() => {
                Err(ServerError::InvalidSelector("empty camera name".into()))
            }
            CameraSelector::Name(name) => self
                .position(name)
                .ok_or_else(|| ServerError::NotFound(name.clone())),
            CameraSelector::Index(index) if *index < self.slots.len() => Ok(*index),
            CameraSelector::Index(index) => Err(ServerError::IndexOutOfRange {
                index: *index,
                len: self.slots.len(),
            }),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|slot| slot.camera.name() == name)
    }

    fn name_at(&self, index: usize) -> String {
        self.slots[index].camera.name().to_owned()
    }

    fn ensure_unique(&self, name: &str) -> Result<()> {
        if self.contains_camera(name) {
            return Err(ServerError::DuplicateName(name.to_owned()));
        }
        Ok(())
    }

    fn push(&mut self, camera: ManagedCamera) -> SharedCameraConfig {
        let shared = camera.export_shared_camera_config();
        info!(
            "Registered camera '{}' ({}x{}x{}, {} bytes)",
            shared.name,
            shared.shape.height,
            shared.shape.width,
            shared.shape.channels,
            shared.size_bytes
        );
        self.slots.push(CameraSlot {
            camera,
            capture: None,
        });
        shared
    }
}

impl Drop for SharedCameraServer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Camera server teardown incomplete: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with(names: &[&str]) -> SharedCameraServer {
        let mut server = SharedCameraServer::new();
        for name in names {
            server
                .append_camera(CameraConfig::new(*name, 8, 4, 3), None)
                .unwrap();
        }
        server
    }

    #[test]
    fn contains_only_registered_names() {
        let server = server_with(&["cam0", "cam1", "cam2"]);
        for name in ["cam0", "cam1", "cam2"] {
            assert!(server.contains_camera(name));
        }
        assert!(!server.contains_camera("cam3"));
        assert!(!server.contains_camera(""));
        assert!(!server.contains_camera("CAM0"));
        assert_eq!(server.camera_names().collect::<Vec<_>>(), ["cam0", "cam1", "cam2"]);
    }

    #[test]
    fn duplicate_name_leaves_registry_unchanged() {
        let mut server = server_with(&["cam0"]);
        let err = server
            .append_camera(CameraConfig::new("cam0", 16, 16, 1), Some("other"))
            .unwrap_err();
        assert!(matches!(err, ServerError::DuplicateName(name) if name == "cam0"));
        assert_eq!(server.len(), 1);
        assert_eq!(server.shared_camera_config("cam0").unwrap().size_bytes, 96);
    }

    #[test]
    fn extend_is_sequential_not_transactional() {
        let mut server = SharedCameraServer::new();
        let err = server
            .extend_cameras(vec![
                CameraConfig::new("a", 2, 2, 1),
                CameraConfig::new("b", 2, 2, 1),
                CameraConfig::new("a", 2, 2, 1),
                CameraConfig::new("c", 2, 2, 1),
            ])
            .unwrap_err();
        assert!(matches!(err, ServerError::DuplicateName(_)));
        assert_eq!(server.camera_names().collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    fn extend_returns_exports_in_order() {
        let mut server = SharedCameraServer::new();
        let shared = server
            .extend_cameras(vec![
                CameraConfig::new("left", 4, 2, 3),
                CameraConfig::new("right", 4, 2, 1),
            ])
            .unwrap();
        assert_eq!(shared.len(), 2);
        assert_eq!(shared[0].name, "left");
        assert_eq!(shared[1].size_bytes, 8);
    }

    #[test]
    fn selector_errors() {
        let mut server = server_with(&["cam0"]);

        assert!(matches!(
            server.activate_camera_streaming("missing"),
            Err(ServerError::NotFound(_))
        ));
        assert!(matches!(
            server.activate_camera_streaming(3usize),
            Err(ServerError::IndexOutOfRange { index: 3, len: 1 })
        ));
        assert!(matches!(
            server.activate_camera_streaming(""),
            Err(ServerError::InvalidSelector(_))
        ));
        assert!(matches!(
            server.deactivate_camera_streaming("missing"),
            Err(ServerError::NotFound(_))
        ));
        assert_eq!(server.capture_status(0usize).unwrap(), SlotStatus::Idle);
    }

    #[test]
    fn deactivate_idle_camera_is_an_error() {
        let mut server = server_with(&["cam0"]);
        assert!(matches!(
            server.deactivate_camera_streaming("cam0"),
            Err(ServerError::NotStreaming(name)) if name == "cam0"
        ));
    }

    #[test]
    fn remove_idle_camera() {
        let mut server = server_with(&["cam0", "cam1"]);
        let removed = server.remove_camera(0usize).unwrap();
        assert_eq!(removed.name, "cam0");
        assert!(!server.contains_camera("cam0"));
        assert_eq!(server.shared_camera_config(0usize).unwrap().name, "cam1");
    }

    #[test]
    fn blank_name_is_rejected_at_registration() {
        let mut server = server_with(&["cam0"]);
        for name in ["", " ", "\t"] {
            assert!(matches!(
                server.append_camera(CameraConfig::new(name, 2, 2, 1), Some("blank")),
                Err(ServerError::InvalidName(_))
            ));
        }
        assert!(!server.contains_camera(" "));
        assert_eq!(server.camera_names().collect::<Vec<_>>(), ["cam0"]);
    }

    #[test]
    fn selector_conversions() {
        assert_eq!(CameraSelector::from("a"), CameraSelector::Name("a".into()));
        assert_eq!(CameraSelector::from(2usize), CameraSelector::Index(2));
        assert_eq!(CameraSelector::from(2usize).to_string(), "#2");
    }
}
