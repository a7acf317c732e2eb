//! Camera descriptors and the registry's per-camera runtime handle

use serde::{Deserialize, Serialize};

use crate::capture::{Camera, FrameShape, TestPatternCamera};
use crate::error::{CaptureError, ServerError};
use crate::shm;

/// Static camera identity and geometry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Unique key within a server
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_channels")]
    pub channels: u32,
    /// Core the capture process pins itself to
    #[serde(default)]
    pub cpu_affinity: Option<usize>,
    #[serde(default)]
    pub device: DeviceConfig,
}

fn default_channels() -> u32 {
    3
}

impl CameraConfig {
    pub fn new(name: impl Into<String>, width: u32, height: u32, channels: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            channels,
            cpu_affinity: None,
            device: DeviceConfig::default(),
        }
    }

    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    pub fn shape(&self) -> FrameShape {
        FrameShape::new(self.height, self.width, self.channels)
    }

    /// What consumers need to attach, without constructing the camera
    pub fn shared_camera_config(
        &self,
        shared_memory_name: Option<&str>,
    ) -> Result<SharedCameraConfig, ServerError> {
        // Blank names could never be selected again
        if self.name.trim().is_empty() {
            return Err(ServerError::InvalidName(self.name.clone()));
        }
        let shape = self.shape();
        let size_bytes = shape.byte_len().ok_or_else(|| ServerError::InvalidGeometry {
            name: self.name.clone(),
            height: self.height,
            width: self.width,
            channels: self.channels,
        })?;
        let shared_memory_name = shared_memory_name.unwrap_or(&self.name).to_owned();
        shm::os_name(&shared_memory_name)?;

        Ok(SharedCameraConfig {
            name: self.name.clone(),
            shared_memory_name,
            size_bytes,
            shape,
        })
    }
}

/// Device-specific parameters, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceConfig {
    TestPattern {
        #[serde(default)]
        fps: Option<u32>,
    },
    V4l2 {
        path: String,
        #[serde(default)]
        format: V4l2Format,
        #[serde(default = "default_buffer_count")]
        buffer_count: u32,
    },
}

fn default_buffer_count() -> u32 {
    4
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::TestPattern { fps: None }
    }
}

/// Pixel formats requested from V4L2 devices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum V4l2Format {
    #[default]
    Mjpeg,
    Yuyv,
    Rgb24,
}

/// Read-only export that lets another process attach to a camera's frames
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SharedCameraConfig {
    pub name: String,
    pub shared_memory_name: String,
    pub size_bytes: usize,
    /// (height, width, channels)
    pub shape: FrameShape,
}

/// A camera bound to its config and shared memory layout
pub struct ManagedCamera {
    config: CameraConfig,
    shared: SharedCameraConfig,
    camera: Box<dyn Camera>,
}

impl ManagedCamera {
    /// Build the driver named by `config.device`
    pub fn new(
        config: CameraConfig,
        shared_memory_name: Option<&str>,
    ) -> Result<Self, ServerError> {
        let camera = open_device(&config)?;
        Self::with_camera(config, shared_memory_name, camera)
    }

    /// Wrap a caller-provided camera
    pub fn with_camera(
        config: CameraConfig,
        shared_memory_name: Option<&str>,
        camera: Box<dyn Camera>,
    ) -> Result<Self, ServerError> {
        let shared = config.shared_camera_config(shared_memory_name)?;
        Ok(Self {
            config,
            shared,
            camera,
        })
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn shared_memory_name(&self) -> &str {
        &self.shared.shared_memory_name
    }

    pub fn shared_memory_size(&self) -> usize {
        self.shared.size_bytes
    }

    pub fn shape(&self) -> FrameShape {
        self.shared.shape
    }

    pub fn export_shared_camera_config(&self) -> SharedCameraConfig {
        self.shared.clone()
    }

    pub fn camera_mut(&mut self) -> &mut dyn Camera {
        self.camera.as_mut()
    }
}

fn open_device(config: &CameraConfig) -> Result<Box<dyn Camera>, CaptureError> {
    match &config.device {
        DeviceConfig::TestPattern { fps } => {
            Ok(Box::new(TestPatternCamera::new(config.shape(), *fps)))
        }
        #[cfg(feature = "v4l2")]
        DeviceConfig::V4l2 {
            path,
            format,
            buffer_count,
        } => Ok(Box::new(crate::capture::V4l2Camera::new(
            path.clone(),
            *format,
            *buffer_count,
            config.shape(),
        )?)),
        #[cfg(not(feature = "v4l2"))]
        DeviceConfig::V4l2 { path, .. } => Err(CaptureError::UnsupportedDevice(format!(
            "{} requires the `v4l2` feature",
            path
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShmError;

    #[test]
    fn export_matches_geometry() {
        let config = CameraConfig::new("cam0", 64, 48, 3);
        let camera = ManagedCamera::new(config, None).unwrap();
        let shared = camera.export_shared_camera_config();

        assert_eq!(shared.name, "cam0");
        assert_eq!(shared.shared_memory_name, "cam0");
        assert_eq!(shared.size_bytes, 9216);
        assert_eq!(shared.shape.as_tuple(), (48, 64, 3));
    }

    #[test]
    fn explicit_shared_memory_name_wins() {
        let config = CameraConfig::new("cam0", 4, 4, 1);
        let shared = config.shared_camera_config(Some("front_door")).unwrap();
        assert_eq!(shared.shared_memory_name, "front_door");
    }

    #[test]
    fn zero_sized_camera_is_rejected() {
        let config = CameraConfig::new("flat", 0, 48, 3);
        assert!(matches!(
            ManagedCamera::new(config, None),
            Err(ServerError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn bad_shared_memory_name_is_rejected() {
        let config = CameraConfig::new("cam/0", 4, 4, 3);
        assert!(matches!(
            ManagedCamera::new(config, None),
            Err(ServerError::Shm(ShmError::InvalidName(_)))
        ));
    }

    #[cfg(not(feature = "v4l2"))]
    #[test]
    fn v4l2_requires_feature() {
        let config = CameraConfig::new("usb", 640, 480, 3).with_device(DeviceConfig::V4l2 {
            path: "/dev/video0".into(),
            format: V4l2Format::Mjpeg,
            buffer_count: 4,
        });
        assert!(matches!(
            ManagedCamera::new(config, None),
            Err(ServerError::Capture(CaptureError::UnsupportedDevice(_)))
        ));
    }
}
