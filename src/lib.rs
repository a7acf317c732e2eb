pub mod camera;
pub mod capture;
pub mod error;
pub mod server;
pub mod shm;

use std::path::Path;

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

pub use camera::{CameraConfig, DeviceConfig, ManagedCamera, SharedCameraConfig, V4l2Format};
pub use capture::{Camera, CaptureExit, Frame, FrameShape, FrameView};
pub use error::{CaptureError, CaptureFailure, ServerError, ShmError};
pub use server::{CameraSelector, SharedCameraServer, SlotStatus};
pub use shm::SharedFrameBuffer;

/// Prefix for environment overrides, e.g. `SHMCAM__LOGGING__FILTER`
pub const ENV_PREFIX: &str = "SHMCAM";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cameras: Vec<CameraEntry>,
}

/// One `[[cameras]]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraEntry {
    #[serde(flatten)]
    pub camera: CameraConfig,
    /// Defaults to the camera name
    #[serde(default)]
    pub shared_memory_name: Option<String>,
}

impl CameraEntry {
    pub fn shared_camera_config(&self) -> Result<SharedCameraConfig, ServerError> {
        self.camera
            .shared_camera_config(self.shared_memory_name.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "shmcam=info".into(),
        }
    }
}

impl ServerConfig {
    /// Load a TOML file, then apply `SHMCAM__*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(File::from(path.as_ref()).format(FileFormat::Toml))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Export for the named camera, for consumers that share the config file
    pub fn shared_camera_config(
        &self,
        name: &str,
    ) -> Option<Result<SharedCameraConfig, ServerError>> {
        self.cameras
            .iter()
            .find(|entry| entry.camera.name == name)
            .map(CameraEntry::shared_camera_config)
    }
}

/// Install the global `tracing` subscriber; later calls are no-ops
pub fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [logging]
        filter = "shmcam=debug"

        [[cameras]]
        name = "front"
        width = 64
        height = 48
        device = { kind = "test_pattern", fps = 30 }

        [[cameras]]
        name = "usb"
        width = 640
        height = 480
        channels = 3
        shared_memory_name = "usb_frames"
        cpu_affinity = 2
        device = { kind = "v4l2", path = "/dev/video0", format = "yuyv" }
    "#;

    #[test]
    fn parses_cameras_in_order() {
        let config = ServerConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.logging.filter, "shmcam=debug");
        assert_eq!(config.cameras.len(), 2);

        let front = &config.cameras[0];
        assert_eq!(front.camera.channels, 3);
        assert_eq!(front.camera.device, DeviceConfig::TestPattern { fps: Some(30) });
        assert_eq!(front.shared_memory_name, None);

        let usb = &config.cameras[1];
        assert_eq!(usb.shared_memory_name.as_deref(), Some("usb_frames"));
        assert_eq!(usb.camera.cpu_affinity, Some(2));
        assert_eq!(
            usb.camera.device,
            DeviceConfig::V4l2 {
                path: "/dev/video0".into(),
                format: V4l2Format::Yuyv,
                buffer_count: 4,
            }
        );
    }

    #[test]
    fn consumers_derive_exports_from_config() {
        let config = ServerConfig::from_toml_str(SAMPLE).unwrap();
        let shared = config.shared_camera_config("usb").unwrap().unwrap();
        assert_eq!(shared.shared_memory_name, "usb_frames");
        assert_eq!(shared.size_bytes, 640 * 480 * 3);
        assert!(config.shared_camera_config("rear").is_none());
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = ServerConfig::from_toml_str("").unwrap();
        assert!(config.cameras.is_empty());
        assert_eq!(config.logging.filter, "shmcam=info");
    }

    #[test]
    fn server_registers_config_entries() {
        let config = ServerConfig::from_toml_str(
            r#"
            [[cameras]]
            name = "a"
            width = 4
            height = 4

            [[cameras]]
            name = "b"
            width = 4
            height = 4
            shared_memory_name = "b_frames"
            "#,
        )
        .unwrap();
        let server = SharedCameraServer::from_config(&config).unwrap();
        assert_eq!(server.len(), 2);
        assert_eq!(
            server.shared_camera_config("b").unwrap().shared_memory_name,
            "b_frames"
        );
    }
}
