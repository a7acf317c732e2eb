use std::io::Write;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use shmcam::{DeviceConfig, ServerConfig, SharedCameraServer};

static ENV_LOCK: Mutex<()> = Mutex::new(());

const CONFIG: &str = r#"
[logging]
filter = "shmcam=warn"

[[cameras]]
name = "dock"
width = 320
height = 240
channels = 1
device = { kind = "test_pattern", fps = 15 }

[[cameras]]
name = "gate"
width = 160
height = 120
shared_memory_name = "gate_frames"
"#;

fn write_config() -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    file.write_all(CONFIG.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_cameras_from_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    std::env::remove_var("SHMCAM__LOGGING__FILTER");

    let file = write_config();
    let config = ServerConfig::load(file.path()).expect("load config");

    assert_eq!(config.logging.filter, "shmcam=warn");
    assert_eq!(config.cameras.len(), 2);
    assert_eq!(config.cameras[0].camera.channels, 1);
    assert_eq!(
        config.cameras[0].camera.device,
        DeviceConfig::TestPattern { fps: Some(15) }
    );
    assert_eq!(config.cameras[1].camera.device, DeviceConfig::default());

    let server = SharedCameraServer::from_config(&config).expect("register cameras");
    let exports = server.shared_camera_configs();
    assert_eq!(exports[0].size_bytes, 320 * 240);
    assert_eq!(exports[1].shared_memory_name, "gate_frames");
    assert_eq!(exports[1].shape.as_tuple(), (120, 160, 3));
}

#[test]
fn environment_overrides_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    let file = write_config();

    std::env::set_var("SHMCAM__LOGGING__FILTER", "shmcam=trace");
    let config = ServerConfig::load(file.path());
    std::env::remove_var("SHMCAM__LOGGING__FILTER");

    assert_eq!(config.expect("load config").logging.filter, "shmcam=trace");
}

#[test]
fn missing_file_is_an_error() {
    assert!(ServerConfig::load("/nonexistent/shmcam.toml").is_err());
}

#[test]
fn duplicate_names_in_config_are_rejected() {
    let config = ServerConfig::from_toml_str(
        r#"
        [[cameras]]
        name = "twin"
        width = 2
        height = 2

        [[cameras]]
        name = "twin"
        width = 2
        height = 2
        "#,
    )
    .unwrap();
    assert!(SharedCameraServer::from_config(&config).is_err());
}
