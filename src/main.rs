//! shmcam: stream every configured camera into shared memory until Ctrl-C or SIGTERM

use std::time::Duration;

use color_eyre::Result;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use shmcam::{ServerConfig, SharedCameraServer};

const DEFAULT_CONFIG: &str = "shmcam.toml";
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

// Capture processes are forked from this thread, so keep the runtime single-threaded
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_owned());
    let config = ServerConfig::load(&path)?;
    shmcam::init_tracing(&config.logging);

    info!("shmcam launching with {} cameras from {}", config.cameras.len(), path);

    let mut server = SharedCameraServer::from_config(&config)?;
    for shared in server.shared_camera_configs() {
        info!(
            "{} -> shm '{}' {:?} ({} bytes)",
            shared.name,
            shared.shared_memory_name,
            shared.shape.as_tuple(),
            shared.size_bytes
        );
    }
    for index in 0..server.len() {
        server.activate_camera_streaming(index)?;
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut terminate = signal(SignalKind::terminate())?;
    let mut ticker = tokio::time::interval(WATCH_INTERVAL);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                info!("Interrupt received");
                break;
            }
            _ = terminate.recv() => {
                info!("Terminate received");
                break;
            }
            _ = ticker.tick() => {
                for (name, exit) in server.poll_captures()? {
                    warn!("Camera '{}' is no longer streaming ({}), restarting", name, exit);
                    server.deactivate_camera_streaming(name.as_str())?;
                    server.activate_camera_streaming(name.as_str())?;
                }
            }
        }
    }

    server.shutdown()?;
    info!("shmcam shutting down");
    Ok(())
}
