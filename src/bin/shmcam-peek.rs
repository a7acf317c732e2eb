//! Reference consumer: attach to one camera's frames and log channel means
//!
//! Usage: shmcam-peek <camera> [config]

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::info;

use shmcam::{ServerConfig, SharedFrameBuffer, ShmError};

const ATTACH_TIMEOUT: Duration = Duration::from_secs(5);
const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let mut args = std::env::args().skip(1);
    let camera = args
        .next()
        .ok_or_else(|| eyre!("usage: shmcam-peek <camera> [config]"))?;
    let path = args.next().unwrap_or_else(|| "shmcam.toml".to_owned());

    let config = ServerConfig::load(&path)?;
    shmcam::init_tracing(&config.logging);

    let shared = config
        .shared_camera_config(&camera)
        .ok_or_else(|| eyre!("camera '{}' is not in {}", camera, path))??;

    let buffer = SharedFrameBuffer::attach_with_retry(&shared, ATTACH_TIMEOUT)?;
    info!(
        "Attached to '{}' ({} bytes, shape {:?})",
        buffer.name(),
        buffer.size(),
        shared.shape.as_tuple()
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                break;
            }
            _ = ticker.tick() => {
                // The mapping outlives an unlink, so probe the name to notice a stopped stream
                if let Err(ShmError::NotFound(_)) = SharedFrameBuffer::attach(&shared) {
                    info!("Stream '{}' has stopped", shared.name);
                    break;
                }
                let view = buffer.view(shared.shape)?;
                info!("{} channel means {:?}", shared.name, view.channel_means());
            }
        }
    }

    Ok(())
}
