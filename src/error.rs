//! Error types for the camera server, the capture process and shared memory

use nix::errno::Errno;

/// Result type alias for orchestration calls
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors surfaced synchronously by [`crate::SharedCameraServer`]
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid camera name '{0}'")]
    InvalidName(String),

    #[error("camera with name '{0}' already exists")]
    DuplicateName(String),

    #[error("no camera named '{0}'")]
    NotFound(String),

    #[error("camera index {index} out of range (registry holds {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid camera selector: {0}")]
    InvalidSelector(String),

    #[error("camera '{0}' is already streaming")]
    AlreadyStreaming(String),

    #[error("camera '{0}' is not streaming")]
    NotStreaming(String),

    /// Frame size is zero or does not fit in memory
    #[error("camera '{name}' has invalid geometry {height}x{width}x{channels}")]
    InvalidGeometry {
        name: String,
        height: u32,
        width: u32,
        channels: u32,
    },

    #[error(transparent)]
    Shm(#[from] ShmError),

    /// Camera driver could not be constructed from its config
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("failed to launch capture process: {0}")]
    Spawn(#[source] Errno),

    #[error("failed to wait for capture process: {0}")]
    Wait(#[source] Errno),
}

/// Errors raised by camera drivers and the capture loop
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("device error: {0}")]
    Device(String),

    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    #[error("frame is {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("stop signal: {0}")]
    StopSignal(#[source] Errno),

    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A capture loop failure tagged with the camera it happened on
#[derive(Debug, thiserror::Error)]
#[error("error while streaming camera '{camera}': {source}")]
pub struct CaptureFailure {
    pub camera: String,
    #[source]
    pub source: CaptureError,
}

/// Shared memory segment errors
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("invalid shared memory name '{0}'")]
    InvalidName(String),

    #[error("shared memory segment '{0}' already exists")]
    AlreadyExists(String),

    #[error("shared memory segment '{0}' not found")]
    NotFound(String),

    #[error("shared memory segment '{name}' is {actual} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("shared memory segment '{name}': {source}")]
    Os {
        name: String,
        #[source]
        source: Errno,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
