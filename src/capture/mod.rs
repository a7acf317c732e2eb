pub mod frame;
pub mod pattern;
pub mod process;

#[cfg(feature = "v4l2")]
pub mod decoder;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{Frame, FrameShape, FrameView, FrameViewMut};
pub use pattern::TestPatternCamera;
pub use process::{CaptureExit, CaptureHandle};

#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Camera;

use crate::error::CaptureError;

/// A frame source the capture process drives
///
/// Cameras are constructed in the orchestrator but only ever read inside
/// their capture process, so device handles should be opened in `start`.
pub trait Camera: Send {
    /// Called once in the capture process before the first `read_once`
    fn start(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Block until one frame is available
    fn read_once(&mut self) -> Result<Frame, CaptureError>;
}
