//! Synthetic camera producing a moving gradient

use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;

use super::{Camera, Frame, FrameShape};
use crate::error::CaptureError;

/// Deterministic test source: byte (y, x, c) of frame `n` is `x + y + 64c + n`
pub struct TestPatternCamera {
    shape: FrameShape,
    frame_interval: Option<Duration>,
    sequence: u64,
    next_deadline: Option<Instant>,
}

impl TestPatternCamera {
    /// `fps` of `None` or zero produces frames as fast as they are read
    pub fn new(shape: FrameShape, fps: Option<u32>) -> Self {
        let frame_interval = fps
            .filter(|fps| *fps > 0)
            .map(|fps| Duration::from_secs(1) / fps);
        Self {
            shape,
            frame_interval,
            sequence: 0,
            next_deadline: None,
        }
    }

    fn render(&self) -> BytesMut {
        let channels = self.shape.channels as usize;
        let len = self.shape.byte_len().unwrap_or(0);
        let mut data = BytesMut::zeroed(len);
        let seq = self.sequence as usize;
        for (i, value) in data.iter_mut().enumerate() {
            let c = i % channels;
            let pixel = i / channels;
            let x = pixel % self.shape.width as usize;
            let y = pixel / self.shape.width as usize;
            *value = (x + y + 64 * c + seq) as u8;
        }
        data
    }
}

impl Camera for TestPatternCamera {
    fn read_once(&mut self) -> Result<Frame, CaptureError> {
        if let Some(interval) = self.frame_interval {
            let now = Instant::now();
            let deadline = self.next_deadline.unwrap_or(now);
            if deadline > now {
                thread::sleep(deadline - now);
            }
            self.next_deadline = Some(deadline.max(now) + interval);
        }

        let frame = Frame::new(self.render().freeze(), self.shape, self.sequence);
        self.sequence += 1;
        Ok(frame)
    }
}
