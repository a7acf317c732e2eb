use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::CaptureError;

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data, `height * width * channels` bytes, row-major
    pub data: Bytes,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// Capture timestamp
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub shape: FrameShape,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, shape: FrameShape, sequence: u64) -> Self {
        Self {
            data: data.into(),
            meta: FrameMetadata { sequence, shape },
            timestamp: Instant::now(),
        }
    }
}

/// Shape of one frame: (height, width, channels), one byte per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl FrameShape {
    pub const fn new(height: u32, width: u32, channels: u32) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Bytes needed to hold one frame; `None` if zero or overflowing
    pub fn byte_len(&self) -> Option<usize> {
        let len = (self.height as usize)
            .checked_mul(self.width as usize)?
            .checked_mul(self.channels as usize)?;
        (len > 0).then_some(len)
    }

    pub fn row_len(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    pub fn as_tuple(&self) -> (u32, u32, u32) {
        (self.height, self.width, self.channels)
    }
}

/// Read-only (height, width, channels) view over a raw byte region
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    data: &'a [u8],
    shape: FrameShape,
}

impl<'a> FrameView<'a> {
    pub fn new(data: &'a [u8], shape: FrameShape) -> Result<Self, CaptureError> {
        check_len(data.len(), shape)?;
        Ok(Self { data, shape })
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// One row of pixels, `width * channels` bytes
    pub fn row(&self, y: u32) -> Option<&'a [u8]> {
        if y >= self.shape.height {
            return None;
        }
        let row_len = self.shape.row_len();
        let start = y as usize * row_len;
        Some(&self.data[start..start + row_len])
    }

    /// Channel values of the pixel at (y, x)
    pub fn pixel(&self, y: u32, x: u32) -> Option<&'a [u8]> {
        if x >= self.shape.width {
            return None;
        }
        let channels = self.shape.channels as usize;
        let start = x as usize * channels;
        self.row(y).map(|row| &row[start..start + channels])
    }

    /// Per-channel mean over the whole frame
    pub fn channel_means(&self) -> Vec<f64> {
        let channels = self.shape.channels as usize;
        let mut sums = vec![0u64; channels];
        for pixel in self.data.chunks_exact(channels) {
            for (sum, value) in sums.iter_mut().zip(pixel) {
                *sum += u64::from(*value);
            }
        }
        let pixels = (self.data.len() / channels).max(1) as f64;
        sums.into_iter().map(|sum| sum as f64 / pixels).collect()
    }
}

/// Writable view the capture loop overwrites in place
#[derive(Debug)]
pub struct FrameViewMut<'a> {
    data: &'a mut [u8],
    shape: FrameShape,
}

impl<'a> FrameViewMut<'a> {
    pub fn new(data: &'a mut [u8], shape: FrameShape) -> Result<Self, CaptureError> {
        check_len(data.len(), shape)?;
        Ok(Self { data, shape })
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    /// Overwrite the view with a captured frame
    pub fn copy_from(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        if frame.data.len() != self.data.len() {
            return Err(CaptureError::FrameSize {
                expected: self.data.len(),
                actual: frame.data.len(),
            });
        }
        self.data.copy_from_slice(&frame.data);
        Ok(())
    }

    pub fn as_view(&self) -> FrameView<'_> {
        FrameView {
            data: &*self.data,
            shape: self.shape,
        }
    }
}

fn check_len(actual: usize, shape: FrameShape) -> Result<(), CaptureError> {
    let expected = shape.byte_len().unwrap_or(0);
    if actual != expected {
        return Err(CaptureError::FrameSize { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_len_rejects_zero_and_overflow() {
        assert_eq!(FrameShape::new(48, 64, 3).byte_len(), Some(9216));
        assert_eq!(FrameShape::new(0, 64, 3).byte_len(), None);
        assert_eq!(FrameShape::new(u32::MAX, u32::MAX, u32::MAX).byte_len(), None);
    }

    #[test]
    fn view_indexes_row_major() {
        let shape = FrameShape::new(2, 3, 2);
        let data: Vec<u8> = (0..12).collect();
        let view = FrameView::new(&data, shape).unwrap();

        assert_eq!(view.row(1), Some(&data[6..12]));
        assert_eq!(view.pixel(1, 2), Some(&[10u8, 11][..]));
        assert_eq!(view.pixel(0, 3), None);
        assert_eq!(view.row(2), None);
        assert_eq!(view.channel_means(), vec![5.0, 6.0]);
    }

    #[test]
    fn copy_rejects_wrong_frame_size() {
        let shape = FrameShape::new(2, 2, 1);
        let mut buf = [0u8; 4];
        let mut view = FrameViewMut::new(&mut buf, shape).unwrap();

        let short = Frame::new(vec![1u8; 3], shape, 0);
        assert!(matches!(
            view.copy_from(&short),
            Err(CaptureError::FrameSize {
                expected: 4,
                actual: 3
            })
        ));

        view.copy_from(&Frame::new(vec![7u8; 4], shape, 1)).unwrap();
        assert_eq!(buf, [7; 4]);
    }

    #[test]
    fn view_rejects_mismatched_region() {
        let data = [0u8; 5];
        assert!(FrameView::new(&data, FrameShape::new(2, 2, 1)).is_err());
    }
}
