//! V4L2 camera driver with memory-mapped device buffers

use bytes::BytesMut;
use tracing::{info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{decoder, Camera, Frame, FrameShape};
use crate::camera::V4l2Format;
use crate::error::CaptureError;

/// V4L2 capture producing packed RGB24 frames
///
/// The device is opened in `start`, inside the capture process, so streaming
/// state never lives in the orchestrator.
pub struct V4l2Camera {
    path: String,
    format: V4l2Format,
    buffer_count: u32,
    shape: FrameShape,
    device: Option<Box<Device>>,
    stream: Option<MmapStream<'static>>,
    sequence: u64,
}

impl V4l2Camera {
    pub fn new(
        path: String,
        format: V4l2Format,
        buffer_count: u32,
        shape: FrameShape,
    ) -> Result<Self, CaptureError> {
        if shape.channels != 3 {
            return Err(CaptureError::UnsupportedDevice(format!(
                "{} delivers RGB24, got {} channels",
                path, shape.channels
            )));
        }
        Ok(Self {
            path,
            format,
            buffer_count,
            shape,
            device: None,
            stream: None,
            sequence: 0,
        })
    }
}

// SAFETY: the mapped device buffers are only touched through `&mut self`,
// and the whole camera moves into a single capture process.
unsafe impl Send for V4l2Camera {}

impl Camera for V4l2Camera {
    fn start(&mut self) -> Result<(), CaptureError> {
        info!("Initializing V4L2 capture: {}", self.path);

        let device = Device::with_path(&self.path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::Device(format!(
                "{} doesn't support video capture",
                self.path
            )));
        }

        let mut fmt = device.format()?;
        fmt.width = self.shape.width;
        fmt.height = self.shape.height;
        fmt.fourcc = match self.format {
            V4l2Format::Mjpeg => FourCC::new(b"MJPG"),
            V4l2Format::Yuyv => FourCC::new(b"YUYV"),
            V4l2Format::Rgb24 => FourCC::new(b"RGB3"),
        };
        let applied = device.set_format(&fmt)?;
        if applied.width != self.shape.width || applied.height != self.shape.height {
            return Err(CaptureError::Device(format!(
                "{} negotiated {}x{}, configured {}x{}",
                self.path, applied.width, applied.height, self.shape.width, self.shape.height
            )));
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, self.buffer_count)?;
        self.stream = Some(stream);
        self.device = Some(Box::new(device));
        info!("Capture stream started with {} buffers", self.buffer_count);
        Ok(())
    }

    #[instrument(skip(self), fields(path = %self.path))]
    fn read_once(&mut self) -> Result<Frame, CaptureError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CaptureError::Device("stream not started".into()))?;

        let (buf, meta) = stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());

        let mut data = BytesMut::zeroed(self.shape.byte_len().unwrap_or(0));
        decoder::decode_frame(&buf[..used], self.format, &mut data)?;

        let frame = Frame::new(data.freeze(), self.shape, self.sequence);
        self.sequence += 1;
        Ok(frame)
    }
}
