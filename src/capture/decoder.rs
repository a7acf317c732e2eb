use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use crate::camera::V4l2Format;
use crate::error::CaptureError;

/// Decode one device buffer into packed RGB24
pub fn decode_frame(data: &[u8], format: V4l2Format, out: &mut [u8]) -> Result<(), CaptureError> {
    match format {
        V4l2Format::Mjpeg => {
            let mut decoder = Decoder::new(data);
            let pixels = decoder
                .decode()
                .map_err(|e| CaptureError::Decode(e.to_string()))?;
            match decoder.info().map(|info| info.pixel_format) {
                Some(JpegPixelFormat::RGB24) => copy_exact(&pixels, out),
                Some(other) => Err(CaptureError::Decode(format!(
                    "unsupported JPEG pixel format {:?}",
                    other
                ))),
                None => Err(CaptureError::Decode("missing JPEG header".into())),
            }
        }
        // Already in RGB format
        V4l2Format::Rgb24 => copy_exact(data, out),
        V4l2Format::Yuyv => yuyv_to_rgb(data, out),
    }
}

fn copy_exact(src: &[u8], out: &mut [u8]) -> Result<(), CaptureError> {
    let src = src.get(..out.len()).ok_or(CaptureError::FrameSize {
        expected: out.len(),
        actual: src.len(),
    })?;
    out.copy_from_slice(src);
    Ok(())
}

/// YUYV 4:2:2 (two pixels per four bytes) to RGB24, BT.601 limited range
fn yuyv_to_rgb(data: &[u8], out: &mut [u8]) -> Result<(), CaptureError> {
    let pixels = out.len() / 3;
    if data.len() < pixels * 2 {
        return Err(CaptureError::FrameSize {
            expected: pixels * 2,
            actual: data.len(),
        });
    }

    for (yuyv, rgb) in data.chunks_exact(4).zip(out.chunks_exact_mut(6)) {
        let u = i32::from(yuyv[1]) - 128;
        let v = i32::from(yuyv[3]) - 128;
        for (luma, px) in [yuyv[0], yuyv[2]].into_iter().zip(rgb.chunks_exact_mut(3)) {
            let c = 298 * (i32::from(luma) - 16);
            px[0] = clamp((c + 409 * v + 128) >> 8);
            px[1] = clamp((c - 100 * u - 208 * v + 128) >> 8);
            px[2] = clamp((c + 516 * u + 128) >> 8);
        }
    }
    Ok(())
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_grey_maps_to_grey() {
        // Y=126, U=V=128 is mid grey
        let data = [126u8, 128, 126, 128];
        let mut out = [0u8; 6];
        decode_frame(&data, V4l2Format::Yuyv, &mut out).unwrap();
        assert!(out.iter().all(|v| (127..=129).contains(v)));
    }

    #[test]
    fn short_rgb_buffer_is_rejected() {
        let mut out = [0u8; 6];
        assert!(decode_frame(&[0u8; 3], V4l2Format::Rgb24, &mut out).is_err());
    }
}
