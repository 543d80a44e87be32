//! Software conversion of decoded pictures to packed BGRA for blitting.
//!
//! YUV uses BT.601 limited-range integer coefficients, which is what the
//! software decoders emit for desktop content.

use crate::decoder::{DecodedFrame, FrameStorage};
use crate::error::StreamError;
use crate::types::PixelFormat;

/// Byte size of a tightly packed picture.
pub fn packed_len(format: PixelFormat, width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    let (half_w, half_h) = (w.div_ceil(2), h.div_ceil(2));
    match format {
        PixelFormat::Nv12 => w * h + half_w * 2 * half_h,
        PixelFormat::I420 => w * h + 2 * half_w * half_h,
        packed => w * h * packed.bytes_per_pixel(),
    }
}

/// Convert `frame` into `out` as `width * height` BGRA pixels.
///
/// GPU-resident storage is mapped for reading, which downloads it.
pub fn to_bgra(frame: &DecodedFrame, out: &mut Vec<u8>) -> Result<(), StreamError> {
    match &frame.storage {
        FrameStorage::Host(bytes) => convert(frame, bytes, out),
        #[cfg(feature = "gstreamer")]
        FrameStorage::Gpu(buffer) => {
            let map = buffer
                .map_readable()
                .map_err(|e| StreamError::Render(format!("GPU frame is not mappable: {e}")))?;
            convert(frame, map.as_slice(), out)
        }
    }
}

fn convert(frame: &DecodedFrame, src: &[u8], out: &mut Vec<u8>) -> Result<(), StreamError> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let need = packed_len(frame.format, frame.width, frame.height);
    if src.len() < need {
        return Err(StreamError::Render(format!(
            "{:?} frame {}x{} needs {need} bytes, got {}",
            frame.format,
            frame.width,
            frame.height,
            src.len()
        )));
    }

    out.clear();
    out.reserve(w * h * 4);
    match frame.format {
        PixelFormat::Bgra8 | PixelFormat::Bgrx8 => out.extend_from_slice(&src[..need]),
        PixelFormat::Rgba8 => {
            for px in src[..need].chunks_exact(4) {
                out.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
            }
        }
        PixelFormat::Rgb565 => {
            for px in src[..need].chunks_exact(2) {
                let v = u16::from_le_bytes([px[0], px[1]]);
                let r = ((v >> 11) & 0x1F) as u8;
                let g = ((v >> 5) & 0x3F) as u8;
                let b = (v & 0x1F) as u8;
                out.extend_from_slice(&[(b << 3) | (b >> 2), (g << 2) | (g >> 4), (r << 3) | (r >> 2), 0xFF]);
            }
        }
        PixelFormat::Nv12 => {
            let (luma, chroma) = src.split_at(w * h);
            let uv_stride = w.div_ceil(2) * 2;
            for y in 0..h {
                for x in 0..w {
                    let uv = (y / 2) * uv_stride + (x / 2) * 2;
                    out.extend_from_slice(&yuv_to_bgra(luma[y * w + x], chroma[uv], chroma[uv + 1]));
                }
            }
        }
        PixelFormat::I420 => {
            let half_w = w.div_ceil(2);
            let chroma_len = half_w * h.div_ceil(2);
            let (luma, rest) = src.split_at(w * h);
            let (u_plane, v_plane) = rest.split_at(chroma_len);
            for y in 0..h {
                for x in 0..w {
                    let c = (y / 2) * half_w + x / 2;
                    out.extend_from_slice(&yuv_to_bgra(luma[y * w + x], u_plane[c], v_plane[c]));
                }
            }
        }
    }
    Ok(())
}

fn yuv_to_bgra(y: u8, u: u8, v: u8) -> [u8; 4] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    let r = clamp((298 * c + 409 * e + 128) >> 8);
    let g = clamp((298 * c - 100 * d - 208 * e + 128) >> 8);
    let b = clamp((298 * c + 516 * d + 128) >> 8);
    [b, g, r, 0xFF]
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn frame(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> DecodedFrame {
        DecodedFrame {
            frame_number: 0,
            width,
            height,
            format,
            storage: FrameStorage::Host(Bytes::from(data)),
        }
    }

    #[test]
    fn packed_sizes() {
        assert_eq!(packed_len(PixelFormat::Bgra8, 4, 2), 32);
        assert_eq!(packed_len(PixelFormat::Nv12, 4, 4), 24);
        assert_eq!(packed_len(PixelFormat::I420, 3, 3), 9 + 2 * 4);
    }

    #[test]
    fn rgba_is_swizzled() {
        let mut out = Vec::new();
        to_bgra(&frame(PixelFormat::Rgba8, 1, 1, vec![1, 2, 3, 4]), &mut out).unwrap();
        assert_eq!(out, vec![3, 2, 1, 4]);
    }

    #[test]
    fn limited_range_black_and_white() {
        assert_eq!(yuv_to_bgra(16, 128, 128), [0, 0, 0, 0xFF]);
        assert_eq!(yuv_to_bgra(235, 128, 128), [255, 255, 255, 0xFF]);
    }

    #[test]
    fn nv12_grey_picture() {
        // 2x2 luma at mid grey + one UV pair.
        let mut out = Vec::new();
        to_bgra(&frame(PixelFormat::Nv12, 2, 2, vec![126, 126, 126, 126, 128, 128]), &mut out).unwrap();
        assert_eq!(out.len(), 16);
        assert!(out.chunks_exact(4).all(|px| px[0] == px[1] && px[1] == px[2]));
    }

    #[test]
    fn short_buffer_is_a_render_error() {
        let mut out = Vec::new();
        assert!(matches!(
            to_bgra(&frame(PixelFormat::Bgra8, 2, 2, vec![0; 8]), &mut out),
            Err(StreamError::Render(_))
        ));
    }
}
