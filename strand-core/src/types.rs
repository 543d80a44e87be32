//! Shared types for the capture → encode → decode → render pipeline.
//!
//! These are **internal** frame representations passed between pipeline
//! stages. The wire representation lives in [`crate::protocol`].

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout of raw or decoded pictures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha (DXGI default).
    Bgra8,
    /// 4 bytes per pixel: Blue, Green, Red, padding (most frame buffers).
    Bgrx8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 2 bytes per pixel, RGB 5:6:5 (low-end frame buffers).
    Rgb565,
    /// Planar Y + interleaved UV, 4:2:0 (hardware decoders).
    Nv12,
    /// Planar Y, U, V, 4:2:0 (software decoders).
    I420,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel of the first plane.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Bgrx8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Nv12 | PixelFormat::I420 => 1,
        }
    }

    /// Whether the format is packed 32-bit RGB that a renderer can blit.
    pub const fn is_packed_rgb32(self) -> bool {
        matches!(
            self,
            PixelFormat::Bgra8 | PixelFormat::Bgrx8 | PixelFormat::Rgba8
        )
    }
}

// ── Codec ────────────────────────────────────────────────────────

/// Video codec identity carried by every encoded packet and fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    H264,
    H265,
    /// Block-delta + zstd screen codec, always available in software.
    Screen,
}

impl Codec {
    /// Wire identifier.
    pub const fn as_u8(self) -> u8 {
        match self {
            Codec::H264 => 1,
            Codec::H265 => 2,
            Codec::Screen => 3,
        }
    }
}

impl TryFrom<u8> for Codec {
    type Error = StreamError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Codec::H264),
            2 => Ok(Codec::H265),
            3 => Ok(Codec::Screen),
            other => Err(StreamError::UnknownVariant {
                type_name: "Codec",
                value: other as u64,
            }),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::H264 => write!(f, "H.264"),
            Codec::H265 => write!(f, "H.265"),
            Codec::Screen => write!(f, "screen"),
        }
    }
}

// ── SharedMapping ────────────────────────────────────────────────

/// Reference-counted handle to memory shared between pipeline stages
/// without a CPU copy (e.g. a mapped frame buffer handed to an encoder).
///
/// The owner of the underlying region releases it only when the last
/// handle is dropped.
#[derive(Clone)]
pub struct SharedMapping(Arc<dyn AsRef<[u8]> + Send + Sync>);

impl SharedMapping {
    pub fn new<T>(region: Arc<T>) -> Self
    where
        T: AsRef<[u8]> + Send + Sync + 'static,
    {
        Self(region)
    }

    pub fn len(&self) -> usize {
        self.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsRef<[u8]> for SharedMapping {
    fn as_ref(&self) -> &[u8] {
        AsRef::<[u8]>::as_ref(&*self.0)
    }
}

impl fmt::Debug for SharedMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMapping")
            .field("len", &self.len())
            .finish()
    }
}

// ── CapturedFrame ────────────────────────────────────────────────

/// A raw display frame borrowed from a capture backend's staging buffer.
///
/// The borrow ties the frame to the backend: it must be consumed before
/// the next `capture_frame` call, which reuses the buffer.
#[derive(Debug)]
pub struct CapturedFrame<'a> {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row pitch in **bytes** (may exceed `width * bpp`).
    pub pitch: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Monotonic capture timestamp.
    pub timestamp: Instant,
    /// Pixel data, `pitch * height` bytes.
    pub data: &'a [u8],
    /// Present when `data` is a zero-copy view of shared memory.
    pub shared: Option<SharedMapping>,
}

impl CapturedFrame<'_> {
    /// Total byte size of the bitmap including row padding.
    pub fn byte_len(&self) -> usize {
        self.pitch as usize * self.height as usize
    }

    /// Returns a row slice without trailing padding.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.pitch as usize;
        let len = self.width as usize * self.format.bytes_per_pixel();
        &self.data[start..start + len]
    }

    /// Copy into tightly packed rows (no padding).
    pub fn to_packed(&self) -> Vec<u8> {
        let row_len = self.width as usize * self.format.bytes_per_pixel();
        let mut out = Vec::with_capacity(row_len * self.height as usize);
        for y in 0..self.height {
            out.extend_from_slice(self.row(y));
        }
        out
    }
}

// ── SurfaceHandle ────────────────────────────────────────────────

/// Native window / surface handle supplied by the embedding UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceHandle(pub isize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_wire_ids() {
        for codec in [Codec::H264, Codec::H265, Codec::Screen] {
            assert_eq!(Codec::try_from(codec.as_u8()).unwrap(), codec);
        }
        assert!(Codec::try_from(0).is_err());
    }

    #[test]
    fn packed_copy_strips_padding() {
        // 2×2 BGRA with 12-byte pitch (4 bytes of padding per row).
        let mut data = vec![0u8; 24];
        data[0..8].copy_from_slice(&[1; 8]);
        data[12..20].copy_from_slice(&[2; 8]);
        let frame = CapturedFrame {
            width: 2,
            height: 2,
            pitch: 12,
            format: PixelFormat::Bgra8,
            timestamp: Instant::now(),
            data: &data,
            shared: None,
        };
        let packed = frame.to_packed();
        assert_eq!(packed.len(), 16);
        assert!(packed[..8].iter().all(|&b| b == 1));
        assert!(packed[8..].iter().all(|&b| b == 2));
    }

    #[test]
    fn shared_mapping_exposes_bytes() {
        let mapping = SharedMapping::new(Arc::new(vec![7u8; 32]));
        let clone = mapping.clone();
        assert_eq!(clone.len(), 32);
        assert_eq!(mapping.as_ref()[0], 7);
    }
}
