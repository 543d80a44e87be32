//! Video decoders.
//!
//! [`open`] picks a backend for the session codec. The screen codec always
//! decodes in software; H.264/H.265 go through GStreamer (feature
//! `gstreamer`) with a fixed per-platform priority list, vendor hardware
//! first and `avdec_*` last.

pub mod screen;

#[cfg(feature = "gstreamer")]
pub mod gst;

use std::fmt;

use bytes::Bytes;

use crate::error::StreamError;
use crate::transport::AssembledFrame;
use crate::types::{Codec, PixelFormat};

pub use screen::ScreenDecoder;

// ── DecodedFrame ─────────────────────────────────────────────────

/// Where the pixels of a decoded picture live.
#[derive(Clone)]
pub enum FrameStorage {
    /// CPU memory, tightly packed rows.
    Host(Bytes),
    /// GPU-resident buffer owned by the decoder pipeline (zero-copy).
    #[cfg(feature = "gstreamer")]
    Gpu(gstreamer::Buffer),
}

impl FrameStorage {
    /// CPU bytes, when the storage is host memory.
    pub fn host_bytes(&self) -> Option<&Bytes> {
        match self {
            FrameStorage::Host(b) => Some(b),
            #[cfg(feature = "gstreamer")]
            FrameStorage::Gpu(_) => None,
        }
    }
}

impl fmt::Debug for FrameStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameStorage::Host(b) => write!(f, "Host({} bytes)", b.len()),
            #[cfg(feature = "gstreamer")]
            FrameStorage::Gpu(b) => write!(f, "Gpu({} bytes)", b.size()),
        }
    }
}

/// A decoded picture ready for presentation.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub frame_number: u16,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub storage: FrameStorage,
}

// ── VideoDecoder ─────────────────────────────────────────────────

/// Contract shared by all decoder backends.
pub trait VideoDecoder: Send {
    /// Decode one access unit. `Ok(None)` means the backend needs more
    /// input before it can output a picture.
    ///
    /// Returns [`StreamError::NeedKeyframe`] when reference state is
    /// missing and only a keyframe can resynchronize.
    fn decode(&mut self, frame: &AssembledFrame) -> Result<Option<DecodedFrame>, StreamError>;

    /// Drop reference state (after a reconnect or discontinuity).
    fn flush(&mut self);

    /// Human-readable backend name (element name for GStreamer).
    fn backend(&self) -> &str;
}

/// Open a decoder for `codec` at the given nominal size.
pub fn open(codec: Codec, width: u32, height: u32) -> Result<Box<dyn VideoDecoder>, StreamError> {
    match codec {
        Codec::Screen => Ok(Box::new(ScreenDecoder::new())),
        #[cfg(feature = "gstreamer")]
        Codec::H264 | Codec::H265 => Ok(Box::new(gst::GstDecoder::open(codec, width, height)?)),
        #[cfg(not(feature = "gstreamer"))]
        Codec::H264 | Codec::H265 => {
            tracing::warn!(%codec, width, height, "hardware decoding requires the `gstreamer` feature");
            Err(StreamError::UnsupportedCodec(codec))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_codec_always_opens() {
        let dec = open(Codec::Screen, 640, 480).unwrap();
        assert_eq!(dec.backend(), "software-screen");
    }

    #[cfg(not(feature = "gstreamer"))]
    #[test]
    fn h264_without_gstreamer_is_unsupported() {
        assert!(matches!(
            open(Codec::H264, 640, 480),
            Err(StreamError::UnsupportedCodec(Codec::H264))
        ));
    }

    #[test]
    fn host_storage_exposes_bytes() {
        let s = FrameStorage::Host(Bytes::from_static(b"abcd"));
        assert_eq!(s.host_bytes().unwrap().len(), 4);
        assert_eq!(format!("{s:?}"), "Host(4 bytes)");
    }
}
