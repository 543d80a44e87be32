//! Software decoder for the screen codec.
//!
//! Keeps a persistent BGRA frame buffer: keyframes replace it, deltas patch
//! the listed tiles in place. Every decoded picture is a full snapshot of
//! the buffer.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::decoder::{DecodedFrame, FrameStorage, VideoDecoder};
use crate::encoder::screen::{SCREEN_BPP, ScreenPrefix};
use crate::error::StreamError;
use crate::transport::AssembledFrame;
use crate::types::{Codec, PixelFormat};

fn le32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Stateful decoder for [`Codec::Screen`] access units.
pub struct ScreenDecoder {
    /// Persistent frame buffer (full screen, updated incrementally).
    frame_buffer: Vec<u8>,
    width: u32,
    height: u32,
    /// A delta can only be applied on top of a keyframe.
    synced: bool,
}

impl ScreenDecoder {
    pub fn new() -> Self {
        Self {
            frame_buffer: Vec::new(),
            width: 0,
            height: 0,
            synced: false,
        }
    }

    /// Current frame buffer contents (empty before the first keyframe).
    pub fn frame_buffer(&self) -> &[u8] {
        &self.frame_buffer
    }

    /// Decode a raw access unit and return the updated frame buffer.
    pub fn apply(&mut self, unit: &[u8]) -> Result<&[u8], StreamError> {
        let (prefix, body) = ScreenPrefix::decode(unit)?;
        if !prefix.keyframe
            && (!self.synced || prefix.width != self.width || prefix.height != self.height)
        {
            debug!(
                synced = self.synced,
                width = prefix.width,
                height = prefix.height,
                "delta without matching reference"
            );
            return Err(StreamError::NeedKeyframe);
        }

        let raw = zstd::decode_all(body)
            .map_err(|e| StreamError::Decoder(format!("zstd decode failed: {e}")))?;

        if prefix.keyframe {
            self.apply_keyframe(prefix.width, prefix.height, &raw)?;
        } else {
            self.apply_delta(&raw)?;
        }
        Ok(&self.frame_buffer)
    }

    fn apply_keyframe(&mut self, width: u32, height: u32, data: &[u8]) -> Result<(), StreamError> {
        let expected = width as usize * height as usize * SCREEN_BPP;
        if data.len() < expected {
            return Err(StreamError::Decoder(format!(
                "keyframe too short: {} < {expected}",
                data.len()
            )));
        }
        if width != self.width || height != self.height {
            debug!(width, height, "screen decoder resized");
            self.width = width;
            self.height = height;
        }
        self.frame_buffer.clear();
        self.frame_buffer.extend_from_slice(&data[..expected]);
        self.synced = true;
        Ok(())
    }

    fn apply_delta(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if data.len() < 4 {
            return Err(StreamError::Decoder("delta too short for block count".into()));
        }
        let count = le32(data, 0) as usize;
        let stride = self.width as usize * SCREEN_BPP;
        let mut offset = 4;

        for _ in 0..count {
            if offset + 16 > data.len() {
                return Err(StreamError::Decoder("delta truncated (block header)".into()));
            }
            let x = le32(data, offset) as usize;
            let y = le32(data, offset + 4) as usize;
            let w = le32(data, offset + 8) as usize;
            let h = le32(data, offset + 12) as usize;
            offset += 16;

            if x + w > self.width as usize || y + h > self.height as usize {
                return Err(StreamError::Decoder(format!(
                    "block {w}x{h}@{x},{y} outside {}x{}",
                    self.width, self.height
                )));
            }
            let row_bytes = w * SCREEN_BPP;
            if offset + row_bytes * h > data.len() {
                return Err(StreamError::Decoder("delta truncated (block data)".into()));
            }
            for row in 0..h {
                let dst = (y + row) * stride + x * SCREEN_BPP;
                self.frame_buffer[dst..dst + row_bytes]
                    .copy_from_slice(&data[offset..offset + row_bytes]);
                offset += row_bytes;
            }
        }
        trace!(blocks = count, "delta applied");
        Ok(())
    }
}

impl Default for ScreenDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoDecoder for ScreenDecoder {
    fn decode(&mut self, frame: &AssembledFrame) -> Result<Option<DecodedFrame>, StreamError> {
        if frame.codec != Codec::Screen {
            return Err(StreamError::UnsupportedCodec(frame.codec));
        }
        let pixels = Bytes::copy_from_slice(self.apply(&frame.payload)?);
        Ok(Some(DecodedFrame {
            frame_number: frame.frame_number,
            width: self.width,
            height: self.height,
            format: PixelFormat::Bgra8,
            storage: FrameStorage::Host(pixels),
        }))
    }

    fn flush(&mut self) {
        self.synced = false;
    }

    fn backend(&self) -> &str {
        "software-screen"
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::encoder::screen::ScreenEncoder;
    use crate::encoder::{EncodedPacket, EncoderConfig, VideoEncoder};
    use crate::types::CapturedFrame;

    fn encoder(w: u32, h: u32) -> ScreenEncoder {
        ScreenEncoder::new(EncoderConfig {
            codec: Codec::Screen,
            width: w,
            height: h,
            ..EncoderConfig::default()
        })
        .unwrap()
    }

    fn encode(enc: &mut ScreenEncoder, pixels: &[u8], w: u32, h: u32) -> EncodedPacket {
        let frame = CapturedFrame {
            width: w,
            height: h,
            pitch: w * 4,
            format: PixelFormat::Bgra8,
            timestamp: Instant::now(),
            data: pixels,
            shared: None,
        };
        enc.encode(&frame).unwrap().unwrap()
    }

    fn assembled(packet: &EncodedPacket) -> AssembledFrame {
        AssembledFrame {
            frame_number: packet.frame_number as u16,
            keyframe: packet.keyframe,
            codec: Codec::Screen,
            payload: packet.data.clone(),
            first_arrival: Instant::now(),
        }
    }

    #[test]
    fn keyframe_roundtrip() {
        let mut enc = encoder(64, 64);
        let pixels = vec![0xCD; 64 * 64 * 4];
        let packet = encode(&mut enc, &pixels, 64, 64);

        let mut dec = ScreenDecoder::new();
        let out = dec.decode(&assembled(&packet)).unwrap().unwrap();
        assert_eq!((out.width, out.height), (64, 64));
        let bytes = out.storage.host_bytes().unwrap();
        assert_eq!(bytes.len(), 64 * 64 * 4);
        assert!(bytes.iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn delta_patches_changed_block() {
        let mut enc = encoder(128, 128);
        let mut pixels = vec![0x42; 128 * 128 * 4];
        let key = encode(&mut enc, &pixels, 128, 128);
        for b in &mut pixels[..4] {
            *b = 0x99;
        }
        let delta = encode(&mut enc, &pixels, 128, 128);
        assert!(!delta.keyframe);

        let mut dec = ScreenDecoder::new();
        dec.decode(&assembled(&key)).unwrap();
        let out = dec.decode(&assembled(&delta)).unwrap().unwrap();
        assert_eq!(out.storage.host_bytes().unwrap().as_ref(), pixels.as_slice());
    }

    #[test]
    fn delta_before_keyframe_needs_keyframe() {
        let mut enc = encoder(64, 64);
        let pixels = vec![1u8; 64 * 64 * 4];
        encode(&mut enc, &pixels, 64, 64);
        let delta = encode(&mut enc, &pixels, 64, 64);

        let mut dec = ScreenDecoder::new();
        assert!(matches!(
            dec.decode(&assembled(&delta)),
            Err(StreamError::NeedKeyframe)
        ));
    }

    #[test]
    fn delta_with_other_dimensions_needs_keyframe() {
        let mut small = encoder(64, 64);
        let mut large = encoder(128, 64);
        let a = vec![0u8; 64 * 64 * 4];
        let b = vec![0u8; 128 * 64 * 4];
        let key = encode(&mut small, &a, 64, 64);
        encode(&mut large, &b, 128, 64);
        let foreign_delta = encode(&mut large, &b, 128, 64);

        let mut dec = ScreenDecoder::new();
        dec.decode(&assembled(&key)).unwrap();
        assert!(matches!(
            dec.decode(&assembled(&foreign_delta)),
            Err(StreamError::NeedKeyframe)
        ));
    }

    #[test]
    fn flush_drops_reference() {
        let mut enc = encoder(64, 64);
        let pixels = vec![7u8; 64 * 64 * 4];
        let key = encode(&mut enc, &pixels, 64, 64);
        let delta = encode(&mut enc, &pixels, 64, 64);

        let mut dec = ScreenDecoder::new();
        dec.decode(&assembled(&key)).unwrap();
        dec.flush();
        assert!(matches!(
            dec.decode(&assembled(&delta)),
            Err(StreamError::NeedKeyframe)
        ));
    }

    #[test]
    fn out_of_bounds_block_is_rejected() {
        let mut dec = ScreenDecoder::new();
        let key_body = zstd::encode_all(&vec![0u8; 16 * 16 * 4][..], 1).unwrap();
        let mut key = ScreenPrefix { keyframe: true, width: 16, height: 16 }.encode().to_vec();
        key.extend_from_slice(&key_body);
        dec.apply(&key).unwrap();

        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_le_bytes());
        for v in [8u32, 8, 16, 16] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        raw.extend_from_slice(&vec![0u8; 16 * 16 * 4]);
        let mut delta = ScreenPrefix { keyframe: false, width: 16, height: 16 }.encode().to_vec();
        delta.extend_from_slice(&zstd::encode_all(&raw[..], 1).unwrap());
        assert!(matches!(dec.apply(&delta), Err(StreamError::Decoder(_))));
    }
}
