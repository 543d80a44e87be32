//! Software screen codec: block-delta detection + zstd.
//!
//! Frames are converted to packed BGRA, compared tile by tile with the
//! previous frame, and only changed tiles are emitted. The body is zstd
//! compressed at a level steered by the bitrate budget.
//!
//! ## Bitstream
//!
//! ```text
//! kind:    u8    0 = keyframe, 1 = delta
//! width:   u32   little-endian
//! height:  u32   little-endian
//! body:    zstd(...)
//!
//! keyframe body: width * 4 * height bytes of packed BGRA
//! delta body:    count:u32, then per tile
//!                x:u32 y:u32 w:u32 h:u32 + w * 4 * h bytes of BGRA
//! ```

use std::cmp;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::encoder::{
    EncodedPacket, EncoderConfig, EncoderKind, EncoderTelemetry, QualityPreset, VideoEncoder,
};
use crate::error::StreamError;
use crate::stats::BandwidthEstimator;
use crate::types::{CapturedFrame, Codec, PixelFormat};

// ── Bitstream prefix ─────────────────────────────────────────────

/// Bytes per pixel of the codec's canonical BGRA layout.
pub const SCREEN_BPP: usize = 4;

const KIND_KEY: u8 = 0;
const KIND_DELTA: u8 = 1;

const MIN_LEVEL: i32 = 1;
const MAX_LEVEL: i32 = 9;

/// Default tile edge in pixels.
pub const DEFAULT_BLOCK_SIZE: usize = 64;

/// Uncompressed prefix of every screen-codec access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenPrefix {
    pub keyframe: bool,
    pub width: u32,
    pub height: u32,
}

impl ScreenPrefix {
    pub const SIZE: usize = 9;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = if self.keyframe { KIND_KEY } else { KIND_DELTA };
        buf[1..5].copy_from_slice(&self.width.to_le_bytes());
        buf[5..9].copy_from_slice(&self.height.to_le_bytes());
        buf
    }

    /// Split an access unit into prefix and compressed body.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), StreamError> {
        if data.len() < Self::SIZE {
            return Err(StreamError::PacketTooShort {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let keyframe = match data[0] {
            KIND_KEY => true,
            KIND_DELTA => false,
            other => {
                return Err(StreamError::UnknownVariant {
                    type_name: "ScreenFrameKind",
                    value: other as u64,
                });
            }
        };
        let le32 = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        Ok((
            Self {
                keyframe,
                width: le32(1),
                height: le32(5),
            },
            &data[Self::SIZE..],
        ))
    }
}

/// A rectangular tile that changed since the previous frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    x: usize,
    y: usize,
    width: usize,
    height: usize,
}

// ── ScreenEncoder ────────────────────────────────────────────────

/// Always-available software encoder for [`Codec::Screen`].
pub struct ScreenEncoder {
    config: EncoderConfig,
    block_size: usize,
    /// Packed BGRA of the last encoded frame (empty before the first).
    previous: Vec<u8>,
    current: Vec<u8>,
    frame_count: u64,
    keyframes: u64,
    frames_since_key: u32,
    force_key: bool,
    refresh_phase: u32,
    level: i32,
    avg_encode_ms: f32,
    output: BandwidthEstimator,
}

impl ScreenEncoder {
    pub fn new(config: EncoderConfig) -> Result<Self, StreamError> {
        config.validate()?;
        if config.codec != Codec::Screen {
            return Err(StreamError::UnsupportedCodec(config.codec));
        }
        let level = match config.preset {
            QualityPreset::LowLatency => 1,
            QualityPreset::Balanced => 3,
            QualityPreset::Quality => 6,
        };
        Ok(Self {
            config,
            block_size: DEFAULT_BLOCK_SIZE,
            previous: Vec::new(),
            current: Vec::new(),
            frame_count: 0,
            keyframes: 0,
            frames_since_key: 0,
            force_key: false,
            refresh_phase: 0,
            level,
            avg_encode_ms: 0.0,
            output: BandwidthEstimator::new(),
        })
    }

    /// Override the tile size (in pixels).
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Current zstd compression level.
    pub fn compression_level(&self) -> i32 {
        self.level
    }

    fn wants_keyframe(&self) -> bool {
        self.previous.is_empty()
            || self.force_key
            || (self.config.intra_refresh_period == 0
                && self.config.gop_length > 0
                && self.frames_since_key >= self.config.gop_length)
    }

    /// Build the uncompressed delta body from `previous` → `current`.
    fn delta_body(&mut self) -> Vec<u8> {
        let w = self.config.width as usize;
        let h = self.config.height as usize;
        let bs = self.block_size;
        let blocks_x = w.div_ceil(bs);
        let blocks_y = h.div_ceil(bs);
        let refresh = self.config.intra_refresh_period;

        let mut changed = Vec::new();
        for by in 0..blocks_y {
            let refresh_row = refresh > 0 && (by as u32) % refresh == self.refresh_phase;
            for bx in 0..blocks_x {
                let block = Block {
                    x: bx * bs,
                    y: by * bs,
                    width: cmp::min(bs, w - bx * bs),
                    height: cmp::min(bs, h - by * bs),
                };
                if refresh_row || self.block_differs(&block) {
                    changed.push(block);
                }
            }
        }
        if refresh > 0 {
            self.refresh_phase = (self.refresh_phase + 1) % refresh;
        }

        let stride = w * SCREEN_BPP;
        let pixels: usize = changed.iter().map(|b| b.width * b.height * SCREEN_BPP).sum();
        let mut body = Vec::with_capacity(4 + changed.len() * 16 + pixels);
        body.extend_from_slice(&(changed.len() as u32).to_le_bytes());
        for block in &changed {
            body.extend_from_slice(&(block.x as u32).to_le_bytes());
            body.extend_from_slice(&(block.y as u32).to_le_bytes());
            body.extend_from_slice(&(block.width as u32).to_le_bytes());
            body.extend_from_slice(&(block.height as u32).to_le_bytes());
            let row_bytes = block.width * SCREEN_BPP;
            for row in block.y..block.y + block.height {
                let offset = row * stride + block.x * SCREEN_BPP;
                body.extend_from_slice(&self.current[offset..offset + row_bytes]);
            }
        }
        trace!(blocks = changed.len(), refresh_phase = self.refresh_phase, "delta body built");
        body
    }

    fn block_differs(&self, block: &Block) -> bool {
        let stride = self.config.width as usize * SCREEN_BPP;
        let left = block.x * SCREEN_BPP;
        let right = left + block.width * SCREEN_BPP;
        (block.y..block.y + block.height).any(|y| {
            let row = y * stride;
            self.current[row + left..row + right] != self.previous[row + left..row + right]
        })
    }

    /// Nudge the zstd level so output stays near the per-frame budget.
    fn adapt_level(&mut self, compressed_len: usize) {
        let budget = self.config.frame_budget_bytes();
        if compressed_len > budget && self.level < MAX_LEVEL {
            self.level += 1;
            debug!(level = self.level, compressed_len, budget, "raising compression level");
        } else if compressed_len < budget / 2 && self.level > MIN_LEVEL {
            self.level -= 1;
        }
    }
}

impl VideoEncoder for ScreenEncoder {
    fn kind(&self) -> EncoderKind {
        EncoderKind::Software
    }

    fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn encode(&mut self, frame: &CapturedFrame<'_>) -> Result<Option<EncodedPacket>, StreamError> {
        if frame.width != self.config.width || frame.height != self.config.height {
            return Err(StreamError::Encoder(format!(
                "frame {}x{} does not match encoder {}x{}",
                frame.width, frame.height, self.config.width, self.config.height
            )));
        }
        let started = Instant::now();
        pack_bgra(frame, &mut self.current)?;

        let keyframe = self.wants_keyframe();
        let prefix = ScreenPrefix {
            keyframe,
            width: frame.width,
            height: frame.height,
        };
        let result = if keyframe {
            zstd::encode_all(self.current.as_slice(), self.level)
        } else {
            let body = self.delta_body();
            zstd::encode_all(body.as_slice(), self.level)
        };
        let compressed =
            result.map_err(|e| StreamError::Encoder(format!("zstd encode failed: {e}")))?;

        let mut data = Vec::with_capacity(ScreenPrefix::SIZE + compressed.len());
        data.extend_from_slice(&prefix.encode());
        data.extend_from_slice(&compressed);

        // Commit state only once the frame is fully encoded.
        std::mem::swap(&mut self.previous, &mut self.current);
        let frame_number = self.frame_count;
        self.frame_count += 1;
        if keyframe {
            self.keyframes += 1;
            self.frames_since_key = 1;
            self.force_key = false;
        } else {
            self.frames_since_key += 1;
        }
        self.adapt_level(compressed.len());
        self.output.record(data.len() as u64);
        let ms = started.elapsed().as_secs_f32() * 1000.0;
        self.avg_encode_ms = if frame_number == 0 {
            ms
        } else {
            self.avg_encode_ms * 0.9 + ms * 0.1
        };

        Ok(Some(EncodedPacket {
            frame_number,
            keyframe,
            codec: Codec::Screen,
            data: Bytes::from(data),
            timestamp: frame.timestamp,
        }))
    }

    fn reconfigure(&mut self, config: &EncoderConfig) -> Result<(), StreamError> {
        self.config.check_reconfigure(config)?;
        if config.intra_refresh_period != self.config.intra_refresh_period {
            self.refresh_phase = 0;
        }
        debug!(
            bitrate_kbps = config.bitrate_kbps,
            gop_length = config.gop_length,
            intra_refresh_period = config.intra_refresh_period,
            "screen encoder reconfigured"
        );
        self.config = config.clone();
        Ok(())
    }

    fn force_idr(&mut self) {
        self.force_key = true;
    }

    fn flush(&mut self) -> Result<Vec<EncodedPacket>, StreamError> {
        Ok(Vec::new())
    }

    fn telemetry(&self) -> EncoderTelemetry {
        EncoderTelemetry {
            backend: "software-screen".into(),
            codec: Some(Codec::Screen),
            frames_encoded: self.frame_count,
            keyframes: self.keyframes,
            target_bitrate_kbps: self.config.bitrate_kbps,
            effective_bitrate_kbps: self.config.bitrate_kbps,
            output_bitrate_kbps: (self.output.estimate_bps() * 8 / 1000) as u32,
            avg_encode_ms: self.avg_encode_ms,
            ..EncoderTelemetry::default()
        }
    }

    fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

// ── Pixel conversion ─────────────────────────────────────────────

/// Convert a captured frame into tightly packed BGRA.
pub fn pack_bgra(frame: &CapturedFrame<'_>, out: &mut Vec<u8>) -> Result<(), StreamError> {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let needed = frame.pitch as usize * h.saturating_sub(1) + w * frame.format.bytes_per_pixel();
    if frame.data.len() < needed || (frame.pitch as usize) < w * frame.format.bytes_per_pixel() {
        return Err(StreamError::Encoder(format!(
            "frame buffer too small: {} bytes for {}x{} pitch {}",
            frame.data.len(),
            w,
            h,
            frame.pitch
        )));
    }
    out.clear();
    out.reserve(w * h * SCREEN_BPP);

    for y in 0..frame.height {
        let row = frame.row(y);
        match frame.format {
            PixelFormat::Bgra8 | PixelFormat::Bgrx8 => out.extend_from_slice(row),
            PixelFormat::Rgba8 => {
                for px in row.chunks_exact(4) {
                    out.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
                }
            }
            PixelFormat::Rgb565 => {
                for px in row.chunks_exact(2) {
                    let v = u16::from_le_bytes([px[0], px[1]]);
                    let r = ((v >> 11) & 0x1F) as u8;
                    let g = ((v >> 5) & 0x3F) as u8;
                    let b = (v & 0x1F) as u8;
                    out.extend_from_slice(&[(b << 3) | (b >> 2), (g << 2) | (g >> 4), (r << 3) | (r >> 2), 0xFF]);
                }
            }
            PixelFormat::Nv12 | PixelFormat::I420 => {
                return Err(StreamError::Encoder(format!(
                    "screen codec cannot take planar {:?} input",
                    frame.format
                )));
            }
        }
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config(w: u32, h: u32) -> EncoderConfig {
        EncoderConfig {
            codec: Codec::Screen,
            width: w,
            height: h,
            ..EncoderConfig::default()
        }
    }

    fn frame(data: &[u8], w: u32, h: u32) -> CapturedFrame<'_> {
        CapturedFrame {
            width: w,
            height: h,
            pitch: w * 4,
            format: PixelFormat::Bgra8,
            timestamp: Instant::now(),
            data,
            shared: None,
        }
    }

    fn delta_block_count(packet: &EncodedPacket) -> u32 {
        let (prefix, body) = ScreenPrefix::decode(&packet.data).unwrap();
        assert!(!prefix.keyframe);
        let raw = zstd::decode_all(body).unwrap();
        u32::from_le_bytes(raw[0..4].try_into().unwrap())
    }

    #[test]
    fn first_frame_is_keyframe_then_deltas() {
        let mut enc = ScreenEncoder::new(config(128, 128)).unwrap();
        let pixels = vec![0xAB; 128 * 128 * 4];

        let first = enc.encode(&frame(&pixels, 128, 128)).unwrap().unwrap();
        assert!(first.keyframe);
        assert_eq!(first.frame_number, 0);
        // Compressed should be smaller (repetitive data).
        assert!(first.data.len() < pixels.len());

        let second = enc.encode(&frame(&pixels, 128, 128)).unwrap().unwrap();
        assert!(!second.keyframe);
        assert_eq!(second.frame_number, 1);
        assert_eq!(delta_block_count(&second), 0);
    }

    #[test]
    fn single_pixel_change_emits_one_block() {
        let mut enc = ScreenEncoder::new(config(128, 128)).unwrap();
        let mut pixels = vec![0u8; 128 * 128 * 4];
        enc.encode(&frame(&pixels, 128, 128)).unwrap();
        pixels[0] = 0xFF;
        let p = enc.encode(&frame(&pixels, 128, 128)).unwrap().unwrap();
        assert_eq!(delta_block_count(&p), 1);
    }

    #[test]
    fn reconfigure_bitrate_keeps_counter_and_no_keyframe() {
        let mut enc = ScreenEncoder::new(config(64, 64)).unwrap();
        let pixels = vec![1u8; 64 * 64 * 4];
        enc.encode(&frame(&pixels, 64, 64)).unwrap();
        enc.encode(&frame(&pixels, 64, 64)).unwrap();

        let next = EncoderConfig {
            bitrate_kbps: 5000,
            ..enc.config().clone()
        };
        enc.reconfigure(&next).unwrap();
        assert_eq!(enc.frame_count(), 2);

        let p = enc.encode(&frame(&pixels, 64, 64)).unwrap().unwrap();
        assert_eq!(p.frame_number, 2);
        assert!(!p.keyframe);
        assert_eq!(enc.config().bitrate_kbps, 5000);
    }

    #[test]
    fn reconfigure_rejects_resolution_change() {
        let mut enc = ScreenEncoder::new(config(64, 64)).unwrap();
        let bigger = EncoderConfig {
            width: 128,
            ..enc.config().clone()
        };
        assert!(enc.reconfigure(&bigger).is_err());
        assert_eq!(enc.config().width, 64);
    }

    #[test]
    fn force_idr_and_gop() {
        let cfg = EncoderConfig {
            gop_length: 3,
            ..config(64, 64)
        };
        let mut enc = ScreenEncoder::new(cfg).unwrap();
        let pixels = vec![0u8; 64 * 64 * 4];
        let keys: Vec<bool> = (0..7)
            .map(|_| enc.encode(&frame(&pixels, 64, 64)).unwrap().unwrap().keyframe)
            .collect();
        assert_eq!(keys, vec![true, false, false, true, false, false, true]);

        enc.force_idr();
        assert!(enc.encode(&frame(&pixels, 64, 64)).unwrap().unwrap().keyframe);
        assert!(!enc.encode(&frame(&pixels, 64, 64)).unwrap().unwrap().keyframe);
    }

    #[test]
    fn intra_refresh_replaces_periodic_keyframes() {
        let cfg = EncoderConfig {
            gop_length: 2,
            intra_refresh_period: 2,
            ..config(64, 256)
        };
        let mut enc = ScreenEncoder::new(cfg).unwrap().with_block_size(64);
        let pixels = vec![0u8; 64 * 256 * 4];
        assert!(enc.encode(&frame(&pixels, 64, 256)).unwrap().unwrap().keyframe);
        for _ in 0..6 {
            let p = enc.encode(&frame(&pixels, 64, 256)).unwrap().unwrap();
            assert!(!p.keyframe);
            // 4 block rows, half of them refreshed per frame.
            assert_eq!(delta_block_count(&p), 2);
        }
    }

    #[test]
    fn mismatched_frame_is_dropped_without_advancing() {
        let mut enc = ScreenEncoder::new(config(64, 64)).unwrap();
        let pixels = vec![0u8; 32 * 32 * 4];
        assert!(enc.encode(&frame(&pixels, 32, 32)).is_err());
        assert_eq!(enc.frame_count(), 0);
    }

    #[test]
    fn tight_budget_raises_level() {
        let cfg = EncoderConfig {
            bitrate_kbps: 1,
            min_bitrate_kbps: 1,
            fps: 60,
            ..config(64, 64)
        };
        let mut enc = ScreenEncoder::new(cfg).unwrap();
        let start = enc.compression_level();
        let noisy: Vec<u8> = (0..64 * 64 * 4).map(|i| (i * 7919 % 251) as u8).collect();
        enc.encode(&frame(&noisy, 64, 64)).unwrap();
        assert!(enc.compression_level() > start);
    }

    #[test]
    fn rgb565_expands_to_bgra() {
        let px = 0xF800u16.to_le_bytes(); // pure red
        let data = [px[0], px[1], px[0], px[1]];
        let f = CapturedFrame {
            width: 2,
            height: 1,
            pitch: 4,
            format: PixelFormat::Rgb565,
            timestamp: Instant::now(),
            data: &data,
            shared: None,
        };
        let mut out = Vec::new();
        pack_bgra(&f, &mut out).unwrap();
        assert_eq!(out, vec![0, 0, 0xFF, 0xFF, 0, 0, 0xFF, 0xFF]);
    }

    #[test]
    fn prefix_rejects_unknown_kind() {
        let mut bytes = ScreenPrefix {
            keyframe: true,
            width: 1,
            height: 1,
        }
        .encode();
        bytes[0] = 9;
        assert!(ScreenPrefix::decode(&bytes).is_err());
        assert!(ScreenPrefix::decode(&bytes[..4]).is_err());
    }

    #[test]
    fn telemetry_reports_counts() {
        let mut enc = ScreenEncoder::new(config(64, 64)).unwrap();
        let pixels = vec![0u8; 64 * 64 * 4];
        enc.encode(&frame(&pixels, 64, 64)).unwrap();
        let t = enc.telemetry();
        assert_eq!(t.frames_encoded, 1);
        assert_eq!(t.keyframes, 1);
        assert_eq!(t.backend, "software-screen");
    }
}
