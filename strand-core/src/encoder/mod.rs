//! Video encoders.
//!
//! Every backend implements [`VideoEncoder`]. One backend is chosen at
//! session start by [`open`], which probes [`EncoderKind`]s in priority
//! order (or honours a preferred kind from configuration) and returns the
//! first that opens for the requested codec.
//!
//! | Kind       | Codecs            | Availability                         |
//! |------------|-------------------|--------------------------------------|
//! | `Nvenc`    | H.264, H.265      | `gstreamer` feature + NVENC / VA-API |
//! | `V4l2`     | H.264, H.265      | `gstreamer` feature + V4L2 M2M       |
//! | `Software` | Screen            | always                               |

pub mod screen;
pub mod thermal;

#[cfg(feature = "gstreamer")]
pub(crate) mod gst;
#[cfg(feature = "gstreamer")]
pub mod nvenc;
#[cfg(feature = "gstreamer")]
pub mod v4l2;

use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StreamError;
use crate::types::{CapturedFrame, Codec};

pub use screen::ScreenEncoder;
pub use thermal::{ThermalMonitor, ThermalPolicy, ThermalReading, ThermalState};

// ── Configuration ────────────────────────────────────────────────

/// Speed / quality trade-off handed to hardware presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityPreset {
    #[default]
    LowLatency,
    Balanced,
    Quality,
}

/// Encoder session parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    /// Frames between periodic keyframes (0 = only on demand).
    pub gop_length: u32,
    /// Rows of blocks are refreshed over this many frames instead of
    /// sending periodic keyframes (0 = disabled).
    pub intra_refresh_period: u32,
    pub preset: QualityPreset,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: Codec::Screen,
            width: 1920,
            height: 1080,
            fps: 60,
            bitrate_kbps: 20_000,
            min_bitrate_kbps: 2_000,
            max_bitrate_kbps: 50_000,
            gop_length: 600,
            intra_refresh_period: 0,
            preset: QualityPreset::LowLatency,
        }
    }
}

impl EncoderConfig {
    /// Reject configurations no backend can honour.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.width == 0 || self.height == 0 {
            return Err(StreamError::InvalidConfig(format!(
                "resolution {}x{} has a zero dimension",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(StreamError::InvalidConfig("fps must be non-zero".into()));
        }
        if self.min_bitrate_kbps > self.max_bitrate_kbps {
            return Err(StreamError::InvalidConfig(format!(
                "min bitrate {} exceeds max bitrate {}",
                self.min_bitrate_kbps, self.max_bitrate_kbps
            )));
        }
        if self.bitrate_kbps == 0 {
            return Err(StreamError::InvalidConfig("bitrate must be non-zero".into()));
        }
        Ok(())
    }

    /// Target bitrate clamped to the configured bounds.
    pub fn clamped_bitrate(&self, kbps: u32) -> u32 {
        kbps.clamp(self.min_bitrate_kbps, self.max_bitrate_kbps)
    }

    /// Per-frame byte budget implied by bitrate and fps.
    pub fn frame_budget_bytes(&self) -> usize {
        (self.bitrate_kbps as usize * 1000 / 8) / self.fps.max(1) as usize
    }

    /// Check that `next` only changes live-adjustable parameters.
    pub fn check_reconfigure(&self, next: &EncoderConfig) -> Result<(), StreamError> {
        next.validate()?;
        if next.width != self.width || next.height != self.height {
            return Err(StreamError::InvalidConfig(format!(
                "resolution change {}x{} -> {}x{} needs a new encoder",
                self.width, self.height, next.width, next.height
            )));
        }
        if next.codec != self.codec {
            return Err(StreamError::InvalidConfig(format!(
                "codec change {} -> {} needs a new encoder",
                self.codec, next.codec
            )));
        }
        Ok(())
    }
}

// ── EncodedPacket ────────────────────────────────────────────────

/// One compressed access unit.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// Monotonic per-session counter; the wire carries its low 16 bits.
    pub frame_number: u64,
    pub keyframe: bool,
    pub codec: Codec,
    pub data: Bytes,
    /// Capture time of the source frame.
    pub timestamp: Instant,
}

// ── Telemetry ────────────────────────────────────────────────────

/// Encoder health snapshot, also sent to the viewer as `HOST_STATS`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncoderTelemetry {
    pub backend: String,
    pub codec: Option<Codec>,
    pub frames_encoded: u64,
    pub keyframes: u64,
    pub target_bitrate_kbps: u32,
    /// Bitrate actually applied after thermal scaling.
    pub effective_bitrate_kbps: u32,
    /// Measured output bitrate.
    pub output_bitrate_kbps: u32,
    pub avg_encode_ms: f32,
    /// Encoder utilization 0..1 when the backend reports it.
    pub utilization: Option<f32>,
    pub temperature_c: Option<f32>,
    pub power_mode: Option<u32>,
    pub throttled: bool,
}

// ── VideoEncoder ─────────────────────────────────────────────────

/// Contract shared by all encoder backends.
///
/// Construction initializes the session; dropping it releases every
/// hardware resource.
pub trait VideoEncoder: Send {
    fn kind(&self) -> EncoderKind;

    fn config(&self) -> &EncoderConfig;

    /// Encode one frame. `Ok(None)` means the backend produced no output
    /// for this input yet. On error the frame is dropped and the frame
    /// counter does not advance.
    fn encode(&mut self, frame: &CapturedFrame<'_>) -> Result<Option<EncodedPacket>, StreamError>;

    /// Apply new rate-control parameters to the running session. Never
    /// resets the frame counter and never forces a keyframe; resolution or
    /// codec changes are rejected.
    fn reconfigure(&mut self, config: &EncoderConfig) -> Result<(), StreamError>;

    /// Make the next encoded frame a keyframe.
    fn force_idr(&mut self);

    /// Drain any frames still held by the backend.
    fn flush(&mut self) -> Result<Vec<EncodedPacket>, StreamError>;

    fn telemetry(&self) -> EncoderTelemetry;

    /// Frames successfully encoded so far.
    fn frame_count(&self) -> u64;
}

// ── EncoderKind ──────────────────────────────────────────────────

/// Encoder backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    Nvenc,
    V4l2,
    Software,
}

impl EncoderKind {
    /// Probe order used when no preference is configured.
    pub const PROBE_ORDER: [EncoderKind; 3] =
        [EncoderKind::Nvenc, EncoderKind::V4l2, EncoderKind::Software];

    /// Whether this backend can encode `codec` on this machine.
    pub fn is_codec_supported(self, codec: Codec) -> bool {
        match self {
            EncoderKind::Software => codec == Codec::Screen,
            #[cfg(feature = "gstreamer")]
            EncoderKind::Nvenc => nvenc::supports(codec),
            #[cfg(feature = "gstreamer")]
            EncoderKind::V4l2 => v4l2::supports(codec),
            #[cfg(not(feature = "gstreamer"))]
            EncoderKind::Nvenc | EncoderKind::V4l2 => false,
        }
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderKind::Nvenc => write!(f, "nvenc"),
            EncoderKind::V4l2 => write!(f, "v4l2"),
            EncoderKind::Software => write!(f, "software"),
        }
    }
}

/// Open the first backend that supports `config.codec`.
///
/// A `preferred` kind is tried first; failures are logged and probing
/// continues with the default order.
pub fn open(
    config: &EncoderConfig,
    preferred: Option<EncoderKind>,
) -> Result<Box<dyn VideoEncoder>, StreamError> {
    config.validate()?;

    let order = preferred
        .into_iter()
        .chain(EncoderKind::PROBE_ORDER.into_iter().filter(|k| Some(*k) != preferred));

    for kind in order {
        if !kind.is_codec_supported(config.codec) {
            continue;
        }
        match open_kind(kind, config) {
            Ok(encoder) => {
                info!(
                    backend = %kind,
                    codec = %config.codec,
                    width = config.width,
                    height = config.height,
                    fps = config.fps,
                    bitrate_kbps = config.bitrate_kbps,
                    "encoder opened"
                );
                return Ok(encoder);
            }
            Err(e) => warn!(backend = %kind, error = %e, "encoder backend failed to open"),
        }
    }
    Err(StreamError::UnsupportedCodec(config.codec))
}

fn open_kind(kind: EncoderKind, config: &EncoderConfig) -> Result<Box<dyn VideoEncoder>, StreamError> {
    match kind {
        EncoderKind::Software => Ok(Box::new(ScreenEncoder::new(config.clone())?)),
        #[cfg(feature = "gstreamer")]
        EncoderKind::Nvenc => Ok(Box::new(nvenc::NvencEncoder::new(config.clone())?)),
        #[cfg(feature = "gstreamer")]
        EncoderKind::V4l2 => Ok(Box::new(v4l2::V4l2Encoder::new(
            config.clone(),
            ThermalMonitor::system(),
            ThermalPolicy::default(),
        )?)),
        #[cfg(not(feature = "gstreamer"))]
        EncoderKind::Nvenc | EncoderKind::V4l2 => Err(StreamError::Unsupported(format!(
            "{kind} encoder requires the `gstreamer` feature"
        ))),
    }
}

// ── Tests ────────────────────────────────────────────────────────
