//! Desktop hardware encoder: NVENC (`nvh264enc` / `nvh265enc`), falling
//! back to VA-API (`vah264enc` / `vah265enc`) on non-NVIDIA GPUs.

use std::time::{Duration, Instant};

use gstreamer::ElementFactory;
use tracing::{debug, info, warn};

use crate::encoder::gst::{self, BitrateUnit, EncoderPipeline};
use crate::encoder::{
    EncodedPacket, EncoderConfig, EncoderKind, EncoderTelemetry, QualityPreset, VideoEncoder,
};
use crate::error::StreamError;
use crate::stats::BandwidthEstimator;
use crate::types::{CapturedFrame, Codec};

const PULL_TIMEOUT: Duration = Duration::from_millis(20);

fn candidates(codec: Codec) -> &'static [&'static str] {
    match codec {
        Codec::H264 => &["nvh264enc", "vah264enc"],
        Codec::H265 => &["nvh265enc", "vah265enc"],
        Codec::Screen => &[],
    }
}

pub(crate) fn supports(codec: Codec) -> bool {
    candidates(codec).iter().any(|name| gst::can_instantiate(name))
}

fn preset_name(preset: QualityPreset) -> &'static str {
    match preset {
        QualityPreset::LowLatency => "low-latency-hq",
        QualityPreset::Balanced => "hq",
        QualityPreset::Quality => "hq",
    }
}

fn build_element(name: &str, config: &EncoderConfig) -> Result<gstreamer::Element, StreamError> {
    let gop = if config.gop_length == 0 {
        i32::MAX
    } else {
        config.gop_length as i32
    };
    let result = if name.starts_with("nv") {
        ElementFactory::make(name)
            .property_from_str("preset", preset_name(config.preset))
            .property_from_str("rc-mode", "cbr-ld-hq")
            .property("bitrate", config.bitrate_kbps)
            .property("gop-size", gop)
            .property("zerolatency", true)
            .property("rc-lookahead", 0u32)
            .property("bframes", 0u32)
            .property("vbv-buffer-size", config.bitrate_kbps / config.fps.max(1))
            .build()
    } else {
        ElementFactory::make(name)
            .property_from_str("rate-control", "cbr")
            .property("bitrate", config.bitrate_kbps)
            .property("key-int-max", config.gop_length)
            .property("target-usage", 7u32)
            .build()
    };
    let element = result.map_err(|e| StreamError::Encoder(format!("failed to create {name}: {e}")))?;
    if config.intra_refresh_period > 0 && element.has_property("intra-refresh") {
        element.set_property("intra-refresh", true);
    }
    Ok(element)
}

/// NVENC / VA-API encoder behind a GStreamer pipeline.
pub struct NvencEncoder {
    config: EncoderConfig,
    pipeline: EncoderPipeline,
    frame_count: u64,
    keyframes: u64,
    /// Capture timestamps of frames still inside the encoder.
    in_flight: std::collections::VecDeque<Instant>,
    avg_encode_ms: f32,
    output: BandwidthEstimator,
}

impl NvencEncoder {
    pub fn new(config: EncoderConfig) -> Result<Self, StreamError> {
        config.validate()?;
        gst::init()?;
        let mut last_err = StreamError::UnsupportedCodec(config.codec);
        for name in candidates(config.codec) {
            if !gst::can_instantiate(name) {
                debug!(encoder = name, "encoder element not available");
                continue;
            }
            let attempt = build_element(name, &config).and_then(|element| {
                // VA-API encoders need an explicit colour conversion.
                let converters = if name.starts_with("va") {
                    vec![gst::make("videoconvert")?]
                } else {
                    Vec::new()
                };
                EncoderPipeline::new(
                    config.codec,
                    element,
                    converters,
                    BitrateUnit::Kbps,
                    config.width,
                    config.height,
                    config.fps,
                )
            });
            match attempt {
                Ok(pipeline) => {
                    info!(encoder = name, codec = %config.codec, "hardware encoder ready");
                    return Ok(Self {
                        config,
                        pipeline,
                        frame_count: 0,
                        keyframes: 0,
                        in_flight: Default::default(),
                        avg_encode_ms: 0.0,
                        output: BandwidthEstimator::new(),
                    });
                }
                Err(e) => {
                    warn!(encoder = name, error = %e, "encoder element failed to start");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn finish(&mut self, data: bytes::Bytes, keyframe: bool) -> EncodedPacket {
        let timestamp = self.in_flight.pop_front().unwrap_or_else(Instant::now);
        let frame_number = self.frame_count;
        self.frame_count += 1;
        if keyframe {
            self.keyframes += 1;
        }
        self.output.record(data.len() as u64);
        let ms = timestamp.elapsed().as_secs_f32() * 1000.0;
        self.avg_encode_ms = self.avg_encode_ms * 0.9 + ms * 0.1;
        EncodedPacket {
            frame_number,
            keyframe,
            codec: self.config.codec,
            data,
            timestamp,
        }
    }
}

impl VideoEncoder for NvencEncoder {
    fn kind(&self) -> EncoderKind {
        EncoderKind::Nvenc
    }

    fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn encode(&mut self, frame: &CapturedFrame<'_>) -> Result<Option<EncodedPacket>, StreamError> {
        self.pipeline.push(frame)?;
        self.in_flight.push_back(frame.timestamp);
        match self.pipeline.pull(PULL_TIMEOUT)? {
            Some((data, keyframe)) => Ok(Some(self.finish(data, keyframe))),
            None => Ok(None),
        }
    }

    fn reconfigure(&mut self, config: &EncoderConfig) -> Result<(), StreamError> {
        self.config.check_reconfigure(config)?;
        if config.bitrate_kbps != self.config.bitrate_kbps {
            self.pipeline.set_bitrate(config.bitrate_kbps);
        }
        self.config = config.clone();
        Ok(())
    }

    fn force_idr(&mut self) {
        self.pipeline.force_keyframe();
    }

    fn flush(&mut self) -> Result<Vec<EncodedPacket>, StreamError> {
        let units = self.pipeline.drain()?;
        Ok(units
            .into_iter()
            .map(|(data, keyframe)| self.finish(data, keyframe))
            .collect())
    }

    fn telemetry(&self) -> EncoderTelemetry {
        EncoderTelemetry {
            backend: self.pipeline.encoder_name(),
            codec: Some(self.config.codec),
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
