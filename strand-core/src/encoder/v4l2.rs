//! Embedded hardware encoder on V4L2 memory-to-memory devices.
//!
//! Jetson boards expose `nvv4l2h264enc` / `nvv4l2h265enc` fed through
//! `nvvidconv` into NVMM memory; mainline kernels expose `v4l2h264enc`.
//! Frames that carry a shared zero-copy mapping are wrapped directly into
//! GStreamer buffers without a CPU copy.
//!
//! The effective bitrate follows the board's thermal state: every
//! [`THERMAL_POLL`] the monitor is sampled and the policy's scaled bitrate
//! is applied if it changed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use gstreamer::ElementFactory;
use tracing::{info, warn};

use crate::encoder::gst::{self, BitrateUnit, EncoderPipeline};
use crate::encoder::thermal::{ThermalMonitor, ThermalPolicy, ThermalReading};
use crate::encoder::{EncodedPacket, EncoderConfig, EncoderKind, EncoderTelemetry, VideoEncoder};
use crate::error::StreamError;
use crate::stats::BandwidthEstimator;
use crate::types::{CapturedFrame, Codec};

const PULL_TIMEOUT: Duration = Duration::from_millis(20);

/// Interval between thermal samples.
pub const THERMAL_POLL: Duration = Duration::from_secs(1);

struct Variant {
    encoder: &'static str,
    /// Jetson encoders need NVMM input via nvvidconv.
    nvmm: bool,
    unit: BitrateUnit,
}

fn variants(codec: Codec) -> &'static [Variant] {
    const H264: &[Variant] = &[
        Variant {
            encoder: "nvv4l2h264enc",
            nvmm: true,
            unit: BitrateUnit::Bps,
        },
        Variant {
            encoder: "v4l2h264enc",
            nvmm: false,
            unit: BitrateUnit::ExtraControls,
        },
    ];
    const H265: &[Variant] = &[
        Variant {
            encoder: "nvv4l2h265enc",
            nvmm: true,
            unit: BitrateUnit::Bps,
        },
        Variant {
            encoder: "v4l2h265enc",
            nvmm: false,
            unit: BitrateUnit::ExtraControls,
        },
    ];
    match codec {
        Codec::H264 => H264,
        Codec::H265 => H265,
        Codec::Screen => &[],
    }
}

pub(crate) fn supports(codec: Codec) -> bool {
    variants(codec).iter().any(|v| gst::can_instantiate(v.encoder))
}

fn build(variant: &Variant, config: &EncoderConfig, kbps: u32) -> Result<EncoderPipeline, StreamError> {
    let built = if variant.nvmm {
        ElementFactory::make(variant.encoder)
            .property("bitrate", kbps.saturating_mul(1000))
            .property("iframeinterval", config.gop_length.max(1))
            .property("insert-sps-pps", true)
            .property("maxperf-enable", true)
            .build()
    } else {
        ElementFactory::make(variant.encoder).build()
    };
    let encoder = built
        .map_err(|e| StreamError::Encoder(format!("failed to create {}: {e}", variant.encoder)))?;

    let converters = if variant.nvmm {
        let caps = gstreamer::Caps::builder("video/x-raw")
            .features(["memory:NVMM"])
            .field("format", "NV12")
            .build();
        vec![
            gst::make("nvvidconv")?,
            ElementFactory::make("capsfilter")
                .property("caps", &caps)
                .build()
                .map_err(|e| StreamError::Encoder(format!("failed to create capsfilter: {e}")))?,
        ]
    } else {
        vec![gst::make("videoconvert")?]
    };

    let pipeline = EncoderPipeline::new(
        config.codec,
        encoder,
        converters,
        variant.unit,
        config.width,
        config.height,
        config.fps,
    )?;
    if !variant.nvmm {
        pipeline.set_bitrate(kbps);
    }
    Ok(pipeline)
}

/// V4L2 M2M encoder with thermal-aware rate control.
pub struct V4l2Encoder {
    config: EncoderConfig,
    pipeline: EncoderPipeline,
    monitor: ThermalMonitor,
    policy: ThermalPolicy,
    reading: ThermalReading,
    last_poll: Instant,
    effective_kbps: u32,
    frame_count: u64,
    keyframes: u64,
    in_flight: VecDeque<Instant>,
    busy: Duration,
    busy_since: Instant,
    avg_encode_ms: f32,
    output: BandwidthEstimator,
}

impl V4l2Encoder {
    pub fn new(
        config: EncoderConfig,
        monitor: ThermalMonitor,
        policy: ThermalPolicy,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        gst::init()?;
        let reading = monitor.read();
        let effective_kbps = config.clamped_bitrate(policy.effective_bitrate(config.bitrate_kbps, &reading));

        let mut last_err = StreamError::UnsupportedCodec(config.codec);
        for variant in variants(config.codec) {
            if !gst::can_instantiate(variant.encoder) {
                continue;
            }
            match build(variant, &config, effective_kbps) {
                Ok(pipeline) => {
                    info!(
                        encoder = variant.encoder,
                        effective_kbps,
                        temp_c = ?reading.max_temp_c,
                        power_mode = ?reading.power_mode,
                        "V4L2 encoder ready"
                    );
                    let now = Instant::now();
                    return Ok(Self {
                        config,
                        pipeline,
                        monitor,
                        policy,
                        reading,
                        last_poll: now,
                        effective_kbps,
                        frame_count: 0,
                        keyframes: 0,
                        in_flight: VecDeque::new(),
                        busy: Duration::ZERO,
                        busy_since: now,
                        avg_encode_ms: 0.0,
                        output: BandwidthEstimator::new(),
                    });
                }
                Err(e) => {
                    warn!(encoder = variant.encoder, error = %e, "V4L2 encoder failed to start");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Re-sample thermals and re-apply the scaled bitrate when it moved.
    fn poll_thermals(&mut self, now: Instant) {
        if now.duration_since(self.last_poll) < THERMAL_POLL {
            return;
        }
        self.last_poll = now;
        self.reading = self.monitor.read();
        self.apply_bitrate();
    }

    fn apply_bitrate(&mut self) {
        let target = self
            .config
            .clamped_bitrate(self.policy.effective_bitrate(self.config.bitrate_kbps, &self.reading));
        if target != self.effective_kbps {
            info!(
                from = self.effective_kbps,
                to = target,
                temp_c = ?self.reading.max_temp_c,
                power_mode = ?self.reading.power_mode,
                "thermal bitrate adjustment"
            );
            self.pipeline.set_bitrate(target);
            self.effective_kbps = target;
        }
    }
}

impl VideoEncoder for V4l2Encoder {
    fn kind(&self) -> EncoderKind {
        EncoderKind::V4l2
    }

    fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn encode(&mut self, frame: &CapturedFrame<'_>) -> Result<Option<EncodedPacket>, StreamError> {
        let started = Instant::now();
        self.poll_thermals(started);
        self.pipeline.push(frame)?;
        self.in_flight.push_back(frame.timestamp);

        let pulled = self.pipeline.pull(PULL_TIMEOUT)?;
        self.busy += started.elapsed();
        let Some((data, keyframe)) = pulled else {
            return Ok(None);
        };

        let timestamp = self.in_flight.pop_front().unwrap_or(started);
        let frame_number = self.frame_count;
        self.frame_count += 1;
        if keyframe {
            self.keyframes += 1;
        }
        self.output.record(data.len() as u64);
        let ms = started.elapsed().as_secs_f32() * 1000.0;
        self.avg_encode_ms = self.avg_encode_ms * 0.9 + ms * 0.1;

        Ok(Some(EncodedPacket {
            frame_number,
            keyframe,
            codec: self.config.codec,
            data,
            timestamp,
        }))
    }

    fn reconfigure(&mut self, config: &EncoderConfig) -> Result<(), StreamError> {
        self.config.check_reconfigure(config)?;
        self.config = config.clone();
        self.apply_bitrate();
        Ok(())
    }

    fn force_idr(&mut self) {
        self.pipeline.force_keyframe();
    }

    fn flush(&mut self) -> Result<Vec<EncodedPacket>, StreamError> {
        let units = self.pipeline.drain()?;
        let mut out = Vec::with_capacity(units.len());
        for (data, keyframe) in units {
            let timestamp = self.in_flight.pop_front().unwrap_or_else(Instant::now);
            out.push(EncodedPacket {
                frame_number: self.frame_count,
                keyframe,
                codec: self.config.codec,
                data,
                timestamp,
            });
            self.frame_count += 1;
        }
        Ok(out)
    }

    fn telemetry(&self) -> EncoderTelemetry {
        let wall = self.busy_since.elapsed().as_secs_f32();
        let utilization = if wall > 0.0 {
            Some((self.busy.as_secs_f32() / wall).min(1.0))
        } else {
            None
        };
        EncoderTelemetry {
            backend: self.pipeline.encoder_name(),
            codec: Some(self.config.codec),
            frames_encoded: self.frame_count,
            keyframes: self.keyframes,
            target_bitrate_kbps: self.config.bitrate_kbps,
            effective_bitrate_kbps: self.effective_kbps,
            output_bitrate_kbps: (self.output.estimate_bps() * 8 / 1000) as u32,
            avg_encode_ms: self.avg_encode_ms,
            utilization,
            temperature_c: self.reading.max_temp_c,
            power_mode: self.reading.power_mode,
            throttled: self.effective_kbps < self.config.bitrate_kbps,
        }
    }

    fn frame_count(&self) -> u64 {
        self.frame_count
    }
}
