//! Shared GStreamer plumbing for the hardware encoder backends.
//!
//! Pipeline shape: `appsrc → [converters] → encoder → parser → capsfilter
//! → appsink`. Raw frames are pushed into appsrc and access units are
//! pulled synchronously from appsink with a short timeout.

use std::time::Duration;

use bytes::Bytes;
use gstreamer::prelude::*;
use gstreamer::{self as gst, ClockTime, ElementFactory};
use gstreamer_app::{AppSink, AppSrc};
use tracing::{debug, error, info, warn};

use crate::error::StreamError;
use crate::types::{CapturedFrame, Codec, PixelFormat};

/// How the encoder element expects its `bitrate` to be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BitrateUnit {
    /// `bitrate` property in kbit/s (nvh264enc, vah264enc).
    Kbps,
    /// `bitrate` property in bit/s (nvv4l2h264enc).
    Bps,
    /// Mainline V4L2 M2M: `extra-controls` structure.
    ExtraControls,
}

pub(crate) fn init() -> Result<(), StreamError> {
    gst::init().map_err(|e| StreamError::Encoder(format!("GStreamer init failed: {e}")))
}

/// Element creation is the only reliable availability probe: a plugin
/// may be registered while its driver or device is missing.
pub(crate) fn can_instantiate(name: &str) -> bool {
    if init().is_err() {
        return false;
    }
    match ElementFactory::make(name).build() {
        Ok(elem) => {
            let _ = elem.set_state(gst::State::Null);
            true
        }
        Err(_) => false,
    }
}

pub(crate) fn make(name: &str) -> Result<gst::Element, StreamError> {
    ElementFactory::make(name)
        .build()
        .map_err(|e| StreamError::Encoder(format!("failed to create {name}: {e}")))
}

fn caps_format(format: PixelFormat) -> &'static str {
    match format {
        PixelFormat::Bgra8 => "BGRA",
        PixelFormat::Bgrx8 => "BGRx",
        PixelFormat::Rgba8 => "RGBA",
        PixelFormat::Rgb565 => "RGB16",
        PixelFormat::Nv12 => "NV12",
        PixelFormat::I420 => "I420",
    }
}

pub(crate) fn parser_for(codec: Codec) -> Result<(&'static str, &'static str), StreamError> {
    match codec {
        Codec::H264 => Ok(("h264parse", "video/x-h264")),
        Codec::H265 => Ok(("h265parse", "video/x-h265")),
        Codec::Screen => Err(StreamError::UnsupportedCodec(codec)),
    }
}

// ── EncoderPipeline ──────────────────────────────────────────────

pub(crate) struct EncoderPipeline {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
    encoder: gst::Element,
    bitrate_unit: BitrateUnit,
    width: u32,
    height: u32,
    fps: u32,
    input_format: Option<PixelFormat>,
    pushed: u64,
}

impl EncoderPipeline {
    /// Build and start a pipeline around an already-configured encoder.
    pub(crate) fn new(
        codec: Codec,
        encoder: gst::Element,
        converters: Vec<gst::Element>,
        bitrate_unit: BitrateUnit,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Self, StreamError> {
        let (parser_name, media_type) = parser_for(codec)?;
        let pipeline = gst::Pipeline::new();

        let appsrc = ElementFactory::make("appsrc")
            .name("src")
            .build()
            .map_err(|e| StreamError::Encoder(format!("failed to create appsrc: {e}")))?
            .dynamic_cast::<AppSrc>()
            .map_err(|_| StreamError::Encoder("appsrc cast failed".into()))?;
        appsrc.set_is_live(true);
        appsrc.set_format(gst::Format::Time);
        appsrc.set_property("block", false);
        appsrc.set_property("min-latency", 0i64);
        appsrc.set_property("max-latency", 0i64);

        // Inline parameter sets with every keyframe so a fresh decoder can
        // start from any IDR.
        let parser = ElementFactory::make(parser_name)
            .property_from_str("config-interval", "-1")
            .build()
            .map_err(|e| StreamError::Encoder(format!("failed to create {parser_name}: {e}")))?;
        let out_caps = gst::Caps::builder(media_type)
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let capsfilter = ElementFactory::make("capsfilter")
            .property("caps", &out_caps)
            .build()
            .map_err(|e| StreamError::Encoder(format!("failed to create capsfilter: {e}")))?;

        let appsink = ElementFactory::make("appsink")
            .name("sink")
            .property("sync", false)
            .property("async", false)
            .property("emit-signals", false)
            .build()
            .map_err(|e| StreamError::Encoder(format!("failed to create appsink: {e}")))?
            .dynamic_cast::<AppSink>()
            .map_err(|_| StreamError::Encoder("appsink cast failed".into()))?;

        let mut chain: Vec<&gst::Element> = vec![appsrc.upcast_ref()];
        chain.extend(converters.iter());
        chain.extend([&encoder, &parser, &capsfilter, appsink.upcast_ref()]);

        pipeline
            .add_many(chain.iter().copied())
            .map_err(|e| StreamError::Encoder(format!("failed to add elements: {e}")))?;
        gst::Element::link_many(chain.iter().copied())
            .map_err(|e| StreamError::Encoder(format!("failed to link pipeline: {e}")))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| StreamError::Encoder(format!("failed to start pipeline: {e}")))?;

        info!(
            encoder = %encoder.name(),
            width, height, fps, "encoder pipeline started"
        );

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            encoder,
            bitrate_unit,
            width,
            height,
            fps,
            input_format: None,
            pushed: 0,
        })
    }

    /// Push a raw frame; uses the zero-copy mapping when one is attached.
    pub(crate) fn push(&mut self, frame: &CapturedFrame<'_>) -> Result<(), StreamError> {
        self.check_bus()?;
        match self.input_format {
            None => {
                let caps = gst::Caps::builder("video/x-raw")
                    .field("format", caps_format(frame.format))
                    .field("width", self.width as i32)
                    .field("height", self.height as i32)
                    .field("framerate", gst::Fraction::new(self.fps as i32, 1))
                    .build();
                self.appsrc.set_caps(Some(&caps));
                self.input_format = Some(frame.format);
            }
            Some(fmt) if fmt != frame.format => {
                return Err(StreamError::Encoder(format!(
                    "input format changed from {fmt:?} to {:?}",
                    frame.format
                )));
            }
            Some(_) => {}
        }

        let tight = frame.pitch as usize == frame.width as usize * frame.format.bytes_per_pixel();
        let mut buffer = match &frame.shared {
            Some(mapping) if tight => gst::Buffer::from_slice(mapping.clone()),
            _ if tight => gst::Buffer::from_slice(frame.data[..frame.byte_len()].to_vec()),
            _ => gst::Buffer::from_slice(frame.to_packed()),
        };
        let frame_ns = 1_000_000_000 / self.fps.max(1) as u64;
        if let Some(buf) = buffer.get_mut() {
            buf.set_pts(ClockTime::from_nseconds(self.pushed * frame_ns));
            buf.set_duration(ClockTime::from_nseconds(frame_ns));
        }
        self.pushed += 1;

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| StreamError::Encoder(format!("appsrc push failed: {e:?}")))?;
        Ok(())
    }

    /// Pull one access unit, waiting at most `timeout`.
    pub(crate) fn pull(&self, timeout: Duration) -> Result<Option<(Bytes, bool)>, StreamError> {
        let Some(sample) = self
            .appsink
            .try_pull_sample(ClockTime::from_nseconds(timeout.as_nanos() as u64))
        else {
            return Ok(None);
        };
        let buffer = sample
            .buffer()
            .ok_or_else(|| StreamError::Encoder("sample without buffer".into()))?;
        let keyframe = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
        let map = buffer
            .map_readable()
            .map_err(|e| StreamError::Encoder(format!("buffer map failed: {e}")))?;
        Ok(Some((Bytes::copy_from_slice(map.as_slice()), keyframe)))
    }

    /// Send end-of-stream and collect everything still queued.
    pub(crate) fn drain(&self) -> Result<Vec<(Bytes, bool)>, StreamError> {
        let _ = self.appsrc.end_of_stream();
        let mut out = Vec::new();
        while let Some(unit) = self.pull(Duration::from_millis(100))? {
            out.push(unit);
        }
        Ok(out)
    }

    pub(crate) fn force_keyframe(&self) {
        let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        if !self.appsink.send_event(event) {
            warn!("force-key-unit event was not handled");
        }
    }

    pub(crate) fn set_bitrate(&self, kbps: u32) {
        match self.bitrate_unit {
            BitrateUnit::Kbps => self.encoder.set_property("bitrate", kbps),
            BitrateUnit::Bps => self.encoder.set_property("bitrate", kbps.saturating_mul(1000)),
            BitrateUnit::ExtraControls => {
                let controls = gst::Structure::builder("controls")
                    .field("video_bitrate", (kbps.saturating_mul(1000)) as i32)
                    .build();
                self.encoder.set_property("extra-controls", &controls);
            }
        }
        debug!(kbps, encoder = %self.encoder.name(), "bitrate updated");
    }

    pub(crate) fn encoder_name(&self) -> String {
        self.encoder
            .factory()
            .map(|f| f.name().to_string())
            .unwrap_or_default()
    }

    /// Surface asynchronous pipeline errors.
    fn check_bus(&self) -> Result<(), StreamError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Warning]) {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    error!(
                        source = ?err.src().map(|s| s.name().to_string()),
                        error = %err.error(),
                        debug = ?err.debug(),
                        "encoder pipeline error"
                    );
                    return Err(StreamError::Encoder(err.error().to_string()));
                }
                gst::MessageView::Warning(w) => {
                    warn!(warning = %w.error(), "encoder pipeline warning");
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Drop for EncoderPipeline {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
        debug!("encoder pipeline released");
    }
}
