//! Hardware-first H.264/H.265 decoding through GStreamer.
//!
//! Pipeline: `appsrc → parser → decoder → appsink`. Decoders are probed in
//! a fixed priority order per platform; the first one that instantiates and
//! reaches PLAYING wins. Pictures left in GPU memory (CUDA, D3D11, VA) are
//! handed on as [`FrameStorage::Gpu`] without a download.

use std::time::Duration;

use bytes::Bytes;
use gstreamer::prelude::*;
use gstreamer::{self as gst, ClockTime, ElementFactory};
use gstreamer_app::{AppSink, AppSrc};
use gstreamer_video::{VideoFormat, VideoInfo};
use tracing::{debug, error, info, warn};

use crate::decoder::{DecodedFrame, FrameStorage, VideoDecoder};
use crate::encoder::gst::parser_for;
use crate::error::StreamError;
use crate::transport::AssembledFrame;
use crate::types::{Codec, PixelFormat};

const PULL_TIMEOUT: Duration = Duration::from_millis(10);

/// Decoder elements in priority order for `codec` on this platform.
pub fn candidates(codec: Codec) -> &'static [&'static str] {
    #[cfg(windows)]
    const H264: &[&str] = &["nvh264dec", "d3d11h264dec", "dxvah264dec", "avdec_h264"];
    #[cfg(windows)]
    const H265: &[&str] = &["nvh265dec", "d3d11h265dec", "dxvah265dec", "avdec_h265"];
    #[cfg(not(windows))]
    const H264: &[&str] = &["nvh264dec", "vah264dec", "vaapih264dec", "avdec_h264"];
    #[cfg(not(windows))]
    const H265: &[&str] = &["nvh265dec", "vah265dec", "vaapih265dec", "avdec_h265"];
    match codec {
        Codec::H264 => H264,
        Codec::H265 => H265,
        Codec::Screen => &[],
    }
}

/// Decoder output formats the renderers understand.
pub fn pixel_format(format: VideoFormat) -> Option<PixelFormat> {
    match format {
        VideoFormat::Bgra => Some(PixelFormat::Bgra8),
        VideoFormat::Bgrx => Some(PixelFormat::Bgrx8),
        VideoFormat::Rgba => Some(PixelFormat::Rgba8),
        VideoFormat::Rgb16 => Some(PixelFormat::Rgb565),
        VideoFormat::Nv12 => Some(PixelFormat::Nv12),
        VideoFormat::I420 => Some(PixelFormat::I420),
        _ => None,
    }
}

fn decoder_err(what: &str, e: impl std::fmt::Display) -> StreamError {
    StreamError::Decoder(format!("{what}: {e}"))
}

/// Row geometry (bytes per row, rows) of each plane.
fn plane_layout(format: PixelFormat, width: usize, height: usize) -> Vec<(usize, usize)> {
    let half_h = height.div_ceil(2);
    match format {
        PixelFormat::Nv12 => vec![(width, height), (width.div_ceil(2) * 2, half_h)],
        PixelFormat::I420 => {
            let half_w = width.div_ceil(2);
            vec![(width, height), (half_w, half_h), (half_w, half_h)]
        }
        packed => vec![(width * packed.bytes_per_pixel(), height)],
    }
}

// ── GstDecoder ───────────────────────────────────────────────────

/// GStreamer decoder session for one codec.
pub struct GstDecoder {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
    element: String,
    codec: Codec,
    pushed: u64,
    /// Frame numbers pushed but not yet pulled.
    pending: std::collections::VecDeque<u16>,
}

impl GstDecoder {
    /// Probe [`candidates`] and start the first decoder that works.
    pub fn open(codec: Codec, width: u32, height: u32) -> Result<Self, StreamError> {
        gst::init().map_err(|e| decoder_err("GStreamer init failed", e))?;
        let mut last_err = StreamError::UnsupportedCodec(codec);
        for name in candidates(codec) {
            if ElementFactory::find(name).is_none() {
                debug!(decoder = name, "decoder plugin not installed");
                continue;
            }
            match Self::build(codec, name) {
                Ok(dec) => {
                    info!(decoder = name, %codec, width, height, "video decoder ready");
                    return Ok(dec);
                }
                Err(e) => {
                    warn!(decoder = name, error = %e, "decoder failed to start");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn build(codec: Codec, name: &str) -> Result<Self, StreamError> {
        let (parser_name, media_type) =
            parser_for(codec).map_err(|_| StreamError::UnsupportedCodec(codec))?;
        let pipeline = gst::Pipeline::new();

        let caps = gst::Caps::builder(media_type)
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let appsrc = ElementFactory::make("appsrc")
            .property("caps", &caps)
            .property("is-live", true)
            .property("do-timestamp", true)
            .property_from_str("format", "time")
            .build()
            .map_err(|e| decoder_err("failed to create appsrc", e))?
            .dynamic_cast::<AppSrc>()
            .map_err(|_| StreamError::Decoder("appsrc cast failed".into()))?;

        let parser = ElementFactory::make(parser_name)
            .build()
            .map_err(|e| decoder_err("failed to create parser", e))?;
        let decoder = ElementFactory::make(name)
            .build()
            .map_err(|e| decoder_err("failed to create decoder", e))?;

        let appsink = ElementFactory::make("appsink")
            .property("sync", false)
            .property("emit-signals", false)
            .property("max-buffers", 2u32)
            .property("drop", true)
            .build()
            .map_err(|e| decoder_err("failed to create appsink", e))?
            .dynamic_cast::<AppSink>()
            .map_err(|_| StreamError::Decoder("appsink cast failed".into()))?;

        let chain: [&gst::Element; 4] = [appsrc.upcast_ref(), &parser, &decoder, appsink.upcast_ref()];
        pipeline
            .add_many(chain)
            .map_err(|e| decoder_err("failed to add elements", e))?;
        gst::Element::link_many(chain).map_err(|e| decoder_err("failed to link pipeline", e))?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| decoder_err("failed to start pipeline", e))?;

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            element: name.to_string(),
            codec,
            pushed: 0,
            pending: Default::default(),
        })
    }

    fn check_bus(&self) -> Result<(), StreamError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
            if let gst::MessageView::Error(err) = msg.view() {
                error!(error = %err.error(), debug = ?err.debug(), "decoder pipeline error");
                return Err(StreamError::Decoder(err.error().to_string()));
            }
        }
        Ok(())
    }

    fn convert(&self, sample: &gst::Sample, frame_number: u16) -> Result<DecodedFrame, StreamError> {
        let caps = sample
            .caps()
            .ok_or_else(|| StreamError::Decoder("sample without caps".into()))?;
        let info = VideoInfo::from_caps(caps).map_err(|e| decoder_err("bad output caps", e))?;
        let format = pixel_format(info.format()).ok_or_else(|| {
            StreamError::Decoder(format!("unsupported decoder output {:?}", info.format()))
        })?;
        let buffer = sample
            .buffer_owned()
            .ok_or_else(|| StreamError::Decoder("sample without buffer".into()))?;

        let on_gpu = caps
            .features(0)
            .is_some_and(|f| !f.contains("memory:SystemMemory") && f.size() > 0);
        let storage = if on_gpu {
            FrameStorage::Gpu(buffer)
        } else {
            let map = buffer
                .map_readable()
                .map_err(|e| decoder_err("buffer map failed", e))?;
            let data = map.as_slice();
            let layout = plane_layout(format, info.width() as usize, info.height() as usize);
            let mut packed = Vec::with_capacity(layout.iter().map(|(r, n)| r * n).sum());
            for (plane, (row_bytes, rows)) in layout.into_iter().enumerate() {
                let offset = info.offset()[plane];
                let stride = info.stride()[plane] as usize;
                for row in 0..rows {
                    let start = offset + row * stride;
                    let end = start + row_bytes;
                    if end > data.len() {
                        return Err(StreamError::Decoder("decoded buffer truncated".into()));
                    }
                    packed.extend_from_slice(&data[start..end]);
                }
            }
            FrameStorage::Host(Bytes::from(packed))
        };

        Ok(DecodedFrame {
            frame_number,
            width: info.width(),
            height: info.height(),
            format,
            storage,
        })
    }
}

impl VideoDecoder for GstDecoder {
    fn decode(&mut self, frame: &AssembledFrame) -> Result<Option<DecodedFrame>, StreamError> {
        if frame.codec != self.codec {
            return Err(StreamError::UnsupportedCodec(frame.codec));
        }
        self.check_bus()?;

        let mut buffer = gst::Buffer::from_slice(frame.payload.clone());
        if let Some(buf) = buffer.get_mut() {
            buf.set_offset(self.pushed);
            if !frame.keyframe {
                buf.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }
        self.pushed += 1;
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| StreamError::Decoder(format!("appsrc push failed: {e:?}")))?;
        self.pending.push_back(frame.frame_number);

        let Some(sample) = self
            .appsink
            .try_pull_sample(ClockTime::from_nseconds(PULL_TIMEOUT.as_nanos() as u64))
        else {
            return Ok(None);
        };
        let number = self.pending.pop_front().unwrap_or(frame.frame_number);
        self.convert(&sample, number).map(Some)
    }

    fn flush(&mut self) {
        let _ = self.pipeline.send_event(gst::event::FlushStart::new());
        let _ = self.pipeline.send_event(gst::event::FlushStop::new(true));
        self.pending.clear();
        debug!(decoder = %self.element, "decoder flushed");
    }

    fn backend(&self) -> &str {
        &self.element
    }
}

impl Drop for GstDecoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_decoder_is_last_resort() {
        for codec in [Codec::H264, Codec::H265] {
            let list = candidates(codec);
            assert!(list[0].starts_with("nv"));
            assert!(list.last().unwrap().starts_with("avdec_"));
        }
        assert!(candidates(Codec::Screen).is_empty());
    }

    #[test]
    fn output_format_mapping() {
        assert_eq!(pixel_format(VideoFormat::Nv12), Some(PixelFormat::Nv12));
        assert_eq!(pixel_format(VideoFormat::Bgrx), Some(PixelFormat::Bgrx8));
        assert_eq!(pixel_format(VideoFormat::P01010le), None);
    }

    #[test]
    fn plane_layouts() {
        assert_eq!(plane_layout(PixelFormat::Bgra8, 3, 2), vec![(12, 2)]);
        assert_eq!(plane_layout(PixelFormat::Nv12, 5, 3), vec![(5, 3), (6, 2)]);
        assert_eq!(
            plane_layout(PixelFormat::I420, 4, 4),
            vec![(4, 4), (2, 2), (2, 2)]
        );
    }
}
