//! Audio payload decoders. Output is interleaved `f32` in `-1.0..=1.0`.

use tracing::info;

use crate::audio::AudioCodec;
use crate::error::StreamError;

pub trait AudioDecoder: Send {
    /// Decode one packet, appending interleaved samples to `out`.
    /// Returns the number of samples appended.
    fn decode(&mut self, payload: &[u8], out: &mut Vec<f32>) -> Result<usize, StreamError>;

    fn backend(&self) -> &str;
}

pub fn open(codec: AudioCodec, sample_rate: u32, channels: u16) -> Result<Box<dyn AudioDecoder>, StreamError> {
    if channels == 0 || sample_rate == 0 {
        return Err(StreamError::InvalidConfig(format!(
            "audio format {sample_rate} Hz x {channels} channels"
        )));
    }
    let decoder: Box<dyn AudioDecoder> = match codec {
        AudioCodec::Pcm => Box::new(PcmDecoder::new(channels)),
        #[cfg(feature = "opus")]
        AudioCodec::Opus => Box::new(opus::OpusDecoder::new(sample_rate, channels)?),
        #[cfg(not(feature = "opus"))]
        AudioCodec::Opus => {
            return Err(StreamError::Unsupported(
                "Opus audio requires the `opus` feature".into(),
            ));
        }
    };
    info!(backend = decoder.backend(), sample_rate, channels, "audio decoder ready");
    Ok(decoder)
}

// ── PCM ──────────────────────────────────────────────────────────

/// Raw signed 16-bit little-endian PCM.
#[derive(Debug)]
pub struct PcmDecoder {
    channels: u16,
}

impl PcmDecoder {
    pub fn new(channels: u16) -> Self {
        Self { channels }
    }
}

impl AudioDecoder for PcmDecoder {
    fn decode(&mut self, payload: &[u8], out: &mut Vec<f32>) -> Result<usize, StreamError> {
        let frame_bytes = 2 * self.channels as usize;
        if payload.len() % frame_bytes != 0 {
            return Err(StreamError::Audio(format!(
                "PCM payload of {} bytes is not a whole number of {}-channel frames",
                payload.len(),
                self.channels
            )));
        }
        let before = out.len();
        out.extend(
            payload
                .chunks_exact(2)
                .map(|s| i16::from_le_bytes([s[0], s[1]]) as f32 / 32768.0),
        );
        Ok(out.len() - before)
    }

    fn backend(&self) -> &str {
        "pcm-s16le"
    }
}

// ── Opus ─────────────────────────────────────────────────────────

#[cfg(feature = "opus")]
mod opus {
    use audiopus::coder::Decoder;
    use audiopus::packet::Packet;
    use audiopus::{Channels, MutSignals, SampleRate};

    use super::AudioDecoder;
    use crate::error::StreamError;

    /// Longest Opus frame: 120 ms at 48 kHz.
    const MAX_FRAME_SAMPLES: usize = 5760;

    pub struct OpusDecoder {
        decoder: Decoder,
        channels: usize,
        scratch: Vec<f32>,
    }

    impl OpusDecoder {
        pub fn new(sample_rate: u32, channels: u16) -> Result<Self, StreamError> {
            let rate = match sample_rate {
                8000 => SampleRate::Hz8000,
                12000 => SampleRate::Hz12000,
                16000 => SampleRate::Hz16000,
                24000 => SampleRate::Hz24000,
                48000 => SampleRate::Hz48000,
                other => {
                    return Err(StreamError::InvalidConfig(format!(
                        "Opus does not support {other} Hz"
                    )));
                }
            };
            let layout = match channels {
                1 => Channels::Mono,
                2 => Channels::Stereo,
                other => {
                    return Err(StreamError::InvalidConfig(format!(
                        "Opus supports 1 or 2 channels, not {other}"
                    )));
                }
            };
            let decoder = Decoder::new(rate, layout)
                .map_err(|e| StreamError::Audio(format!("Opus decoder init failed: {e}")))?;
            Ok(Self {
                decoder,
                channels: channels as usize,
                scratch: vec![0.0; MAX_FRAME_SAMPLES * channels as usize],
            })
        }
    }

    impl AudioDecoder for OpusDecoder {
        fn decode(&mut self, payload: &[u8], out: &mut Vec<f32>) -> Result<usize, StreamError> {
            let packet = Packet::try_from(payload)
                .map_err(|e| StreamError::Audio(format!("invalid Opus packet: {e:?}")))?;
            let signals = MutSignals::try_from(&mut self.scratch)
                .map_err(|e| StreamError::Audio(format!("Opus output buffer: {e:?}")))?;
            let per_channel = self
                .decoder
                .decode_float(Some(packet), signals, false)
                .map_err(|e| StreamError::Audio(format!("Opus decode failed: {e}")))?;
            let n = per_channel * self.channels;
            out.extend_from_slice(&self.scratch[..n]);
            Ok(n)
        }

        fn backend(&self) -> &str {
            "opus"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_scales_to_unit_range() {
        let mut dec = PcmDecoder::new(2);
        let mut out = Vec::new();
        let payload: Vec<u8> = [i16::MIN, 0, 16384, i16::MAX]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        assert_eq!(dec.decode(&payload, &mut out).unwrap(), 4);
        assert_eq!(out[0], -1.0);
        assert_eq!(out[1], 0.0);
        assert_eq!(out[2], 0.5);
        assert!(out[3] < 1.0 && out[3] > 0.999);
    }

    #[test]
    fn pcm_rejects_partial_frames() {
        let mut dec = PcmDecoder::new(2);
        assert!(matches!(
            dec.decode(&[0, 0, 0], &mut Vec::new()),
            Err(StreamError::Audio(_))
        ));
    }

    #[test]
    fn zero_channels_is_invalid() {
        assert!(matches!(
            open(AudioCodec::Pcm, 48_000, 0),
            Err(StreamError::InvalidConfig(_))
        ));
    }

    #[cfg(not(feature = "opus"))]
    #[test]
    fn opus_needs_feature() {
        assert!(matches!(
            open(AudioCodec::Opus, 48_000, 2),
            Err(StreamError::Unsupported(_))
        ));
    }
}
