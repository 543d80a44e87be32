//! Viewer audio path: AUDIO datagrams → decode → playback ring → output.
//!
//! Audio is never retransmitted. Packets are played strictly in arrival
//! order; anything older than or equal to the last played sequence is
//! dropped, so a late packet can never rewind playback.

pub mod decoder;
pub mod playback;

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StreamError;
use crate::protocol::control::AudioHeader;
use crate::protocol::seq_newer;

pub use decoder::{AudioDecoder, PcmDecoder};
pub use playback::{NullOutput, PlaybackRing, RingStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    /// Signed 16-bit little-endian interleaved PCM.
    Pcm,
    #[default]
    Opus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    /// Undecoded packets held between receive and audio threads; the
    /// oldest is dropped when full.
    pub queue_packets: usize,
    /// Playback ring length in milliseconds.
    pub ring_ms: u32,
    /// Play through the default sound device (feature `cpal`).
    pub device_output: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            codec: AudioCodec::Opus,
            sample_rate: 48_000,
            channels: 2,
            queue_packets: 32,
            ring_ms: 200,
            device_output: true,
        }
    }
}

// ── Ordering ─────────────────────────────────────────────────────

/// Accepts only sequences newer than the last accepted one.
#[derive(Debug, Clone, Default)]
pub struct SequenceFilter {
    last: Option<u16>,
}

impl SequenceFilter {
    pub fn accept(&mut self, sequence: u16) -> bool {
        match self.last {
            Some(last) if !seq_newer(sequence, last) => false,
            _ => {
                self.last = Some(sequence);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

// ── AudioPlayer ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioStats {
    pub played_packets: u64,
    /// Late or duplicate packets.
    pub stale_packets: u64,
    pub decode_errors: u64,
    pub ring: RingStats,
}

enum Output {
    Null(NullOutput),
    #[cfg(feature = "cpal")]
    Device(playback::CpalOutput),
}

/// Decoder, ordering filter, ring and output for one session.
///
/// Lives on the viewer's audio thread for its whole life.
pub struct AudioPlayer {
    decoder: Box<dyn AudioDecoder>,
    filter: SequenceFilter,
    ring: Arc<PlaybackRing>,
    output: Output,
    scratch: Vec<f32>,
    stats: AudioStats,
}

impl AudioPlayer {
    pub fn open(config: &AudioConfig) -> Result<Self, StreamError> {
        let decoder = decoder::open(config.codec, config.sample_rate, config.channels)?;
        let ring = Arc::new(PlaybackRing::for_duration(
            config.ring_ms,
            config.sample_rate,
            config.channels,
        ));
        let output = Self::open_output(config, &ring);
        Ok(Self {
            decoder,
            filter: SequenceFilter::default(),
            ring,
            output,
            scratch: Vec::new(),
            stats: AudioStats::default(),
        })
    }

    #[cfg(feature = "cpal")]
    fn open_output(config: &AudioConfig, ring: &Arc<PlaybackRing>) -> Output {
        if config.device_output {
            match playback::CpalOutput::open(Arc::clone(ring), config.sample_rate, config.channels) {
                Ok(out) => return Output::Device(out),
                Err(e) => tracing::warn!(error = %e, "no audio device, playing to null output"),
            }
        }
        Output::Null(NullOutput::new(Arc::clone(ring), config.sample_rate, config.channels))
    }

    #[cfg(not(feature = "cpal"))]
    fn open_output(config: &AudioConfig, ring: &Arc<PlaybackRing>) -> Output {
        if config.device_output {
            debug!("built without `cpal`, playing to null output");
        }
        Output::Null(NullOutput::new(Arc::clone(ring), config.sample_rate, config.channels))
    }

    /// Handle one AUDIO datagram. Stale packets are dropped silently;
    /// decode failures are counted and skipped.
    pub fn play(&mut self, header: AudioHeader, payload: &[u8]) {
        if !self.filter.accept(header.sequence) {
            self.stats.stale_packets += 1;
            return;
        }
        self.scratch.clear();
        match self.decoder.decode(payload, &mut self.scratch) {
            Ok(_) => {
                self.ring.push(&self.scratch);
                self.stats.played_packets += 1;
            }
            Err(e) => {
                self.stats.decode_errors += 1;
                debug!(seq = header.sequence, error = %e, "audio packet dropped");
            }
        }
    }

    /// Advance the null output's clock. No-op for device output.
    pub fn pump(&mut self, now: Instant) {
        match &mut self.output {
            Output::Null(out) => out.pump_at(now),
            #[cfg(feature = "cpal")]
            Output::Device(_) => {}
        }
    }

    /// Forget ordering and buffered audio after a reconnect.
    pub fn reset(&mut self) {
        self.filter.reset();
        self.ring.clear();
    }

    pub fn stats(&self) -> AudioStats {
        AudioStats {
            ring: self.ring.stats(),
            ..self.stats
        }
    }

    pub fn ring(&self) -> &Arc<PlaybackRing> {
        &self.ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_config() -> AudioConfig {
        AudioConfig {
            codec: AudioCodec::Pcm,
            channels: 1,
            device_output: false,
            ..AudioConfig::default()
        }
    }

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn filter_drops_late_and_duplicate_across_wrap() {
        let mut f = SequenceFilter::default();
        assert!(f.accept(65_534));
        assert!(f.accept(65_535));
        assert!(f.accept(0));
        assert!(!f.accept(0));
        assert!(!f.accept(65_535));
        assert!(f.accept(2));
        f.reset();
        assert!(f.accept(1));
    }

    #[test]
    fn player_decodes_into_ring_in_order() {
        let mut p = AudioPlayer::open(&pcm_config()).unwrap();
        p.play(AudioHeader { sequence: 1, timestamp: 0 }, &pcm(&[100, 200]));
        p.play(AudioHeader { sequence: 0, timestamp: 0 }, &pcm(&[300]));
        p.play(AudioHeader { sequence: 2, timestamp: 0 }, &[1]);

        let stats = p.stats();
        assert_eq!(stats.played_packets, 1);
        assert_eq!(stats.stale_packets, 1);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(p.ring().len(), 2);

        p.reset();
        assert!(p.ring().is_empty());
        p.play(AudioHeader { sequence: 0, timestamp: 0 }, &pcm(&[1]));
        assert_eq!(p.stats().played_packets, 2);
    }
}
