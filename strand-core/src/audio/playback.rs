//! Playback ring and outputs.
//!
//! The audio thread pushes decoded samples into a [`PlaybackRing`]; the
//! output pulls from it. On overflow the oldest samples are discarded so
//! latency stays bounded; on underflow the output plays silence.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Pulls that could not be fully served after playback had started.
    pub underruns: u64,
    /// Samples discarded to make room for newer ones.
    pub overrun_samples: u64,
}

#[derive(Debug)]
struct RingState {
    samples: VecDeque<f32>,
    capacity: usize,
    /// Set once data has arrived; an empty ring before that is not an
    /// underrun.
    primed: bool,
    stats: RingStats,
}

/// Bounded interleaved-sample FIFO shared by decoder and output.
#[derive(Debug)]
pub struct PlaybackRing {
    state: Mutex<RingState>,
}

impl PlaybackRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                samples: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                primed: false,
                stats: RingStats::default(),
            }),
        }
    }

    /// Capacity for `ms` of audio.
    pub fn for_duration(ms: u32, sample_rate: u32, channels: u16) -> Self {
        Self::new(sample_rate as usize * channels as usize * ms as usize / 1000)
    }

    pub fn push(&self, samples: &[f32]) {
        let mut s = self.state.lock();
        let incoming = samples.len().min(s.capacity);
        let skipped = samples.len() - incoming;
        let overflow = (s.samples.len() + incoming).saturating_sub(s.capacity);
        s.samples.drain(..overflow);
        s.samples.extend(&samples[skipped..]);
        s.stats.overrun_samples += (overflow + skipped) as u64;
        s.primed = true;
    }

    /// Fill `out`; missing samples are zeroed. Returns how many were real.
    pub fn pull(&self, out: &mut [f32]) -> usize {
        let mut s = self.state.lock();
        let n = out.len().min(s.samples.len());
        for (dst, src) in out.iter_mut().zip(s.samples.drain(..n)) {
            *dst = src;
        }
        out[n..].fill(0.0);
        if n < out.len() && s.primed {
            s.stats.underruns += 1;
            s.primed = false;
        }
        n
    }

    /// Drop `count` samples without copying them out.
    pub fn discard(&self, count: usize) -> usize {
        let mut s = self.state.lock();
        let n = count.min(s.samples.len());
        s.samples.drain(..n);
        if n < count && s.primed {
            s.stats.underruns += 1;
            s.primed = false;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.state.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut s = self.state.lock();
        s.samples.clear();
        s.primed = false;
    }

    pub fn stats(&self) -> RingStats {
        self.state.lock().stats
    }
}

// ── Outputs ──────────────────────────────────────────────────────

/// Consumes the ring in real time without a sound device, so headless
/// viewers keep realistic buffer levels and underrun counts.
#[derive(Debug)]
pub struct NullOutput {
    ring: Arc<PlaybackRing>,
    samples_per_sec: u64,
    last: Instant,
    carry_ns: u64,
}

impl NullOutput {
    pub fn new(ring: Arc<PlaybackRing>, sample_rate: u32, channels: u16) -> Self {
        Self::new_at(ring, sample_rate, channels, Instant::now())
    }

    pub fn new_at(ring: Arc<PlaybackRing>, sample_rate: u32, channels: u16, now: Instant) -> Self {
        Self {
            ring,
            samples_per_sec: sample_rate as u64 * channels as u64,
            last: now,
            carry_ns: 0,
        }
    }

    /// Consume what a device would have played since the last call.
    pub fn pump_at(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_nanos() as u64 + self.carry_ns;
        self.last = now;
        let due = elapsed * self.samples_per_sec / 1_000_000_000;
        self.carry_ns = elapsed - due * 1_000_000_000 / self.samples_per_sec.max(1);
        if due > 0 {
            self.ring.discard(due as usize);
        }
    }
}

#[cfg(feature = "cpal")]
pub use device::CpalOutput;

#[cfg(feature = "cpal")]
mod device {
    use std::sync::Arc;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use tracing::{info, warn};

    use super::PlaybackRing;
    use crate::error::StreamError;

    /// Default output device fed from the ring by the cpal callback.
    ///
    /// `cpal::Stream` is not `Send` everywhere, so this is created on the
    /// thread that keeps it alive.
    pub struct CpalOutput {
        _stream: cpal::Stream,
        device: String,
    }

    impl CpalOutput {
        pub fn open(ring: Arc<PlaybackRing>, sample_rate: u32, channels: u16) -> Result<Self, StreamError> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| StreamError::Audio("no audio output device".into()))?;
            let name = device.name().unwrap_or_else(|_| "unknown".into());

            let config = cpal::StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        ring.pull(data);
                    },
                    |err| warn!(error = %err, "audio playback error"),
                    None,
                )
                .map_err(|e| StreamError::Audio(format!("output stream on {name}: {e}")))?;
            stream
                .play()
                .map_err(|e| StreamError::Audio(format!("starting playback on {name}: {e}")))?;

            info!(device = %name, sample_rate, channels, "audio output started");
            Ok(Self {
                _stream: stream,
                device: name,
            })
        }

        pub fn device(&self) -> &str {
            &self.device
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn overflow_drops_oldest() {
        let ring = PlaybackRing::new(4);
        ring.push(&[1.0, 2.0, 3.0]);
        ring.push(&[4.0, 5.0]);
        let mut out = [0.0; 4];
        assert_eq!(ring.pull(&mut out), 4);
        assert_eq!(out, [2.0, 3.0, 4.0, 5.0]);
        assert_eq!(ring.stats().overrun_samples, 1);
    }

    #[test]
    fn oversized_push_keeps_the_tail() {
        let ring = PlaybackRing::new(2);
        ring.push(&[1.0, 2.0, 3.0]);
        let mut out = [0.0; 2];
        ring.pull(&mut out);
        assert_eq!(out, [2.0, 3.0]);
    }

    #[test]
    fn underrun_counted_once_per_starvation() {
        let ring = PlaybackRing::new(8);
        let mut out = [9.0; 4];
        // Nothing played yet: silence but no underrun.
        assert_eq!(ring.pull(&mut out), 0);
        assert_eq!(out, [0.0; 4]);
        assert_eq!(ring.stats().underruns, 0);

        ring.push(&[0.5, 0.5]);
        assert_eq!(ring.pull(&mut out), 2);
        assert_eq!(out, [0.5, 0.5, 0.0, 0.0]);
        ring.pull(&mut out);
        assert_eq!(ring.stats().underruns, 1);
    }

    #[test]
    fn null_output_drains_in_real_time() {
        let ring = Arc::new(PlaybackRing::new(48_000));
        ring.push(&vec![0.1; 48_000]);
        let t0 = Instant::now();
        let mut out = NullOutput::new_at(Arc::clone(&ring), 48_000, 1, t0);
        out.pump_at(t0 + Duration::from_millis(250));
        assert_eq!(ring.len(), 36_000);
    }
}
