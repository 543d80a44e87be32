//! Rolling-window throughput and smoothed RTT.
//!
//! The viewer feeds it received datagram sizes and PING/PONG round trips;
//! encoders feed it their output sizes to report the produced bitrate.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling-window bandwidth estimator.
///
/// Keeps `(instant, bytes)` samples no older than `window` and averages
/// over the span they cover.
#[derive(Debug, Clone)]
pub struct BandwidthEstimator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    /// Sum of `samples` bytes.
    total_bytes: u64,
    /// Smoothed RTT in microseconds, 0 until the first sample.
    smoothed_rtt_us: u64,
}

impl BandwidthEstimator {
    /// One-second window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(256),
            window,
            total_bytes: 0,
            smoothed_rtt_us: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, when: Instant, bytes: u64) {
        self.samples.push_back((when, bytes));
        self.total_bytes += bytes;
        while let Some(&(ts, old)) = self.samples.front() {
            if when.duration_since(ts) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.total_bytes = self.total_bytes.saturating_sub(old);
        }
    }

    /// Fold an RTT sample in with the TCP smoothing factor (1/8).
    pub fn record_rtt(&mut self, rtt: Duration) {
        let sample = rtt.as_micros() as u64;
        self.smoothed_rtt_us = if self.smoothed_rtt_us == 0 {
            sample
        } else {
            self.smoothed_rtt_us * 7 / 8 + sample / 8
        };
    }

    /// Throughput in bytes per second over the samples in the window.
    pub fn estimate_bps(&self) -> u64 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0;
        };
        let span = last.duration_since(*first).max(Duration::from_millis(1));
        (self.total_bytes as f64 / span.as_secs_f64()) as u64
    }

    /// Throughput in kbit/s.
    pub fn estimate_kbps(&self) -> f32 {
        self.estimate_bps() as f32 * 8.0 / 1000.0
    }

    /// Smoothed RTT, `Duration::ZERO` before the first sample.
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.smoothed_rtt_us)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Forget throughput samples; the RTT estimate is kept.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.total_bytes = 0;
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}
