//! Quality-of-service telemetry.
//!
//! The viewer's stats thread asks a [`StatsReporter`] for a [`ViewerStats`]
//! snapshot every interval; the snapshot goes to the embedding application
//! through a callback and to the host as a `VIEWER_STATS` datagram, where
//! an [`AbrController`] turns it into bitrate changes.

pub mod abr;
pub mod bandwidth;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::peer::ConnectionType;
use crate::transport::{JitterStats, NackStats};
use crate::types::Codec;

pub use abr::{AbrConfig, AbrController};
pub use bandwidth::BandwidthEstimator;

// ── ViewerStats ──────────────────────────────────────────────────

/// One periodic QoS snapshot. Rates cover the last interval; counters
/// are cumulative for the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewerStats {
    /// Milliseconds since the viewer started.
    pub uptime_ms: u64,
    pub bitrate_kbps: f32,
    /// Rendered frames per second.
    pub fps: f32,
    /// Sequences lost over the last interval, 0.0..=1.0.
    pub loss_fraction: f32,
    /// Interarrival jitter of assembled frames.
    pub jitter_ms: f32,
    pub rtt_ms: f32,
    pub codec: Option<Codec>,
    pub width: u32,
    pub height: u32,
    pub connection_type: ConnectionType,
    pub decode_ms: f32,
    pub render_ms: f32,

    pub frames_received: u64,
    pub frames_decoded: u64,
    pub frames_rendered: u64,
    pub frames_dropped: u64,
    pub packets_lost: u64,
    pub packets_recovered: u64,
    pub nacks_sent: u64,
    pub keyframe_requests: u64,
    pub decode_errors: u64,
    pub audio_played: u64,
    pub audio_underruns: u64,
    /// Queue overflow, late or duplicate, and undecodable audio packets.
    pub audio_dropped: u64,
    pub reconnects: u64,
}

/// Counters owned by other components, read when a snapshot is built.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineCounters {
    pub jitter: JitterStats,
    pub nack: NackStats,
    pub keyframe_requests: u64,
    pub audio_played: u64,
    pub audio_underruns: u64,
    pub audio_dropped: u64,
    pub reconnects: u64,
}

// ── Interarrival jitter ──────────────────────────────────────────

/// RFC 3550 interarrival jitter: `J += (|D| - J) / 16`, where `D` is the
/// difference between arrival spacing and media-time spacing.
#[derive(Debug, Clone, Default)]
pub struct InterarrivalJitter {
    last: Option<(Instant, Duration)>,
    jitter_us: f64,
}

impl InterarrivalJitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `media_time` is the unit's position on the sender's clock.
    pub fn on_arrival(&mut self, arrival: Instant, media_time: Duration) {
        if let Some((prev_arrival, prev_media)) = self.last {
            let recv_us = arrival.saturating_duration_since(prev_arrival).as_micros() as i64;
            let send_us = media_time.as_micros() as i64 - prev_media.as_micros() as i64;
            let d = (recv_us - send_us).unsigned_abs() as f64;
            self.jitter_us += (d - self.jitter_us) / 16.0;
        }
        self.last = Some((arrival, media_time));
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_micros(self.jitter_us as u64)
    }

    /// Start over after a discontinuity.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

// ── StatsReporter ────────────────────────────────────────────────

/// Gathers measurements from the pipeline stages and builds snapshots.
#[derive(Debug)]
pub struct StatsReporter {
    started: Instant,
    bandwidth: BandwidthEstimator,
    jitter: InterarrivalJitter,
    codec: Option<Codec>,
    width: u32,
    height: u32,
    connection_type: ConnectionType,

    frames_decoded: u64,
    frames_rendered: u64,
    decode_errors: u64,
    decode_ms: f32,
    render_ms: f32,

    last_snapshot: Instant,
    rendered_at_last: u64,
    expected_at_last: u64,
    lost_at_last: u64,
}

impl StatsReporter {
    pub fn new() -> Self {
        Self::new_at(Instant::now())
    }

    pub fn new_at(now: Instant) -> Self {
        Self {
            started: now,
            bandwidth: BandwidthEstimator::new(),
            jitter: InterarrivalJitter::new(),
            codec: None,
            width: 0,
            height: 0,
            connection_type: ConnectionType::default(),
            frames_decoded: 0,
            frames_rendered: 0,
            decode_errors: 0,
            decode_ms: 0.0,
            render_ms: 0.0,
            last_snapshot: now,
            rendered_at_last: 0,
            expected_at_last: 0,
            lost_at_last: 0,
        }
    }

    pub fn set_stream(&mut self, codec: Codec, width: u32, height: u32) {
        self.codec = Some(codec);
        self.width = width;
        self.height = height;
    }

    pub fn set_connection_type(&mut self, connection_type: ConnectionType) {
        self.connection_type = connection_type;
    }

    pub fn on_datagram(&mut self, now: Instant, bytes: usize) {
        self.bandwidth.record_at(now, bytes as u64);
    }

    /// A frame left the jitter buffer; `media_time` is its position on
    /// the sender's frame clock.
    pub fn on_frame(&mut self, arrival: Instant, media_time: Duration) {
        self.jitter.on_arrival(arrival, media_time);
    }

    pub fn on_decoded(&mut self, elapsed: Duration) {
        self.frames_decoded += 1;
        self.decode_ms = ewma(self.decode_ms, elapsed);
    }

    pub fn on_decode_error(&mut self) {
        self.decode_errors += 1;
    }

    pub fn on_rendered(&mut self, elapsed: Duration) {
        self.frames_rendered += 1;
        self.render_ms = ewma(self.render_ms, elapsed);
    }

    /// Microsecond clock value for an outgoing PING.
    pub fn ping_value(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.started).as_micros() as u64
    }

    /// Match a PONG echo against our clock and fold in the RTT.
    pub fn on_pong(&mut self, echoed_us: u64, now: Instant) -> Option<Duration> {
        let sent = self.started + Duration::from_micros(echoed_us);
        let rtt = now.checked_duration_since(sent)?;
        self.bandwidth.record_rtt(rtt);
        Some(rtt)
    }

    pub fn rtt(&self) -> Duration {
        self.bandwidth.latency()
    }

    /// Discontinuity after a reconnect: forget throughput and jitter
    /// history but keep cumulative counters.
    pub fn on_reconnect(&mut self) {
        self.bandwidth.clear();
        self.jitter.reset();
    }

    pub fn snapshot(&mut self, counters: &PipelineCounters) -> ViewerStats {
        self.snapshot_at(Instant::now(), counters)
    }

    pub fn snapshot_at(&mut self, now: Instant, counters: &PipelineCounters) -> ViewerStats {
        let elapsed = now.saturating_duration_since(self.last_snapshot).as_secs_f32();
        let fps = if elapsed > 0.0 {
            (self.frames_rendered - self.rendered_at_last) as f32 / elapsed
        } else {
            0.0
        };

        let expected = counters.nack.expected.saturating_sub(self.expected_at_last);
        let lost = counters.nack.lost.saturating_sub(self.lost_at_last);
        let loss_fraction = if expected > 0 {
            (lost as f32 / expected as f32).min(1.0)
        } else {
            0.0
        };

        self.last_snapshot = now;
        self.rendered_at_last = self.frames_rendered;
        self.expected_at_last = counters.nack.expected;
        self.lost_at_last = counters.nack.lost;

        ViewerStats {
            uptime_ms: now.saturating_duration_since(self.started).as_millis() as u64,
            bitrate_kbps: self.bandwidth.estimate_kbps(),
            fps,
            loss_fraction,
            jitter_ms: self.jitter.jitter().as_secs_f32() * 1000.0,
            rtt_ms: self.bandwidth.latency().as_secs_f32() * 1000.0,
            codec: self.codec,
            width: self.width,
            height: self.height,
            connection_type: self.connection_type,
            decode_ms: self.decode_ms,
            render_ms: self.render_ms,
            frames_received: counters.jitter.frames_released,
            frames_decoded: self.frames_decoded,
            frames_rendered: self.frames_rendered,
            frames_dropped: counters.jitter.frames_dropped,
            packets_lost: counters.nack.lost,
            packets_recovered: counters.nack.recovered,
            nacks_sent: counters.nack.nacks_sent,
            keyframe_requests: counters.keyframe_requests,
            decode_errors: self.decode_errors,
            audio_played: counters.audio_played,
            audio_underruns: counters.audio_underruns,
            audio_dropped: counters.audio_dropped,
            reconnects: counters.reconnects,
        }
    }
}

impl Default for StatsReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn ewma(avg_ms: f32, sample: Duration) -> f32 {
    let ms = sample.as_secs_f32() * 1000.0;
    if avg_ms == 0.0 { ms } else { avg_ms * 0.9 + ms * 0.1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_arrivals_have_no_jitter() {
        let mut j = InterarrivalJitter::new();
        let t0 = Instant::now();
        for i in 0..10u32 {
            let step = Duration::from_millis(16) * i;
            j.on_arrival(t0 + step, step);
        }
        assert_eq!(j.jitter(), Duration::ZERO);
    }

    #[test]
    fn one_late_arrival_moves_jitter_by_a_sixteenth() {
        let mut j = InterarrivalJitter::new();
        let t0 = Instant::now();
        j.on_arrival(t0, Duration::ZERO);
        // Arrives 16 ms later than the media clock says.
        j.on_arrival(t0 + Duration::from_millis(32), Duration::from_millis(16));
        assert_eq!(j.jitter(), Duration::from_micros(1000));
    }

    #[test]
    fn ping_pong_rtt() {
        let t0 = Instant::now();
        let mut r = StatsReporter::new_at(t0);
        let ping = r.ping_value(t0 + Duration::from_millis(100));
        assert_eq!(ping, 100_000);
        let rtt = r.on_pong(ping, t0 + Duration::from_millis(130)).unwrap();
        assert_eq!(rtt, Duration::from_millis(30));
        assert_eq!(r.rtt(), Duration::from_millis(30));
        // An echo from the future is ignored.
        assert!(r.on_pong(10_000_000, t0).is_none());
    }

    #[test]
    fn snapshot_uses_interval_deltas() {
        let t0 = Instant::now();
        let mut r = StatsReporter::new_at(t0);
        r.set_stream(Codec::Screen, 1280, 720);
        for _ in 0..30 {
            r.on_rendered(Duration::from_millis(2));
        }
        let mut counters = PipelineCounters::default();
        counters.nack.expected = 100;
        counters.nack.lost = 10;

        let first = r.snapshot_at(t0 + Duration::from_secs(1), &counters);
        assert_eq!(first.fps, 30.0);
        assert!((first.loss_fraction - 0.1).abs() < 1e-6);
        assert_eq!(first.frames_rendered, 30);
        assert_eq!((first.width, first.height), (1280, 720));

        counters.nack.expected = 200;
        let second = r.snapshot_at(t0 + Duration::from_secs(2), &counters);
        assert_eq!(second.fps, 0.0);
        assert_eq!(second.loss_fraction, 0.0);
        assert_eq!(second.packets_lost, 10);
    }

    #[test]
    fn decode_time_is_smoothed() {
        let mut r = StatsReporter::new();
        r.on_decoded(Duration::from_millis(10));
        r.on_decoded(Duration::from_millis(20));
        assert!((r.decode_ms - 11.0).abs() < 1e-3);
    }
}
