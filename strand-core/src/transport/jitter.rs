//! Frame reassembly and playout ordering for the video stream.
//!
//! Fragments are grouped into assemblies keyed by their 16-bit frame
//! number. Frames leave the buffer strictly in ascending wrap-aware order:
//! a complete frame waits behind an earlier incomplete one until that one
//! either completes (usually via NACK retransmission) or ages out.
//!
//! Frame numbers skipped over by a newer arrival get a *placeholder*
//! assembly so a frame that never delivered a single fragment expires and
//! is counted exactly like a partially received one.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::protocol::{FragmentHeader, seq_diff, seq_newer};
use crate::types::Codec;

// ── Configuration ────────────────────────────────────────────────

/// Jitter buffer tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JitterConfig {
    /// Playout delay measured from a frame's first fragment.
    pub target_depth_ms: u64,
    /// Incomplete frames older than this are dropped.
    pub max_frame_age_ms: u64,
    /// Jumps larger than this, forward or backward, reset the buffer.
    /// Effective range is 1..=32767.
    pub max_frame_gap: u16,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            target_depth_ms: 20,
            max_frame_age_ms: 150,
            max_frame_gap: 512,
        }
    }
}

impl JitterConfig {
    pub fn target_depth(&self) -> Duration {
        Duration::from_millis(self.target_depth_ms)
    }

    pub fn max_frame_age(&self) -> Duration {
        Duration::from_millis(self.max_frame_age_ms)
    }

    /// `max_frame_gap` as a signed frame distance.
    pub fn max_gap(&self) -> i16 {
        self.max_frame_gap.clamp(1, i16::MAX as u16) as i16
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.max_frame_gap == 0 || self.max_frame_gap > i16::MAX as u16 {
            return Err(StreamError::InvalidConfig(format!(
                "max_frame_gap {} outside 1..=32767",
                self.max_frame_gap
            )));
        }
        if self.max_frame_age_ms == 0 {
            return Err(StreamError::InvalidConfig("max_frame_age_ms must be non-zero".into()));
        }
        Ok(())
    }
}

/// Fresh fragments from this many distinct frames behind the head, with
/// nothing accepted in between, mean the sender restarted its counter.
const LATE_RUN_RESET: usize = 3;

// ── Output ───────────────────────────────────────────────────────

/// A fully reassembled access unit, ready for the decoder.
#[derive(Debug, Clone)]
pub struct AssembledFrame {
    pub frame_number: u16,
    pub keyframe: bool,
    pub codec: Codec,
    /// Fragments concatenated in index order.
    pub payload: Bytes,
    /// When the first fragment (or the gap that implied it) was seen.
    pub first_arrival: Instant,
}

/// What happened to a pushed fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored; the frame is still incomplete.
    Stored,
    /// Stored and the frame is now complete.
    Completed,
    /// The buffer was reset by a discontinuity and the fragment stored.
    Reset,
    /// Dropped; see the reason.
    Rejected(Rejection),
}

/// Reason a fragment was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// This index was already received.
    Duplicate,
    /// `fragment_index >= fragment_total`.
    IndexOutOfRange,
    /// `fragment_total` disagrees with earlier fragments of the frame.
    TotalMismatch,
    /// The frame was already released or dropped.
    Late,
}

/// Cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterStats {
    pub fragments_received: u64,
    pub frames_released: u64,
    pub frames_dropped: u64,
    pub duplicates: u64,
    pub invalid: u64,
    pub late: u64,
    pub resets: u64,
}

// ── FrameAssembly ────────────────────────────────────────────────

#[derive(Debug)]
struct FrameAssembly {
    /// `None` while this is a placeholder.
    total: Option<u16>,
    fragments: Vec<Option<Bytes>>,
    received: u16,
    first_arrival: Instant,
    keyframe: bool,
    codec: Option<Codec>,
}

impl FrameAssembly {
    fn placeholder(now: Instant) -> Self {
        Self {
            total: None,
            fragments: Vec::new(),
            received: 0,
            first_arrival: now,
            keyframe: false,
            codec: None,
        }
    }

    fn is_complete(&self) -> bool {
        self.total == Some(self.received)
    }

    fn assemble(self, frame_number: u16) -> Option<AssembledFrame> {
        let codec = self.codec?;
        let len = self.fragments.iter().flatten().map(Bytes::len).sum();
        let mut payload = BytesMut::with_capacity(len);
        for frag in self.fragments.into_iter().flatten() {
            payload.extend_from_slice(&frag);
        }
        Some(AssembledFrame {
            frame_number,
            keyframe: self.keyframe,
            codec,
            payload: payload.freeze(),
            first_arrival: self.first_arrival,
        })
    }
}

// ── JitterBuffer ─────────────────────────────────────────────────

/// Reorders and reassembles video fragments.
#[derive(Debug)]
pub struct JitterBuffer {
    config: JitterConfig,
    assemblies: HashMap<u16, FrameAssembly>,
    /// Next frame number to release.
    head: Option<u16>,
    /// Newest frame number seen.
    newest: u16,
    /// Frames dropped ahead of the head; later fragments for them are late.
    retired: HashSet<u16>,
    /// Distinct frames of the current run of fresh late fragments.
    late_run: Vec<u16>,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        Self {
            config,
            assemblies: HashMap::new(),
            head: None,
            newest: 0,
            retired: HashSet::new(),
            late_run: Vec::new(),
            stats: JitterStats::default(),
        }
    }

    pub fn config(&self) -> &JitterConfig {
        &self.config
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    /// Number of frames currently held (including placeholders).
    pub fn len(&self) -> usize {
        self.assemblies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assemblies.is_empty()
    }

    /// Insert a fragment received now.
    pub fn push_packet(&mut self, header: &FragmentHeader, payload: &[u8]) -> PushOutcome {
        self.push_packet_at(header, payload, Instant::now())
    }

    /// Insert a fragment with an explicit arrival instant.
    pub fn push_packet_at(
        &mut self,
        header: &FragmentHeader,
        payload: &[u8],
        now: Instant,
    ) -> PushOutcome {
        self.stats.fragments_received += 1;

        if header.fragment_index >= header.fragment_total {
            self.stats.invalid += 1;
            return PushOutcome::Rejected(Rejection::IndexOutOfRange);
        }

        let frame = header.frame_number;
        let mut reset = false;
        match self.head {
            None => {
                self.head = Some(frame);
                self.newest = frame;
            }
            Some(head) => {
                if self.retired.contains(&frame) {
                    self.stats.late += 1;
                    return PushOutcome::Rejected(Rejection::Late);
                }
                if seq_newer(head, frame) {
                    if !self.restarted_behind(head, header) {
                        self.stats.late += 1;
                        return PushOutcome::Rejected(Rejection::Late);
                    }
                    warn!(head, to = frame, "frame numbers went backwards; resetting jitter buffer");
                    self.restart_at(frame);
                    reset = true;
                } else {
                    self.late_run.clear();
                    let gap = seq_diff(frame, self.newest);
                    if gap > self.config.max_gap() {
                        warn!(
                            from = self.newest,
                            to = frame,
                            "frame number discontinuity; resetting jitter buffer"
                        );
                        self.restart_at(frame);
                        reset = true;
                    } else if gap > 0 {
                        let mut missing = self.newest.wrapping_add(1);
                        while missing != frame {
                            self.assemblies
                                .entry(missing)
                                .or_insert_with(|| FrameAssembly::placeholder(now));
                            missing = missing.wrapping_add(1);
                        }
                        self.newest = frame;
                    }
                }
            }
        }

        let assembly = self
            .assemblies
            .entry(frame)
            .or_insert_with(|| FrameAssembly::placeholder(now));

        match assembly.total {
            None => {
                assembly.total = Some(header.fragment_total);
                assembly.fragments = vec![None; header.fragment_total as usize];
            }
            Some(total) if total != header.fragment_total => {
                self.stats.invalid += 1;
                return PushOutcome::Rejected(Rejection::TotalMismatch);
            }
            Some(_) => {}
        }

        let slot = &mut assembly.fragments[header.fragment_index as usize];
        if slot.is_some() {
            self.stats.duplicates += 1;
            return PushOutcome::Rejected(Rejection::Duplicate);
        }
        *slot = Some(Bytes::copy_from_slice(payload));
        assembly.received += 1;
        assembly.keyframe |= header.is_keyframe();
        assembly.codec = Some(header.codec);

        if reset {
            PushOutcome::Reset
        } else if assembly.is_complete() {
            PushOutcome::Completed
        } else {
            PushOutcome::Stored
        }
    }

    /// Release the next frame if it is due.
    pub fn pop_frame(&mut self) -> Option<AssembledFrame> {
        self.pop_frame_at(Instant::now())
    }

    /// Release the next frame as of `now`.
    ///
    /// Expires stale incomplete frames first, then releases the head if it
    /// is complete and has waited at least `target_depth`.
    pub fn pop_frame_at(&mut self, now: Instant) -> Option<AssembledFrame> {
        self.expire_at(now);

        loop {
            let head = self.head?;
            if seq_newer(head, self.newest) {
                return None;
            }
            let Some(assembly) = self.assemblies.get(&head) else {
                // Dropped by expiry; step over it.
                self.retired.remove(&head);
                self.head = Some(head.wrapping_add(1));
                continue;
            };
            if !assembly.is_complete()
                || now.saturating_duration_since(assembly.first_arrival)
                    < self.config.target_depth()
            {
                return None;
            }
            let assembly = self.assemblies.remove(&head)?;
            self.head = Some(head.wrapping_add(1));
            self.stats.frames_released += 1;
            return assembly.assemble(head);
        }
    }

    /// Drop every incomplete frame older than `max_frame_age`.
    ///
    /// Returns how many frames were dropped by this call.
    pub fn expire_at(&mut self, now: Instant) -> usize {
        let max_age = self.config.max_frame_age();
        let expired: Vec<u16> = self
            .assemblies
            .iter()
            .filter(|(_, a)| {
                !a.is_complete() && now.saturating_duration_since(a.first_arrival) >= max_age
            })
            .map(|(&n, _)| n)
            .collect();

        for frame in &expired {
            if let Some(a) = self.assemblies.remove(frame) {
                debug!(
                    frame,
                    received = a.received,
                    total = ?a.total,
                    "dropping incomplete frame"
                );
            }
            self.retired.insert(*frame);
            self.stats.frames_dropped += 1;
        }
        expired.len()
    }

    /// Instant at which the head frame becomes due, if one is waiting.
    pub fn next_deadline(&self) -> Option<Instant> {
        let head = self.head?;
        let a = self.assemblies.get(&head)?;
        Some(if a.is_complete() {
            a.first_arrival + self.config.target_depth()
        } else {
            a.first_arrival + self.config.max_frame_age()
        })
    }

    /// Clear every assembly and forget the head (after a reconnect).
    pub fn flush(&mut self) {
        self.clear();
        self.head = None;
        self.newest = 0;
    }

    fn clear(&mut self) {
        self.assemblies.clear();
        self.retired.clear();
        self.late_run.clear();
    }

    fn restart_at(&mut self, frame: u16) {
        self.clear();
        self.head = Some(frame);
        self.newest = frame;
        self.stats.resets += 1;
    }

    /// Whether a fragment behind the head comes from a sender whose frame
    /// counter restarted, rather than from a straggler or a duplicate.
    fn restarted_behind(&mut self, head: u16, header: &FragmentHeader) -> bool {
        if seq_diff(head, header.frame_number) > self.config.max_gap() {
            return true;
        }
        if header.is_retransmit() {
            return false;
        }
        if !self.late_run.contains(&header.frame_number) {
            self.late_run.push(header.frame_number);
        }
        self.late_run.len() >= LATE_RUN_RESET
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::FragmentFlags;

    fn hdr(frame: u16, index: u16, total: u16) -> FragmentHeader {
        FragmentHeader {
            flags: FragmentFlags::empty(),
            sequence: 0,
            frame_number: frame,
            fragment_index: index,
            fragment_total: total,
            codec: Codec::H264,
        }
    }

    fn buffer() -> JitterBuffer {
        JitterBuffer::new(JitterConfig::default())
    }

    const DEPTH: Duration = Duration::from_millis(20);
    const AGE: Duration = Duration::from_millis(150);

    #[test]
    fn out_of_order_fragments_concatenate_in_index_order() {
        let mut jb = buffer();
        let t0 = Instant::now();
        assert_eq!(jb.push_packet_at(&hdr(5, 1, 2), b"world", t0), PushOutcome::Stored);
        assert_eq!(jb.push_packet_at(&hdr(5, 0, 2), b"hello ", t0), PushOutcome::Completed);

        let frame = jb.pop_frame_at(t0 + DEPTH).unwrap();
        assert_eq!(frame.frame_number, 5);
        assert_eq!(&frame.payload[..], b"hello world");
        assert_eq!(frame.codec, Codec::H264);
    }

    #[test]
    fn poppable_only_with_all_distinct_indices() {
        let mut jb = buffer();
        let t0 = Instant::now();
        jb.push_packet_at(&hdr(1, 0, 3), b"a", t0);
        jb.push_packet_at(&hdr(1, 0, 3), b"a", t0);
        jb.push_packet_at(&hdr(1, 2, 3), b"c", t0);
        assert!(jb.pop_frame_at(t0 + DEPTH).is_none());
        assert_eq!(jb.stats().duplicates, 1);

        jb.push_packet_at(&hdr(1, 1, 3), b"b", t0);
        assert_eq!(&jb.pop_frame_at(t0 + DEPTH).unwrap().payload[..], b"abc");
    }

    #[test]
    fn complete_frame_waits_for_target_depth() {
        let mut jb = buffer();
        let t0 = Instant::now();
        jb.push_packet_at(&hdr(9, 0, 1), b"x", t0);
        assert!(jb.pop_frame_at(t0 + Duration::from_millis(5)).is_none());
        assert_eq!(jb.next_deadline(), Some(t0 + DEPTH));
        assert!(jb.pop_frame_at(t0 + DEPTH).is_some());
    }

    #[test]
    fn frames_leave_in_ascending_order() {
        let mut jb = buffer();
        let t0 = Instant::now();
        jb.push_packet_at(&hdr(3, 0, 1), b"3", t0);
        jb.push_packet_at(&hdr(1, 0, 1), b"1", t0);
        jb.push_packet_at(&hdr(2, 0, 1), b"2", t0);

        // Head is 3 (first seen); 1 and 2 arrived behind it.
        assert_eq!(jb.stats().late, 2);

        let mut jb = buffer();
        jb.push_packet_at(&hdr(1, 0, 1), b"1", t0);
        jb.push_packet_at(&hdr(3, 0, 1), b"3", t0);
        jb.push_packet_at(&hdr(2, 0, 1), b"2", t0);
        let order: Vec<u16> = std::iter::from_fn(|| jb.pop_frame_at(t0 + DEPTH))
            .map(|f| f.frame_number)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn later_complete_frame_waits_behind_incomplete_head() {
        let mut jb = buffer();
        let t0 = Instant::now();
        jb.push_packet_at(&hdr(10, 0, 2), b"a", t0);
        jb.push_packet_at(&hdr(11, 0, 1), b"b", t0);
        assert!(jb.pop_frame_at(t0 + DEPTH).is_none());

        // After the head ages out, the next frame flows.
        let f = jb.pop_frame_at(t0 + AGE).unwrap();
        assert_eq!(f.frame_number, 11);
        assert_eq!(jb.stats().frames_dropped, 1);
    }

    #[test]
    fn expiry_happens_exactly_once_and_rejects_stragglers() {
        let mut jb = buffer();
        let t0 = Instant::now();
        jb.push_packet_at(&hdr(20, 0, 2), b"a", t0);
        jb.push_packet_at(&hdr(21, 0, 1), b"b", t0 + Duration::from_millis(100));

        assert_eq!(jb.pop_frame_at(t0 + AGE).unwrap().frame_number, 21);
        assert_eq!(jb.stats().frames_dropped, 1);
        for ms in [160, 170, 200] {
            jb.pop_frame_at(t0 + Duration::from_millis(ms));
        }
        assert_eq!(jb.stats().frames_dropped, 1);

        let late = jb.push_packet_at(&hdr(20, 1, 2), b"z", t0 + AGE);
        assert_eq!(late, PushOutcome::Rejected(Rejection::Late));
    }

    #[test]
    fn skipped_frames_become_placeholders_and_expire() {
        let mut jb = buffer();
        let t0 = Instant::now();
        jb.push_packet_at(&hdr(1, 0, 1), b"1", t0);
        jb.push_packet_at(&hdr(4, 0, 1), b"4", t0);
        assert_eq!(jb.len(), 4);

        assert_eq!(jb.pop_frame_at(t0 + DEPTH).unwrap().frame_number, 1);
        assert!(jb.pop_frame_at(t0 + DEPTH).is_none());

        let f = jb.pop_frame_at(t0 + AGE).unwrap();
        assert_eq!(f.frame_number, 4);
        assert_eq!(jb.stats().frames_dropped, 2);
    }

    #[test]
    fn placeholder_fills_in_before_expiry() {
        let mut jb = buffer();
        let t0 = Instant::now();
        jb.push_packet_at(&hdr(1, 0, 1), b"1", t0);
        jb.push_packet_at(&hdr(3, 0, 1), b"3", t0);
        jb.push_packet_at(&hdr(2, 0, 1), b"2", t0 + Duration::from_millis(10));
        let order: Vec<u16> = std::iter::from_fn(|| jb.pop_frame_at(t0 + Duration::from_millis(40)))
            .map(|f| f.frame_number)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(jb.stats().frames_dropped, 0);
    }

    #[test]
    fn rejects_invalid_fragments() {
        let mut jb = buffer();
        let t0 = Instant::now();
        assert_eq!(
            jb.push_packet_at(&hdr(1, 3, 3), b"", t0),
            PushOutcome::Rejected(Rejection::IndexOutOfRange)
        );
        jb.push_packet_at(&hdr(1, 0, 3), b"", t0);
        assert_eq!(
            jb.push_packet_at(&hdr(1, 1, 4), b"", t0),
            PushOutcome::Rejected(Rejection::TotalMismatch)
        );
        assert_eq!(jb.stats().invalid, 2);
    }

    #[test]
    fn wraps_around_frame_number_space() {
        let mut jb = buffer();
        let t0 = Instant::now();
        for frame in [65534u16, 65535, 0, 1] {
            jb.push_packet_at(&hdr(frame, 0, 1), &frame.to_be_bytes(), t0);
        }
        let order: Vec<u16> = std::iter::from_fn(|| jb.pop_frame_at(t0 + DEPTH))
            .map(|f| f.frame_number)
            .collect();
        assert_eq!(order, vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn large_forward_jump_resets() {
        let mut jb = buffer();
        let t0 = Instant::now();
        jb.push_packet_at(&hdr(100, 0, 2), b"a", t0);
        assert_eq!(jb.push_packet_at(&hdr(2000, 0, 1), b"b", t0), PushOutcome::Reset);
        assert_eq!(jb.stats().resets, 1);
        assert_eq!(jb.len(), 1);
        assert_eq!(jb.pop_frame_at(t0 + DEPTH).unwrap().frame_number, 2000);
    }

    /// Release frames `range` one at a time, as a steady stream would.
    fn stream(jb: &mut JitterBuffer, frames: impl Iterator<Item = u16>, t0: Instant) -> usize {
        let mut released = 0;
        for f in frames {
            jb.push_packet_at(&hdr(f, 0, 1), b"x", t0);
            released += usize::from(jb.pop_frame_at(t0 + DEPTH).is_some());
        }
        released
    }

    #[test]
    fn restarted_frame_counter_resets_after_long_run() {
        let mut jb = buffer();
        let t0 = Instant::now();
        assert_eq!(stream(&mut jb, 0..5000, t0), 5000);

        // The sender's encoder was reopened and counts from zero again.
        assert_eq!(jb.push_packet_at(&hdr(0, 0, 1), b"k", t0), PushOutcome::Reset);
        assert_eq!(jb.pop_frame_at(t0 + DEPTH).unwrap().frame_number, 0);
        assert_eq!(stream(&mut jb, 1..600, t0), 599);
        assert_eq!(jb.stats().resets, 1);
        assert_eq!(jb.stats().late, 0);
    }

    #[test]
    fn restarted_frame_counter_resets_after_short_run() {
        let mut jb = buffer();
        let t0 = Instant::now();
        assert_eq!(stream(&mut jb, 0..100, t0), 100);

        // Within max_frame_gap: the first two restarted frames are late,
        // the third confirms the restart.
        let outcomes: Vec<_> = (0..3).map(|f| jb.push_packet_at(&hdr(f, 0, 1), b"p", t0)).collect();
        assert_eq!(outcomes[..2], [PushOutcome::Rejected(Rejection::Late); 2]);
        assert_eq!(outcomes[2], PushOutcome::Reset);
        assert_eq!(jb.pop_frame_at(t0 + DEPTH).unwrap().frame_number, 2);
        assert_eq!(stream(&mut jb, 3..50, t0), 47);
    }

    #[test]
    fn sporadic_late_fragments_do_not_reset() {
        let mut jb = buffer();
        let t0 = Instant::now();
        stream(&mut jb, 0..10, t0);
        for f in 10..20u16 {
            // A duplicate of an already released frame between fresh ones.
            assert_eq!(
                jb.push_packet_at(&hdr(f - 5, 0, 1), b"d", t0),
                PushOutcome::Rejected(Rejection::Late)
            );
            stream(&mut jb, f..f + 1, t0);
        }
        let mut retransmit = hdr(2, 0, 1);
        retransmit.flags = FragmentFlags::RETRANSMIT;
        for _ in 0..5 {
            assert_eq!(jb.push_packet_at(&retransmit, b"r", t0), PushOutcome::Rejected(Rejection::Late));
        }
        assert_eq!(jb.stats().resets, 0);
    }

    #[test]
    fn oversized_gap_is_clamped_and_rejected_by_validation() {
        let cfg = JitterConfig {
            max_frame_gap: 40_000,
            ..JitterConfig::default()
        };
        assert_eq!(cfg.max_gap(), i16::MAX);
        assert!(matches!(cfg.validate(), Err(StreamError::InvalidConfig(_))));
        JitterConfig::default().validate().unwrap();

        let mut jb = JitterBuffer::new(cfg);
        let t0 = Instant::now();
        assert_eq!(stream(&mut jb, 0..20, t0), 20);
        assert_eq!(jb.stats().resets, 0);
    }

    #[test]
    fn flush_forgets_everything() {
        let mut jb = buffer();
        let t0 = Instant::now();
        jb.push_packet_at(&hdr(50, 0, 2), b"a", t0);
        jb.flush();
        assert!(jb.is_empty());
        // A frame "behind" the old head is accepted after a flush.
        jb.push_packet_at(&hdr(3, 0, 1), b"b", t0);
        assert_eq!(jb.pop_frame_at(t0 + DEPTH).unwrap().frame_number, 3);
    }

    #[test]
    fn keyframe_flag_propagates() {
        let mut jb = buffer();
        let t0 = Instant::now();
        let mut h = hdr(7, 0, 1);
        h.flags = FragmentFlags::KEYFRAME;
        jb.push_packet_at(&h, b"k", t0);
        assert!(jb.pop_frame_at(t0 + DEPTH).unwrap().keyframe);
    }
}
