//! Receiver-side loss detection and NACK scheduling.
//!
//! The tracker watches datagram sequence numbers, remembers which ones
//! arrived, and on every scan reports the gaps that deserve another
//! retransmission request. Each gap is requested a bounded number of times
//! and then abandoned for good.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::protocol::{seq_diff, seq_newer};

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NackConfig {
    /// Sequences tracked behind the highest one seen.
    pub window: u16,
    /// Received sequences remembered for duplicate detection.
    pub history: usize,
    /// NACKs sent per sequence before it is abandoned.
    pub max_retries: u8,
    /// Upper bound on sequences returned by one scan.
    pub max_nacks_per_check: usize,
    /// Period of the NACK timer thread.
    pub check_interval_ms: u64,
    /// Minimum spacing between two NACKs for the same sequence.
    pub retry_interval_ms: u64,
}

impl Default for NackConfig {
    fn default() -> Self {
        Self {
            window: 500,
            history: 1000,
            max_retries: 3,
            max_nacks_per_check: 64,
            check_interval_ms: 5,
            retry_interval_ms: 20,
        }
    }
}

impl NackConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Cumulative loss accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NackStats {
    /// Sequences the sender is known to have emitted.
    pub expected: u64,
    /// Sequences given up on (retries exhausted or fell out of the window).
    pub lost: u64,
    /// Sequence numbers placed in NACKs.
    pub nacks_sent: u64,
    /// NACKed sequences that later arrived.
    pub recovered: u64,
    pub duplicates: u64,
}

impl NackStats {
    /// Fraction of expected datagrams that were lost for good.
    pub fn loss_fraction(&self) -> f64 {
        if self.expected == 0 {
            0.0
        } else {
            self.lost as f64 / self.expected as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempts: u8,
    last_sent: Instant,
}

// ── NackTracker ──────────────────────────────────────────────────

#[derive(Debug)]
pub struct NackTracker {
    config: NackConfig,
    highest: Option<u16>,
    /// Oldest sequence still inside the window.
    base: u16,
    received: HashSet<u16>,
    received_order: VecDeque<u16>,
    retries: HashMap<u16, RetryState>,
    abandoned: HashSet<u16>,
    stats: NackStats,
}

impl NackTracker {
    pub fn new(config: NackConfig) -> Self {
        Self {
            config,
            highest: None,
            base: 0,
            received: HashSet::new(),
            received_order: VecDeque::new(),
            retries: HashMap::new(),
            abandoned: HashSet::new(),
            stats: NackStats::default(),
        }
    }

    pub fn config(&self) -> &NackConfig {
        &self.config
    }

    pub fn stats(&self) -> NackStats {
        self.stats
    }

    pub fn highest(&self) -> Option<u16> {
        self.highest
    }

    /// Sequences currently awaiting a retransmission.
    pub fn pending(&self) -> usize {
        self.retries.len()
    }

    /// Record an arrived datagram. Returns `false` for duplicates.
    pub fn on_packet(&mut self, seq: u16) -> bool {
        let Some(highest) = self.highest else {
            self.highest = Some(seq);
            self.base = seq;
            self.stats.expected += 1;
            self.remember(seq);
            return true;
        };

        if self.received.contains(&seq) {
            self.stats.duplicates += 1;
            return false;
        }

        let ahead = seq_diff(seq, highest);
        if ahead > 0 {
            self.stats.expected += ahead as u64;
            self.highest = Some(seq);
            self.advance_base(seq);
        } else if seq_newer(self.base, seq) {
            // Behind the window: too old to matter.
            return true;
        }

        if self.retries.remove(&seq).is_some() {
            self.stats.recovered += 1;
        }
        self.remember(seq);
        true
    }

    /// Gaps due for a NACK now.
    pub fn scan(&mut self) -> Vec<u16> {
        self.scan_at(Instant::now())
    }

    /// Gaps due for a NACK as of `now`, oldest first.
    ///
    /// A sequence is returned at most `max_retries` times in total, spaced
    /// at least `retry_interval` apart; once its retries are spent and the
    /// last one has had its interval to be answered, it is abandoned.
    pub fn scan_at(&mut self, now: Instant) -> Vec<u16> {
        let Some(highest) = self.highest else {
            return Vec::new();
        };
        let cap = self.config.max_nacks_per_check;
        let retry_interval = self.config.retry_interval();
        let mut out = Vec::new();

        let mut seq = self.base;
        while seq_newer(highest, seq) && out.len() < cap {
            if !self.received.contains(&seq) && !self.abandoned.contains(&seq) {
                match self.retries.get_mut(&seq) {
                    None => {
                        self.retries.insert(
                            seq,
                            RetryState {
                                attempts: 1,
                                last_sent: now,
                            },
                        );
                        out.push(seq);
                    }
                    Some(state) if now.saturating_duration_since(state.last_sent) >= retry_interval => {
                        if state.attempts >= self.config.max_retries {
                            self.retries.remove(&seq);
                            self.abandoned.insert(seq);
                            self.stats.lost += 1;
                            trace!(seq, "abandoning sequence after max retries");
                        } else {
                            state.attempts += 1;
                            state.last_sent = now;
                            out.push(seq);
                        }
                    }
                    Some(_) => {}
                }
            }
            seq = seq.wrapping_add(1);
        }

        self.stats.nacks_sent += out.len() as u64;
        out
    }

    /// Forget all sequence state (after a reconnect). Counters persist.
    pub fn flush(&mut self) {
        self.highest = None;
        self.base = 0;
        self.received.clear();
        self.received_order.clear();
        self.retries.clear();
        self.abandoned.clear();
    }

    // ── Internal ─────────────────────────────────────────────────

    fn remember(&mut self, seq: u16) {
        if self.received.insert(seq) {
            self.received_order.push_back(seq);
        }
        while self.received_order.len() > self.config.history {
            if let Some(old) = self.received_order.pop_front() {
                self.received.remove(&old);
            }
        }
    }

    /// Slide the window so it ends at `highest`; gaps that fall out of it
    /// without arriving are lost.
    fn advance_base(&mut self, highest: u16) {
        let window = self.config.window.max(1);
        let new_base = highest.wrapping_sub(window - 1);
        while seq_newer(new_base, self.base) {
            let seq = self.base;
            if !self.received.contains(&seq) && !self.abandoned.remove(&seq) {
                self.stats.lost += 1;
            }
            self.retries.remove(&seq);
            self.base = seq.wrapping_add(1);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
