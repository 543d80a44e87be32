//! Hand-offs between viewer threads.
//!
//! Both are a `parking_lot` mutex plus condvar. `close()` wakes every
//! waiter so stage threads can observe shutdown promptly.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

// ── LatestSlot ───────────────────────────────────────────────────

struct SlotState<T> {
    value: Option<T>,
    closed: bool,
    replaced: u64,
}

/// Holds at most one value; a newer `put` replaces an unconsumed one.
pub struct LatestSlot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                value: None,
                closed: false,
                replaced: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Store `value`. Returns `true` when it replaced one nobody took.
    pub fn put(&self, value: T) -> bool {
        let mut s = self.state.lock();
        let replaced = s.value.replace(value).is_some();
        if replaced {
            s.replaced += 1;
        }
        drop(s);
        self.ready.notify_one();
        replaced
    }

    /// Wait up to `timeout` for a value. `None` on timeout or close.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut s = self.state.lock();
        loop {
            if let Some(v) = s.value.take() {
                return Some(v);
            }
            if s.closed || self.ready.wait_until(&mut s, deadline).timed_out() {
                return s.value.take();
            }
        }
    }

    pub fn try_take(&self) -> Option<T> {
        self.state.lock().value.take()
    }

    /// Values overwritten before being taken.
    pub fn replaced(&self) -> u64 {
        self.state.lock().replaced
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ── BoundedQueue ─────────────────────────────────────────────────

struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
    dropped: u64,
}

/// FIFO that discards its oldest item when full.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                closed: false,
                dropped: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Append `item`, returning the evicted oldest item if the queue was
    /// full.
    pub fn push(&self, item: T) -> Option<T> {
        let mut s = self.state.lock();
        let evicted = if s.items.len() >= s.capacity {
            s.dropped += 1;
            s.items.pop_front()
        } else {
            None
        };
        s.items.push_back(item);
        drop(s);
        self.ready.notify_one();
        evicted
    }

    /// Wait up to `timeout` for the oldest item.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut s = self.state.lock();
        loop {
            if let Some(item) = s.items.pop_front() {
                return Some(item);
            }
            if s.closed || self.ready.wait_until(&mut s, deadline).timed_out() {
                return s.items.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.state.lock().items.clear();
    }

    /// Items evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}
