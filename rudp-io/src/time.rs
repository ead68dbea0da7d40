//! Timer utilities for talkers
//!
//! `TimerQueue` orders one-shot deadlines for the talker loop; `Timer` is a
//! simple periodic trigger.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Min-heap of one-shot deadlines
///
/// Deadlines that are equal fire in insertion order.
#[derive(Debug)]
pub struct TimerQueue<K: Ord> {
    heap: BinaryHeap<Reverse<(Instant, u64, K)>>,
    sequence: u64,
}

impl<K: Ord> TimerQueue<K> {
    pub fn new() -> Self {
        TimerQueue {
            heap: BinaryHeap::new(),
            sequence: 0,
        }
    }

    /// Schedule `key` at `deadline`
    pub fn push(&mut self, deadline: Instant, key: K) {
        self.heap.push(Reverse((deadline, self.sequence, key)));
        self.sequence = self.sequence.wrapping_add(1);
    }

    /// Remove and return the earliest entry due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<(Instant, K)> {
        match self.heap.peek() {
            Some(Reverse((deadline, _, _))) if *deadline <= now => {
                self.heap.pop().map(|Reverse((deadline, _, key))| (deadline, key))
            }
            _ => None,
        }
    }

    /// Earliest scheduled deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Time until the earliest deadline, zero if already due
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Drop every entry for which `keep` returns false
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&K) -> bool,
    {
        self.heap.retain(|Reverse((_, _, key))| keep(key));
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

impl<K: Ord> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic trigger
///
/// Used by talkers for periodic housekeeping such as statistics reports.
pub struct Timer {
    interval: Duration,
    last_fire: Instant,
}

impl Timer {
    /// Create a new timer with the given interval
    pub fn new(interval: Duration) -> Self {
        Timer {
            interval,
            last_fire: Instant::now(),
        }
    }

    /// Check if the timer has expired
    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_fire) >= self.interval
    }

    /// Fire the timer if expired, returning true if it fired
    pub fn try_fire(&mut self, now: Instant) -> bool {
        if self.expired(now) {
            self.last_fire = now;
            true
        } else {
            false
        }
    }

    /// Get the interval
    pub fn interval(&self) -> Duration {
        self.interval
    }
}
