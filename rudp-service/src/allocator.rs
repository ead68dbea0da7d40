//! Talker Allocation
//!
//! Spreads sessions over a bounded pool of talkers. Talkers with spare
//! capacity wait in a queue; once every talker is full and the pool cannot
//! grow, sessions are forced onto talkers round-robin.

use std::collections::VecDeque;
use tracing::debug;

/// Session bookkeeping for every talker of a service
#[derive(Debug)]
pub struct TalkerAllocator {
    sessions_per_talker: u32,
    max_talkers: usize,
    counts: Vec<u32>,
    available: VecDeque<usize>,
    forced_cursor: usize,
}

impl TalkerAllocator {
    pub fn new(sessions_per_talker: u32, max_talkers: usize) -> Self {
        TalkerAllocator {
            sessions_per_talker: sessions_per_talker.max(1),
            max_talkers: max_talkers.max(1),
            counts: Vec::new(),
            available: VecDeque::new(),
            forced_cursor: 0,
        }
    }

    /// Number of talkers registered
    pub fn talker_count(&self) -> usize {
        self.counts.len()
    }

    /// Sessions currently assigned to `talker`
    pub fn session_count(&self, talker: usize) -> u32 {
        self.counts.get(talker).copied().unwrap_or(0)
    }

    /// True while another talker may be added
    pub fn can_grow(&self) -> bool {
        self.counts.len() < self.max_talkers
    }

    /// Register a freshly started talker, returning its index
    pub fn add_talker(&mut self) -> usize {
        let index = self.counts.len();
        self.counts.push(0);
        self.available.push_back(index);
        debug!(talker = index, "talker registered");
        index
    }

    /// Assign a session to the first talker with spare capacity
    pub fn allocate(&mut self) -> Option<usize> {
        let talker = *self.available.front()?;
        self.counts[talker] += 1;
        if self.counts[talker] >= self.sessions_per_talker {
            self.available.pop_front();
        }
        Some(talker)
    }

    /// Assign a session ignoring the per-talker cap
    pub fn allocate_forced(&mut self) -> Option<usize> {
        if self.counts.is_empty() {
            return None;
        }
        let talker = self.forced_cursor % self.counts.len();
        self.counts[talker] += 1;
        self.forced_cursor = (talker + 1) % self.counts.len();
        debug!(
            talker,
            sessions = self.counts[talker],
            "talker pool exhausted, forcing allocation"
        );
        Some(talker)
    }

    /// A session of `talker` ended
    pub fn release(&mut self, talker: usize) {
        let Some(count) = self.counts.get_mut(talker) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count < self.sessions_per_talker && !self.available.contains(&talker) {
            self.available.push_back(talker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fills_front_talker_first() {
        let mut alloc = TalkerAllocator::new(2, 4);
        alloc.add_talker();

        assert_eq!(alloc.allocate(), Some(0));
        assert_eq!(alloc.allocate(), Some(0));
        assert_eq!(alloc.session_count(0), 2);
        assert_eq!(alloc.allocate(), None);
        assert!(alloc.can_grow());
    }

    #[test]
    fn test_new_talker_is_used_next() {
        let mut alloc = TalkerAllocator::new(1, 4);
        alloc.add_talker();
        assert_eq!(alloc.allocate(), Some(0));

        assert_eq!(alloc.allocate(), None);
        let index = alloc.add_talker();
        assert_eq!(index, 1);
        assert_eq!(alloc.allocate(), Some(1));
    }

    #[test]
    fn test_forced_allocation_round_robin() {
        let mut alloc = TalkerAllocator::new(1, 2);
        alloc.add_talker();
        alloc.add_talker();
        alloc.allocate();
        alloc.allocate();

        assert!(!alloc.can_grow());
        assert_eq!(alloc.allocate(), None);
        assert_eq!(alloc.allocate_forced(), Some(0));
        assert_eq!(alloc.allocate_forced(), Some(1));
        assert_eq!(alloc.allocate_forced(), Some(0));
        assert_eq!(alloc.session_count(0), 3);
        assert_eq!(alloc.session_count(1), 2);
    }

    #[test]
    fn test_forced_without_talkers() {
        let mut alloc = TalkerAllocator::new(4, 4);
        assert_eq!(alloc.allocate(), None);
        assert_eq!(alloc.allocate_forced(), None);
    }

    #[test]
    fn test_release_requeues_once() {
        let mut alloc = TalkerAllocator::new(2, 1);
        alloc.add_talker();
        alloc.allocate();
        alloc.allocate();
        alloc.allocate_forced();
        assert_eq!(alloc.session_count(0), 3);

        // Still at the cap after the first release
        alloc.release(0);
        assert_eq!(alloc.allocate(), None);

        alloc.release(0);
        alloc.release(0);
        assert_eq!(alloc.session_count(0), 0);
        assert_eq!(alloc.allocate(), Some(0));
        assert_eq!(alloc.allocate(), Some(0));
        assert_eq!(alloc.allocate(), None);
    }

    #[test]
    fn test_release_unknown_talker_is_ignored() {
        let mut alloc = TalkerAllocator::new(2, 2);
        alloc.release(5);
        assert_eq!(alloc.talker_count(), 0);
    }
}
