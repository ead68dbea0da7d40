//! Retransmission Timeouts
//!
//! A static table maps a position to a delay. Each session keeps a cursor into
//! the table; the cursor is recalibrated at every refresh boundary of the
//! buffer id space (low 7 bits zero), so transient loss spikes do not inflate
//! delays forever.

use std::sync::OnceLock;
use std::time::Duration;

/// Buffer ids with these bits clear reset the backoff cursor
pub const REFRESH_MASK: u32 = (1 << 7) - 1;

/// Default retransmit threshold for data and keepalive buffers
pub const DATA_RETRANSMIT_COUNT: u8 = 8;

/// Default retransmit threshold for handshake buffers
pub const CONNECT_RETRANSMIT_COUNT: u8 = 16;

const RAMP_MS: [u64; 6] = [200, 400, 800, 1200, 1600, 2000];

/// Lookup table of retransmission delays
#[derive(Debug, Clone)]
pub struct RetransmitTimeoutTable {
    delays: Vec<Duration>,
}

impl RetransmitTimeoutTable {
    /// Build a table large enough for `max_retransmit_count` attempts on top of
    /// an equally advanced cursor
    pub fn new(max_retransmit_count: u8) -> Self {
        let size = ((max_retransmit_count as usize) + 1) * 2;
        let size = size.max(RAMP_MS.len());
        let delays = (0..size)
            .map(|i| Duration::from_millis(*RAMP_MS.get(i).unwrap_or(&2000)))
            .collect();
        RetransmitTimeoutTable { delays }
    }

    /// Table sized for the default thresholds, shared by all sessions.
    /// Positions past its end clamp to the last delay.
    pub fn standard() -> &'static RetransmitTimeoutTable {
        static TABLE: OnceLock<RetransmitTimeoutTable> = OnceLock::new();
        TABLE.get_or_init(|| {
            RetransmitTimeoutTable::new(DATA_RETRANSMIT_COUNT.max(CONNECT_RETRANSMIT_COUNT))
        })
    }

    /// Delay at `position`, clamped to the last entry
    pub fn delay(&self, position: usize) -> Duration {
        let last = self.delays.len() - 1;
        self.delays[position.min(last)]
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}

/// Per-session backoff cursor
///
/// The cursor only moves forward between refresh boundaries, which keeps the
/// delays computed for a single buffer non-decreasing as its retransmit count
/// grows.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    position: usize,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff { position: 0 }
    }

    /// Delay before the next retransmission of buffer `buffer_id`, which has
    /// already been retransmitted `retransmit_count` times
    pub fn timeout(
        &mut self,
        table: &RetransmitTimeoutTable,
        retransmit_count: u8,
        buffer_id: u32,
    ) -> Duration {
        if buffer_id & REFRESH_MASK == 0 {
            self.position = 0;
        }
        let count = retransmit_count as usize;
        self.position = self.position.max(count);
        table.delay(self.position + count)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_contents() {
        let table = RetransmitTimeoutTable::standard();
        assert_eq!(table.len(), 34);
        assert_eq!(table.delay(0), Duration::from_millis(200));
        assert_eq!(table.delay(3), Duration::from_millis(1200));
        assert_eq!(table.delay(5), Duration::from_millis(2000));
        assert_eq!(table.delay(33), Duration::from_millis(2000));
        assert_eq!(table.delay(1000), Duration::from_millis(2000));
    }

    #[test]
    fn test_small_table_keeps_ramp() {
        let table = RetransmitTimeoutTable::new(0);
        assert_eq!(table.len(), RAMP_MS.len());
    }

    #[test]
    fn test_first_send_uses_table_start() {
        let table = RetransmitTimeoutTable::standard();
        let mut backoff = Backoff::new();
        assert_eq!(backoff.timeout(table, 0, 1), Duration::from_millis(200));
    }

    #[test]
    fn test_monotone_for_one_buffer() {
        let table = RetransmitTimeoutTable::standard();
        let mut backoff = Backoff::new();
        // Advance the cursor through another buffer first
        backoff.timeout(table, 3, 5);

        let mut previous = Duration::ZERO;
        for count in 0..=DATA_RETRANSMIT_COUNT {
            let delay = backoff.timeout(table, count, 9);
            assert!(delay >= previous, "count {} went from {:?} to {:?}", count, previous, delay);
            previous = delay;
        }
    }

    #[test]
    fn test_refresh_boundary_resets() {
        let table = RetransmitTimeoutTable::standard();
        let mut backoff = Backoff::new();
        backoff.timeout(table, 4, 3);
        assert_eq!(backoff.position(), 4);

        assert_eq!(backoff.timeout(table, 0, 128), Duration::from_millis(200));
        assert_eq!(backoff.position(), 0);
    }
}
