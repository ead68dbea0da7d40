//! Receive Window
//!
//! Puts received buffers back into stream order. Buffers that arrive ahead of
//! the expected id are parked in a small out-of-order store; every accepted or
//! duplicate buffer queues its id for acknowledgment.

use crate::buffer::Buffer;
use crate::sequence::BufferId;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Capacity of the out-of-order store
pub const MAX_OUT_OF_ORDER: usize = 4;

/// What happened to a pushed buffer
#[derive(Debug)]
pub enum Arrival {
    /// The buffer is the next one in the stream and should be decoded now
    Expected(Buffer),
    /// Already received; acknowledged again and discarded
    Duplicate,
    /// Ahead of the stream; kept until the gap is filled
    Stored,
    /// Ahead of the stream but the store is full
    Dropped,
}

/// Receive side sequencing state
#[derive(Debug)]
pub struct ReceiveWindow {
    expected: BufferId,
    out_of_order: [Option<Buffer>; MAX_OUT_OF_ORDER],
    pending_acks: VecDeque<u32>,
}

impl ReceiveWindow {
    pub fn new() -> Self {
        ReceiveWindow {
            expected: BufferId::ZERO,
            out_of_order: std::array::from_fn(|_| None),
            pending_acks: VecDeque::new(),
        }
    }

    /// Id of the next buffer to hand to the decoder
    pub fn expected(&self) -> BufferId {
        self.expected
    }

    /// Classify a received stream buffer
    pub fn push(&mut self, buffer: Buffer) -> Arrival {
        let Some(id) = buffer.id() else {
            return Arrival::Dropped;
        };

        if id == self.expected {
            trace!(%id, "in order");
            self.pending_acks.push_back(id.as_raw());
            self.expected.increment();
            return Arrival::Expected(buffer);
        }

        if id.lt(self.expected) {
            trace!(%id, expected = %self.expected, "duplicate");
            self.pending_acks.push_back(id.as_raw());
            return Arrival::Duplicate;
        }

        if self.stored(id) {
            trace!(%id, "duplicate out of order");
            self.pending_acks.push_back(id.as_raw());
            return Arrival::Duplicate;
        }

        match self.out_of_order.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                trace!(%id, expected = %self.expected, "stored out of order");
                *slot = Some(buffer);
                self.pending_acks.push_back(id.as_raw());
                Arrival::Stored
            }
            None => {
                debug!(%id, expected = %self.expected, "out of order store full, dropping");
                Arrival::Dropped
            }
        }
    }

    /// Take the stored buffer matching the expected id, advancing the cursor
    pub fn next_in_order(&mut self) -> Option<Buffer> {
        let expected = self.expected;
        let slot = self
            .out_of_order
            .iter_mut()
            .find(|slot| slot.as_ref().and_then(|b| b.id()) == Some(expected))?;
        let buffer = slot.take()?;
        self.expected.increment();
        trace!(id = %expected, "released from out of order store");
        Some(buffer)
    }

    fn stored(&self, id: BufferId) -> bool {
        self.out_of_order
            .iter()
            .flatten()
            .any(|buffer| buffer.id() == Some(id))
    }

    /// Number of buffers parked out of order
    pub fn out_of_order_count(&self) -> usize {
        self.out_of_order.iter().flatten().count()
    }

    /// Queue an acknowledgment outside the stream (keepalive)
    pub fn queue_ack(&mut self, raw_id: u32) {
        self.pending_acks.push_back(raw_id);
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    /// Remove up to `max` pending acknowledgments, oldest first
    pub fn take_acks(&mut self, max: usize) -> Vec<u32> {
        let count = max.min(self.pending_acks.len());
        self.pending_acks.drain(..count).collect()
    }

    /// Put back acknowledgments taken by `take_acks` that were not sent
    pub fn restore_acks(&mut self, acks: Vec<u32>) {
        for id in acks.into_iter().rev() {
            self.pending_acks.push_front(id);
        }
    }

    pub fn reset(&mut self) {
        self.expected = BufferId::ZERO;
        self.out_of_order.iter_mut().for_each(|slot| *slot = None);
        self.pending_acks.clear();
    }
}

impl Default for ReceiveWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferType, DEFAULT_CAPACITY};

    fn data(id: u32) -> Buffer {
        let mut buffer = Buffer::new(BufferType::Data, DEFAULT_CAPACITY);
        buffer.set_id(BufferId::new(id));
        buffer
    }

    fn drain(window: &mut ReceiveWindow, first: Buffer) -> Vec<u32> {
        let mut ids = vec![first.raw_id()];
        while let Some(buffer) = window.next_in_order() {
            ids.push(buffer.raw_id());
        }
        ids
    }

    #[test]
    fn test_in_order() {
        let mut window = ReceiveWindow::new();
        assert!(matches!(window.push(data(0)), Arrival::Expected(_)));
        assert!(matches!(window.push(data(1)), Arrival::Expected(_)));
        assert_eq!(window.expected(), BufferId::new(2));
        assert_eq!(window.take_acks(8), vec![0, 1]);
    }

    #[test]
    fn test_duplicate_is_reacknowledged() {
        let mut window = ReceiveWindow::new();
        window.push(data(0));
        window.take_acks(8);

        assert!(matches!(window.push(data(0)), Arrival::Duplicate));
        assert_eq!(window.take_acks(8), vec![0]);
    }

    #[test]
    fn test_out_of_order_cascade() {
        let mut window = ReceiveWindow::new();
        assert!(matches!(window.push(data(2)), Arrival::Stored));
        assert!(matches!(window.push(data(1)), Arrival::Stored));
        assert!(matches!(window.push(data(3)), Arrival::Stored));

        let Arrival::Expected(first) = window.push(data(0)) else {
            panic!("expected in-order arrival");
        };
        assert_eq!(drain(&mut window, first), vec![0, 1, 2, 3]);
        assert_eq!(window.expected(), BufferId::new(4));
        assert_eq!(window.out_of_order_count(), 0);
    }

    #[test]
    fn test_store_full_drops() {
        let mut window = ReceiveWindow::new();
        for id in 1..=4 {
            assert!(matches!(window.push(data(id)), Arrival::Stored));
        }
        assert!(matches!(window.push(data(5)), Arrival::Dropped));
        assert_eq!(window.pending_ack_count(), 4);
    }

    #[test]
    fn test_second_copy_of_stored() {
        let mut window = ReceiveWindow::new();
        window.push(data(3));
        assert!(matches!(window.push(data(3)), Arrival::Duplicate));
        assert_eq!(window.out_of_order_count(), 1);
        assert_eq!(window.take_acks(8), vec![3, 3]);
    }

    #[test]
    fn test_take_acks_limit() {
        let mut window = ReceiveWindow::new();
        for id in 0..10 {
            window.push(data(id));
        }
        assert_eq!(window.take_acks(8).len(), 8);
        assert_eq!(window.take_acks(8), vec![8, 9]);
    }

    #[test]
    fn test_restore_acks_keeps_order() {
        let mut window = ReceiveWindow::new();
        for id in 0..3 {
            window.push(data(id));
        }
        let taken = window.take_acks(2);
        window.restore_acks(taken);
        assert_eq!(window.take_acks(8), vec![0, 1, 2]);
    }

    #[test]
    fn test_reset() {
        let mut window = ReceiveWindow::new();
        window.push(data(0));
        window.push(data(5));
        window.reset();

        assert_eq!(window.expected(), BufferId::ZERO);
        assert_eq!(window.out_of_order_count(), 0);
        assert_eq!(window.pending_ack_count(), 0);
    }
}
