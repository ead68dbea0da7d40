//! Buffer Id Handling
//!
//! Buffer ids are 32-bit values that run from 0 to `LAST_BUFFER_ID` and then
//! wrap back to 0. The ids above `LAST_BUFFER_ID` are reserved markers for
//! buffers that live outside the ordered stream.

use std::fmt;

/// Highest id a buffer of the ordered stream can carry
pub const LAST_BUFFER_ID: u32 = 0xFFFF_FFFD;

/// Id of a keepalive buffer (acknowledged, but never part of the stream)
pub const KEEPALIVE_BUFFER_ID: u32 = 0xFFFF_FFFE;

/// Id of a buffer that only carries updates
pub const UPDATE_BUFFER_ID: u32 = 0xFFFF_FFFF;

const HALF_RANGE: u32 = 1 << 31;

/// Wraparound-safe "a comes before b" over the full 32-bit space.
///
/// `a` is before `b` when the forward distance from `a` to `b` is non-zero and
/// smaller than half the id space. At exactly half the space the raw values
/// decide, which keeps the relation antisymmetric.
#[inline]
pub fn less(a: u32, b: u32) -> bool {
    let distance = b.wrapping_sub(a);
    distance != 0 && (distance < HALF_RANGE || (distance == HALF_RANGE && a < b))
}

/// Sequence id of a buffer in the ordered stream
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct BufferId(u32);

impl BufferId {
    /// The first id of every stream
    pub const ZERO: BufferId = BufferId(0);

    /// Create a new buffer id
    ///
    /// # Panics
    /// Panics if value exceeds LAST_BUFFER_ID
    pub fn new(value: u32) -> Self {
        assert!(
            value <= LAST_BUFFER_ID,
            "Buffer id {} exceeds maximum {}",
            value,
            LAST_BUFFER_ID
        );
        BufferId(value)
    }

    /// Interpret a raw wire id, rejecting the reserved markers
    #[inline]
    pub fn from_wire(value: u32) -> Option<Self> {
        (value <= LAST_BUFFER_ID).then_some(BufferId(value))
    }

    /// Get the raw id value
    #[inline]
    pub fn as_raw(self) -> u32 {
        self.0
    }

    /// Advance to the next id, wrapping after LAST_BUFFER_ID
    #[inline]
    pub fn increment(&mut self) {
        *self = self.next();
    }

    /// Get the next id
    #[inline]
    pub fn next(self) -> Self {
        if self.0 >= LAST_BUFFER_ID {
            BufferId(0)
        } else {
            BufferId(self.0 + 1)
        }
    }

    /// Check if this id comes before another (accounting for wraparound)
    #[inline]
    pub fn lt(self, other: BufferId) -> bool {
        less(self.0, other.0)
    }

    /// Check if this id comes after another
    #[inline]
    pub fn gt(self, other: BufferId) -> bool {
        less(other.0, self.0)
    }

    #[inline]
    pub fn le(self, other: BufferId) -> bool {
        self == other || self.lt(other)
    }

    #[inline]
    pub fn ge(self, other: BufferId) -> bool {
        self == other || self.gt(other)
    }
}

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferId({})", self.0)
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<BufferId> for u32 {
    fn from(id: BufferId) -> u32 {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        assert_eq!(BufferId::new(100).as_raw(), 100);
    }

    #[test]
    #[should_panic]
    fn test_new_reserved() {
        BufferId::new(UPDATE_BUFFER_ID);
    }

    #[test]
    fn test_from_wire_rejects_markers() {
        assert!(BufferId::from_wire(UPDATE_BUFFER_ID).is_none());
        assert!(BufferId::from_wire(KEEPALIVE_BUFFER_ID).is_none());
        assert_eq!(BufferId::from_wire(LAST_BUFFER_ID), Some(BufferId::new(LAST_BUFFER_ID)));
    }

    #[test]
    fn test_increment_wraparound() {
        let mut id = BufferId::new(LAST_BUFFER_ID);
        id.increment();
        assert_eq!(id, BufferId::ZERO);
    }

    #[test]
    fn test_less_simple() {
        assert!(less(100, 200));
        assert!(!less(200, 100));
        assert!(!less(7, 7));
    }

    #[test]
    fn test_less_wraparound() {
        assert!(less(u32::MAX - 10, 10));
        assert!(!less(10, u32::MAX - 10));
    }

    #[test]
    fn test_less_half_range_tie() {
        assert!(less(0, HALF_RANGE));
        assert!(!less(HALF_RANGE, 0));
        assert!(less(5, HALF_RANGE + 5));
        assert!(!less(HALF_RANGE + 5, 5));
    }

    #[test]
    fn test_comparison_across_stream_wrap() {
        let last = BufferId::new(LAST_BUFFER_ID);
        let first = last.next();

        assert!(last.lt(first));
        assert!(first.gt(last));
        assert!(last.le(last));
        assert!(first.ge(first));
    }
}
