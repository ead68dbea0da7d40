//! Send Window
//!
//! Fixed array of send slots. Slot 0 is reserved for the keepalive buffer, and
//! the other slots hold data and handshake buffers until they are
//! acknowledged. Every slot carries a generation that changes each time the
//! slot gets a new occupant; timers and send completions carry the generation
//! they were issued for, so stale ones can be recognized.

use crate::buffer::Buffer;
use crate::signal::SignalUid;
use std::fmt;

/// Index of the keepalive slot
pub const KEEPALIVE_SLOT: u16 = 0;

/// Identifies one occupancy of one send slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey {
    pub slot: u16,
    pub generation: u16,
}

impl TimerKey {
    pub fn new(slot: u16, generation: u16) -> Self {
        TimerKey { slot, generation }
    }

    pub fn is_keepalive(self) -> bool {
        self.slot == KEEPALIVE_SLOT
    }
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.slot, self.generation)
    }
}

/// What a queued send belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendKey {
    /// A buffer held in a send slot
    Window(TimerKey),
    /// The update-only buffer
    Updates,
}

#[derive(Debug, Default)]
pub struct SendSlot {
    pub buffer: Option<Buffer>,
    /// Signals whose last chunk is in this buffer
    pub signals: Vec<SignalUid>,
    generation: u16,
    /// Handed to the talker but not yet on the wire
    pub sending: bool,
    /// Acknowledged while sending; freed once the send completes
    must_delete: bool,
}

impl SendSlot {
    pub fn generation(&self) -> u16 {
        self.generation
    }

    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Send slots of a session
#[derive(Debug)]
pub struct SendWindow {
    slots: Vec<SendSlot>,
    free: Vec<u16>,
}

impl SendWindow {
    /// Window with `max_send_buffers` data slots plus the keepalive slot
    pub fn new(max_send_buffers: usize) -> Self {
        let slots = (0..=max_send_buffers).map(|_| SendSlot::default()).collect();
        let mut window = SendWindow {
            slots,
            free: Vec::with_capacity(max_send_buffers),
        };
        window.rebuild_free();
        window
    }

    fn rebuild_free(&mut self) {
        self.free.clear();
        self.free.extend((1..self.slots.len() as u16).rev());
    }

    /// Number of data slots
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    /// Number of occupied data slots
    pub fn in_flight(&self) -> usize {
        self.capacity() - self.free.len()
    }

    /// Put a buffer into a free data slot
    pub fn allocate(&mut self, buffer: Buffer, signals: Vec<SignalUid>) -> Option<TimerKey> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.buffer.is_none());
        slot.buffer = Some(buffer);
        slot.signals = signals;
        slot.sending = false;
        slot.must_delete = false;
        Some(TimerKey::new(index, slot.generation))
    }

    /// Occupy the keepalive slot with a fresh generation
    pub fn arm_keepalive(&mut self, buffer: Buffer) -> TimerKey {
        let slot = &mut self.slots[KEEPALIVE_SLOT as usize];
        slot.bump();
        slot.buffer = Some(buffer);
        slot.sending = false;
        TimerKey::new(KEEPALIVE_SLOT, slot.generation)
    }

    /// Empty the keepalive slot, invalidating its timer
    pub fn disarm_keepalive(&mut self) {
        let slot = &mut self.slots[KEEPALIVE_SLOT as usize];
        if slot.buffer.take().is_some() {
            slot.bump();
        }
    }

    pub fn keepalive_armed(&self) -> bool {
        self.slots[KEEPALIVE_SLOT as usize].buffer.is_some()
    }

    /// The slot `key` was issued for, if it still holds that occupant
    pub fn get_mut(&mut self, key: TimerKey) -> Option<&mut SendSlot> {
        let slot = self.slots.get_mut(key.slot as usize)?;
        (slot.generation == key.generation && slot.buffer.is_some() && !slot.must_delete)
            .then_some(slot)
    }

    /// Current key of an occupied slot
    pub fn key(&self, index: u16) -> Option<TimerKey> {
        let slot = self.slots.get(index as usize)?;
        slot.buffer
            .as_ref()
            .map(|_| TimerKey::new(index, slot.generation))
    }

    /// Find the data slot holding the buffer with this raw id
    pub fn find(&self, raw_id: u32) -> Option<u16> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, slot)| {
                !slot.must_delete && slot.buffer.as_ref().map(Buffer::raw_id) == Some(raw_id)
            })
            .map(|(index, _)| index as u16)
    }

    /// Release an acknowledged data slot, returning the signals it completed
    /// and the buffer for reuse.
    ///
    /// A slot that is still being sent stays reserved until `sent` is called.
    pub fn release(&mut self, index: u16) -> (Vec<SignalUid>, Option<Buffer>) {
        let slot = &mut self.slots[index as usize];
        let signals = std::mem::take(&mut slot.signals);
        slot.bump();
        if slot.sending {
            slot.must_delete = true;
            (signals, None)
        } else {
            self.free.push(index);
            (signals, slot.buffer.take())
        }
    }

    /// A queued send finished.
    ///
    /// Returns true if the slot still holds the buffer and it should be
    /// armed for retransmission.
    pub fn sent(&mut self, key: TimerKey) -> bool {
        let Some(slot) = self.slots.get_mut(key.slot as usize) else {
            return false;
        };
        if slot.must_delete {
            // The release bumped the generation past the key
            if slot.generation == key.generation.wrapping_add(1) {
                slot.must_delete = false;
                slot.sending = false;
                slot.buffer = None;
                self.free.push(key.slot);
            }
            return false;
        }
        if slot.generation != key.generation || slot.buffer.is_none() {
            return false;
        }
        slot.sending = false;
        true
    }

    /// Drop every buffer and invalidate every outstanding key
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.buffer = None;
            slot.signals.clear();
            slot.sending = false;
            slot.must_delete = false;
            slot.bump();
        }
        self.rebuild_free();
    }

    /// Signals referenced by any slot
    #[cfg(test)]
    fn signals(&self) -> impl Iterator<Item = &SignalUid> {
        self.slots.iter().flat_map(|slot| slot.signals.iter())
    }
}
