//! Outbound Multiplexer
//!
//! Turns queued signals into data buffer payloads. Several signals can be in
//! flight at once; a credit counter limits how many consecutive buffers one
//! signal may fill before the multiplexer rotates to the next.
//!
//! Signals live in a slot arena. A `SignalUid` is the slot index plus the
//! slot's generation, so acknowledgments or responses naming a slot that has
//! since been reused are ignored.

use crate::buffer::{Buffer, DataTag};
use crate::codec::{CodecPool, FrameEncoder};
use crate::sequence::less;
use crate::signal::{SendDisposition, SendOptions, Signal, SignalUid};
use std::cmp::Ordering;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Consecutive buffers one signal may fill while others wait
pub const MAX_SIGNAL_BUFFER_COUNT: usize = 8;

/// Signals admitted for sending at the same time
pub const MAX_SENDING_SIGNALS: usize = 32;

/// Free space below which a completed signal closes the buffer
pub const MIN_SHARED_SPACE: usize = 16;

struct OutboundEntry {
    signal: Option<Box<dyn Signal>>,
    encoder: Option<FrameEncoder>,
    generation: u32,
    waits_response: bool,
    sent_once: bool,
    same_connector: bool,
    sequence: u32,
}

impl OutboundEntry {
    fn vacant() -> Self {
        OutboundEntry {
            signal: None,
            encoder: None,
            generation: 0,
            waits_response: false,
            sent_once: false,
            same_connector: false,
            sequence: 0,
        }
    }
}

/// Outbound signal scheduling state of one session
pub struct Multiplexer {
    entries: Vec<OutboundEntry>,
    free: Vec<usize>,
    outbox: VecDeque<(Box<dyn Signal>, SendOptions)>,
    sending: VecDeque<usize>,
    credit: usize,
    waiting_response: usize,
    next_sequence: u32,
}

impl Multiplexer {
    pub fn new() -> Self {
        Multiplexer {
            entries: Vec::new(),
            free: Vec::new(),
            outbox: VecDeque::new(),
            sending: VecDeque::new(),
            credit: MAX_SIGNAL_BUFFER_COUNT,
            waiting_response: 0,
            next_sequence: 0,
        }
    }

    /// Queue a signal behind the ones already waiting
    pub fn push(&mut self, signal: Box<dyn Signal>, options: SendOptions) {
        self.outbox.push_back((signal, options));
    }

    /// True when there is something to put into a data buffer
    pub fn has_work(&self) -> bool {
        !self.outbox.is_empty() || !self.sending.is_empty()
    }

    #[cfg(test)]
    fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    #[cfg(test)]
    fn sending_len(&self) -> usize {
        self.sending.len()
    }

    /// Signals fully sent and still waiting for a response
    pub fn waiting_response(&self) -> usize {
        self.waiting_response
    }

    /// Move signals from the outbox into the sending queue
    pub fn admit(&mut self) {
        while self.sending.len() < MAX_SENDING_SIGNALS {
            let Some((mut signal, options)) = self.outbox.pop_front() else {
                break;
            };
            let index = self.allocate();
            let entry = &mut self.entries[index];
            let uid = SignalUid::new(index as u32, entry.generation);

            entry.waits_response =
                signal.prepare_for_send(uid) == SendDisposition::WaitsForResponse;
            entry.same_connector = options.same_connector;
            entry.sent_once = false;
            entry.sequence = self.next_sequence;
            entry.signal = Some(signal);
            self.next_sequence = self.next_sequence.wrapping_add(1);

            trace!(%uid, "signal admitted");
            self.sending.push_back(index);
        }
    }

    fn allocate(&mut self) -> usize {
        match self.free.pop() {
            Some(index) => index,
            None => {
                self.entries.push(OutboundEntry::vacant());
                self.entries.len() - 1
            }
        }
    }

    fn release(&mut self, index: usize, pool: &mut CodecPool) -> Option<Box<dyn Signal>> {
        let entry = &mut self.entries[index];
        let signal = entry.signal.take();
        if let Some(encoder) = entry.encoder.take() {
            pool.return_encoder(encoder);
        }
        entry.generation = entry.generation.wrapping_add(1);
        entry.waits_response = false;
        entry.sent_once = false;
        entry.same_connector = false;
        self.free.push(index);
        signal
    }

    fn lookup(&self, uid: SignalUid) -> Option<usize> {
        let index = uid.index as usize;
        let entry = self.entries.get(index)?;
        (entry.generation == uid.generation && entry.signal.is_some()).then_some(index)
    }

    /// Fill `buffer` with chunks of the sending signals.
    ///
    /// Returns the uids of the signals whose last chunk went into this buffer.
    pub fn fill(&mut self, buffer: &mut Buffer, pool: &mut CodecPool) -> Vec<SignalUid> {
        let mut completed = Vec::new();

        while let Some(&index) = self.sending.front() {
            if self.credit == 0 {
                if self.sending.len() == 1 {
                    self.credit = MAX_SIGNAL_BUFFER_COUNT - 1;
                } else {
                    self.sending.rotate_left(1);
                    self.credit = MAX_SIGNAL_BUFFER_COUNT;
                }
                continue;
            }

            if buffer.data_free_size() < 2 {
                break;
            }

            let tag = match self.entries[index].encoder {
                Some(_) if self.credit == MAX_SIGNAL_BUFFER_COUNT => DataTag::OldSignal,
                Some(_) => DataTag::ContinuedSignal,
                None => {
                    if !self.start_encoder(index, pool) {
                        continue;
                    }
                    DataTag::NewSignal
                }
            };
            self.credit -= 1;

            let entry = &mut self.entries[index];
            let Some(encoder) = entry.encoder.as_mut() else {
                break;
            };
            let written = buffer.push_chunk(tag, |out| encoder.fill(out));
            trace!(?tag, written, index, "chunk packed");

            if !encoder.is_complete() {
                break;
            }

            if let Some(encoder) = entry.encoder.take() {
                pool.return_encoder(encoder);
            }
            entry.sent_once = true;
            if entry.waits_response {
                self.waiting_response += 1;
            }
            completed.push(SignalUid::new(index as u32, entry.generation));
            self.sending.pop_front();
            self.credit = MAX_SIGNAL_BUFFER_COUNT - 1;

            if buffer.data_free_size() < MIN_SHARED_SPACE {
                break;
            }
        }

        completed
    }

    /// Attach a fresh encoder to the entry; a signal that cannot be encoded is
    /// failed and removed from the sending queue
    fn start_encoder(&mut self, index: usize, pool: &mut CodecPool) -> bool {
        let mut encoder = pool.get_encoder();
        let result = match self.entries[index].signal.as_deref() {
            Some(signal) => encoder.start(signal),
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                self.entries[index].encoder = Some(encoder);
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to encode signal");
                pool.return_encoder(encoder);
                self.sending.pop_front();
                if let Some(mut signal) = self.release(index, pool) {
                    signal.on_send_failed(false);
                }
                false
            }
        }
    }

    /// A buffer carrying the last chunk of these signals was acknowledged
    pub fn buffer_acked(&mut self, uids: &[SignalUid], pool: &mut CodecPool) {
        for &uid in uids {
            let Some(index) = self.lookup(uid) else {
                trace!(%uid, "stale acknowledgment");
                continue;
            };
            if self.entries[index].waits_response {
                continue;
            }
            if let Some(mut signal) = self.release(index, pool) {
                signal.on_send_succeeded();
            }
        }
    }

    /// A received signal answered `uid`. Returns false when the uid is stale or
    /// does not wait for a response.
    pub fn resolve_response(&mut self, uid: SignalUid, pool: &mut CodecPool) -> bool {
        let Some(index) = self.lookup(uid) else {
            debug!(%uid, "response for unknown signal");
            return false;
        };
        let entry = &self.entries[index];
        if !entry.waits_response || !entry.sent_once {
            debug!(%uid, "response for signal that is not waiting");
            return false;
        }
        self.waiting_response -= 1;
        if let Some(mut signal) = self.release(index, pool) {
            signal.on_send_succeeded();
        }
        true
    }

    /// Prepare the signal queues for a new connection.
    ///
    /// Same-connector signals are failed. Signals answered-to-be are failed
    /// when they already went out, and everything else is queued again ahead
    /// of the waiting outbox in admission order.
    pub fn reset_for_reconnect(&mut self, pool: &mut CodecPool) {
        let mut kept = VecDeque::with_capacity(self.outbox.len());
        for (mut signal, options) in self.outbox.drain(..) {
            if options.same_connector {
                signal.on_send_failed(false);
            } else {
                kept.push_back((signal, options));
            }
        }

        let mut requeue = Vec::new();
        for index in 0..self.entries.len() {
            if self.entries[index].signal.is_none() {
                continue;
            }
            let entry = &self.entries[index];
            let (sent_once, waits, same_connector, sequence) = (
                entry.sent_once,
                entry.waits_response,
                entry.same_connector,
                entry.sequence,
            );
            let Some(mut signal) = self.release(index, pool) else {
                continue;
            };
            if sent_once && waits {
                signal.on_send_failed(true);
            } else if same_connector {
                signal.on_send_failed(sent_once);
            } else {
                requeue.push((sequence, signal));
            }
        }

        requeue.sort_by(|a, b| wrapping_order(a.0, b.0));
        debug!(
            requeued = requeue.len(),
            kept = kept.len(),
            "signal queues reset for reconnect"
        );

        for (_, signal) in requeue.into_iter().rev() {
            kept.push_front((signal, SendOptions::default()));
        }
        self.outbox = kept;
        self.sending.clear();
        self.credit = MAX_SIGNAL_BUFFER_COUNT;
        self.waiting_response = 0;
    }

    /// Fail every signal, queued or in flight
    pub fn fail_all(&mut self, pool: &mut CodecPool) {
        for index in 0..self.entries.len() {
            let sent_once = self.entries[index].sent_once;
            if let Some(mut signal) = self.release(index, pool) {
                signal.on_send_failed(sent_once);
            }
        }
        for (mut signal, _) in self.outbox.drain(..) {
            signal.on_send_failed(false);
        }
        self.sending.clear();
        self.credit = MAX_SIGNAL_BUFFER_COUNT;
        self.waiting_response = 0;
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

fn wrapping_order(a: u32, b: u32) -> Ordering {
    if less(a, b) {
        Ordering::Less
    } else if less(b, a) {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferType, ChunkReader, DEFAULT_CAPACITY, MIN_CAPACITY};
    use crate::signal::PeerInfo;
    use bytes::{BufMut, BytesMut};
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Probe {
        name: String,
        size: usize,
        waits: bool,
        log: Log,
    }

    impl Probe {
        fn boxed(name: &str, size: usize, waits: bool, log: &Log) -> Box<dyn Signal> {
            Box::new(Probe {
                name: name.into(),
                size,
                waits,
                log: log.clone(),
            })
        }

        fn record(&self, event: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, event));
        }
    }

    impl Signal for Probe {
        fn signal_type(&self) -> u16 {
            1
        }

        fn encode(&self, out: &mut BytesMut) {
            out.put_bytes(0x5A, self.size);
        }

        fn prepare_for_send(&mut self, _uid: SignalUid) -> SendDisposition {
            if self.waits {
                SendDisposition::WaitsForResponse
            } else {
                SendDisposition::NoResponseExpected
            }
        }

        fn on_fully_received(self: Box<Self>, _peer: &PeerInfo) -> Option<SignalUid> {
            None
        }

        fn on_send_failed(&mut self, sent_once: bool) {
            self.record(if sent_once { "failed-sent" } else { "failed" });
        }

        fn on_send_succeeded(&mut self) {
            self.record("ok");
        }
    }

    fn tags(buffer: &Buffer) -> Vec<DataTag> {
        let mut reader = ChunkReader::new(buffer.payload());
        let mut tags = Vec::new();
        if let Some(Ok((tag, _))) = reader.next_tag() {
            tags.push(tag);
        }
        tags
    }

    fn data_buffer(capacity: usize) -> Buffer {
        Buffer::new(BufferType::Data, capacity)
    }

    #[test]
    fn test_small_signals_share_buffer() {
        let log = Log::default();
        let mut pool = CodecPool::new();
        let mut mux = Multiplexer::new();
        mux.push(Probe::boxed("a", 10, false, &log), SendOptions::default());
        mux.push(Probe::boxed("b", 10, false, &log), SendOptions::default());
        mux.admit();

        let mut buffer = data_buffer(DEFAULT_CAPACITY);
        let done = mux.fill(&mut buffer, &mut pool);
        assert_eq!(done.len(), 2);
        assert_eq!(buffer.data_size(), 2 * (1 + 6 + 10));
        assert!(!mux.has_work());

        mux.buffer_acked(&done, &mut pool);
        assert_eq!(*log.lock().unwrap(), vec!["a:ok", "b:ok"]);
    }

    #[test]
    fn test_large_signal_continues() {
        let log = Log::default();
        let mut pool = CodecPool::new();
        let mut mux = Multiplexer::new();
        mux.push(Probe::boxed("a", 300, false, &log), SendOptions::default());
        mux.admit();

        let mut first = data_buffer(MIN_CAPACITY);
        assert!(mux.fill(&mut first, &mut pool).is_empty());
        assert_eq!(tags(&first), vec![DataTag::NewSignal]);

        let mut second = data_buffer(MIN_CAPACITY);
        mux.fill(&mut second, &mut pool);
        assert_eq!(tags(&second), vec![DataTag::ContinuedSignal]);
    }

    #[test]
    fn test_rotation_after_credit() {
        let log = Log::default();
        let mut pool = CodecPool::new();
        let mut mux = Multiplexer::new();
        mux.push(Probe::boxed("a", 4000, false, &log), SendOptions::default());
        mux.push(Probe::boxed("b", 4000, false, &log), SendOptions::default());
        mux.admit();
        assert_eq!(mux.sending_len(), 2);
        assert_eq!(mux.outbox_len(), 0);

        let mut seen = Vec::new();
        for _ in 0..MAX_SIGNAL_BUFFER_COUNT + 2 {
            let mut buffer = data_buffer(MIN_CAPACITY);
            mux.fill(&mut buffer, &mut pool);
            seen.extend(tags(&buffer));
        }

        assert_eq!(seen[0], DataTag::NewSignal);
        assert!(seen[1..MAX_SIGNAL_BUFFER_COUNT]
            .iter()
            .all(|tag| *tag == DataTag::ContinuedSignal));
        assert_eq!(seen[MAX_SIGNAL_BUFFER_COUNT], DataTag::NewSignal);
        assert_eq!(seen[MAX_SIGNAL_BUFFER_COUNT + 1], DataTag::ContinuedSignal);

        // b now runs out of credit and a is resumed
        for _ in 0..MAX_SIGNAL_BUFFER_COUNT - 2 {
            let mut buffer = data_buffer(MIN_CAPACITY);
            mux.fill(&mut buffer, &mut pool);
        }
        let mut buffer = data_buffer(MIN_CAPACITY);
        mux.fill(&mut buffer, &mut pool);
        assert_eq!(tags(&buffer), vec![DataTag::OldSignal]);
    }

    #[test]
    fn test_waiting_signal_resolved_once() {
        let log = Log::default();
        let mut pool = CodecPool::new();
        let mut mux = Multiplexer::new();
        mux.push(Probe::boxed("req", 8, true, &log), SendOptions::default());
        mux.admit();

        let mut buffer = data_buffer(DEFAULT_CAPACITY);
        let done = mux.fill(&mut buffer, &mut pool);
        assert_eq!(mux.waiting_response(), 1);

        mux.buffer_acked(&done, &mut pool);
        assert!(log.lock().unwrap().is_empty());

        assert!(mux.resolve_response(done[0], &mut pool));
        assert!(!mux.resolve_response(done[0], &mut pool));
        mux.buffer_acked(&done, &mut pool);

        assert_eq!(*log.lock().unwrap(), vec!["req:ok"]);
        assert_eq!(mux.waiting_response(), 0);
    }

    #[test]
    fn test_reconnect_dispositions() {
        let log = Log::default();
        let mut pool = CodecPool::new();
        let mut mux = Multiplexer::new();
        mux.push(Probe::boxed("waiting", 8, true, &log), SendOptions::default());
        mux.push(Probe::boxed("pinned", 8, false, &log), SendOptions::same_connector());
        mux.push(Probe::boxed("plain", 8, false, &log), SendOptions::default());
        mux.admit();
        let mut buffer = data_buffer(DEFAULT_CAPACITY);
        mux.fill(&mut buffer, &mut pool);

        mux.push(Probe::boxed("queued-pinned", 8, false, &log), SendOptions::same_connector());
        mux.push(Probe::boxed("queued", 8, false, &log), SendOptions::default());

        mux.reset_for_reconnect(&mut pool);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["queued-pinned:failed", "waiting:failed-sent", "pinned:failed-sent"]
        );
        assert_eq!(mux.outbox_len(), 2);
        assert_eq!(mux.waiting_response(), 0);

        // plain is resent before queued
        mux.admit();
        let mut buffer = data_buffer(DEFAULT_CAPACITY);
        let done = mux.fill(&mut buffer, &mut pool);
        mux.buffer_acked(&done, &mut pool);
        assert_eq!(
            log.lock().unwrap()[3..].to_vec(),
            vec!["plain:ok", "queued:ok"]
        );
    }

    #[test]
    fn test_fail_all() {
        let log = Log::default();
        let mut pool = CodecPool::new();
        let mut mux = Multiplexer::new();
        mux.push(Probe::boxed("a", 8, false, &log), SendOptions::default());
        mux.admit();
        mux.push(Probe::boxed("b", 8, false, &log), SendOptions::default());

        mux.fail_all(&mut pool);
        assert_eq!(*log.lock().unwrap(), vec!["a:failed", "b:failed"]);
        assert!(!mux.has_work());
    }

    #[test]
    fn test_wrapping_order() {
        assert_eq!(wrapping_order(u32::MAX, 0), Ordering::Less);
        assert_eq!(wrapping_order(3, 3), Ordering::Equal);
        assert_eq!(wrapping_order(5, 2), Ordering::Greater);
    }
}
