//! Inbound Chunk Dispatch
//!
//! Routes the chunks of in-order data buffers to decode contexts. The front of
//! the queue is the signal currently being continued; a `None` front marks a
//! signal that has just been completed. Rotated-away signals wait behind it
//! in the order the sender will resume them.

use crate::buffer::{ChunkReader, DataTag};
use crate::codec::{CodecPool, FrameDecoder, SignalRegistry};
use crate::signal::{PeerInfo, SignalUid};
use std::collections::VecDeque;
use tracing::{trace, warn};

/// Decode contexts of partially received signals
#[derive(Debug, Default)]
pub struct InboundQueue {
    contexts: VecDeque<Option<FrameDecoder>>,
    delivered: u64,
    failed: u64,
}

impl InboundQueue {
    pub fn new() -> Self {
        InboundQueue::default()
    }

    /// Decode the chunks of one data payload.
    ///
    /// Completed signals are handed to their receive hook; the returned uids
    /// are the outbound signals those hooks answered.
    pub fn parse(
        &mut self,
        payload: &[u8],
        pool: &mut CodecPool,
        registry: &SignalRegistry,
        peer: &PeerInfo,
    ) -> Vec<SignalUid> {
        let mut responses = Vec::new();
        let mut reader = ChunkReader::new(payload);

        while let Some(next) = reader.next_tag() {
            let (tag, data) = match next {
                Ok(chunk) => chunk,
                Err(tag) => {
                    warn!(tag, "unknown chunk tag, dropping rest of buffer");
                    return responses;
                }
            };

            if !self.select(tag, pool) {
                warn!(?tag, "chunk does not match any signal in progress, dropping rest of buffer");
                return responses;
            }

            let Some(decoder) = self.contexts.front_mut().and_then(Option::as_mut) else {
                return responses;
            };
            let consumed = match decoder.feed(data) {
                Ok(consumed) => consumed,
                Err(e) => {
                    warn!(error = %e, "signal frame rejected, dropping rest of buffer");
                    self.abandon_front(pool);
                    return responses;
                }
            };
            reader.consume(consumed);
            trace!(?tag, consumed, "chunk");

            if decoder.is_complete() {
                if let Some(uid) = self.complete_front(pool, registry, peer) {
                    responses.push(uid);
                }
            }
        }

        responses
    }

    /// Make the context a chunk with `tag` belongs to the front of the queue
    fn select(&mut self, tag: DataTag, pool: &mut CodecPool) -> bool {
        match tag {
            DataTag::NewSignal => {
                let decoder = pool.get_decoder();
                match self.contexts.front() {
                    None => self.contexts.push_back(Some(decoder)),
                    Some(Some(_)) => {
                        self.rotate_front();
                        self.contexts.push_front(Some(decoder));
                    }
                    Some(None) => self.contexts[0] = Some(decoder),
                }
                true
            }
            DataTag::ContinuedSignal => {
                if matches!(self.contexts.front(), Some(None)) {
                    self.contexts.pop_front();
                }
                matches!(self.contexts.front(), Some(Some(_)))
            }
            DataTag::OldSignal => {
                match self.contexts.front() {
                    Some(Some(_)) => self.rotate_front(),
                    Some(None) => {
                        self.contexts.pop_front();
                    }
                    None => return false,
                }
                matches!(self.contexts.front(), Some(Some(_)))
            }
        }
    }

    fn rotate_front(&mut self) {
        if let Some(front) = self.contexts.pop_front() {
            self.contexts.push_back(front);
        }
    }

    fn complete_front(
        &mut self,
        pool: &mut CodecPool,
        registry: &SignalRegistry,
        peer: &PeerInfo,
    ) -> Option<SignalUid> {
        let mut decoder = self.contexts.front_mut()?.take()?;
        let result = decoder.finish(registry);
        pool.return_decoder(decoder);

        match result {
            Ok(signal) => {
                self.delivered += 1;
                signal.on_fully_received(peer)
            }
            Err(e) => {
                self.failed += 1;
                warn!(error = %e, peer = %peer.addr, "discarding undecodable signal");
                None
            }
        }
    }

    fn abandon_front(&mut self, pool: &mut CodecPool) {
        self.failed += 1;
        if let Some(Some(decoder)) = self.contexts.front_mut().map(Option::take) {
            pool.return_decoder(decoder);
        }
    }

    /// True while the peer is in the middle of sending us a signal
    pub fn expecting_immediate_data(&self) -> bool {
        match self.contexts.len() {
            0 => false,
            1 => self.contexts[0].is_some(),
            _ => true,
        }
    }

    /// Number of signals partially received
    #[cfg(test)]
    fn in_progress(&self) -> usize {
        self.contexts.iter().flatten().count()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Drop all partial signals, returning their decoders to the pool
    pub fn reset(&mut self, pool: &mut CodecPool) {
        for decoder in self.contexts.drain(..).flatten() {
            pool.return_decoder(decoder);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameEncoder;
    use crate::signal::{ConnectionUid, Signal};
    use bytes::{BufMut, BytesMut};
    use std::sync::{Arc, Mutex};

    struct Text(String, Arc<Mutex<Vec<String>>>);

    impl Signal for Text {
        fn signal_type(&self) -> u16 {
            1
        }

        fn encode(&self, out: &mut BytesMut) {
            out.put_slice(self.0.as_bytes());
        }

        fn on_fully_received(self: Box<Self>, _peer: &PeerInfo) -> Option<SignalUid> {
            self.1.lock().unwrap().push(self.0.clone());
            None
        }
    }

    fn setup() -> (SignalRegistry, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SignalRegistry::new();
        let sink = log.clone();
        registry.register(1, move |body| {
            Ok(Box::new(Text(String::from_utf8_lossy(&body).into_owned(), sink.clone()))
                as Box<dyn Signal>)
        });
        (registry, log)
    }

    fn peer() -> PeerInfo {
        PeerInfo {
            connection: ConnectionUid::default(),
            addr: "127.0.0.1:9000".parse().unwrap(),
        }
    }

    fn frame(text: &str) -> Vec<u8> {
        let mut encoder = FrameEncoder::new();
        encoder.start(&Text(text.into(), Arc::default())).unwrap();
        let mut out = vec![0u8; encoder.remaining()];
        encoder.fill(&mut out);
        out
    }

    fn chunk(tag: DataTag, bytes: &[u8]) -> Vec<u8> {
        let mut out = vec![tag.as_u8()];
        out.extend_from_slice(bytes);
        out
    }

    #[test]
    fn test_two_signals_in_one_payload() {
        let (registry, log) = setup();
        let mut pool = CodecPool::new();
        let mut queue = InboundQueue::new();

        let mut payload = chunk(DataTag::NewSignal, &frame("one"));
        payload.extend(chunk(DataTag::NewSignal, &frame("two")));
        queue.parse(&payload, &mut pool, &registry, &peer());

        assert_eq!(*log.lock().unwrap(), vec!["one", "two"]);
        assert!(!queue.expecting_immediate_data());
        assert_eq!(queue.delivered(), 2);
    }

    #[test]
    fn test_rotation_between_signals() {
        let (registry, log) = setup();
        let mut pool = CodecPool::new();
        let mut queue = InboundQueue::new();
        let a = frame("alpha");
        let b = frame("bravo");

        queue.parse(&chunk(DataTag::NewSignal, &a[..4]), &mut pool, &registry, &peer());
        queue.parse(&chunk(DataTag::NewSignal, &b[..4]), &mut pool, &registry, &peer());
        assert_eq!(queue.in_progress(), 2);
        assert!(queue.expecting_immediate_data());

        // Resume alpha, then bravo
        queue.parse(&chunk(DataTag::OldSignal, &a[4..]), &mut pool, &registry, &peer());
        queue.parse(&chunk(DataTag::ContinuedSignal, &b[4..]), &mut pool, &registry, &peer());

        assert_eq!(*log.lock().unwrap(), vec!["alpha", "bravo"]);
        assert_eq!(queue.in_progress(), 0);
        assert!(!queue.expecting_immediate_data());
    }

    #[test]
    fn test_continued_without_context_is_dropped() {
        let (registry, log) = setup();
        let mut pool = CodecPool::new();
        let mut queue = InboundQueue::new();

        queue.parse(&chunk(DataTag::ContinuedSignal, b"xx"), &mut pool, &registry, &peer());
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(queue.in_progress(), 0);
    }

    #[test]
    fn test_unknown_type_is_discarded() {
        let (registry, log) = setup();
        let mut pool = CodecPool::new();
        let mut queue = InboundQueue::new();

        let mut payload = chunk(DataTag::NewSignal, &[0, 42, 0, 0, 0, 1, 0]);
        payload.extend(chunk(DataTag::NewSignal, &frame("next")));
        queue.parse(&payload, &mut pool, &registry, &peer());

        assert_eq!(*log.lock().unwrap(), vec!["next"]);
        assert_eq!(queue.failed(), 1);
    }

    #[test]
    fn test_reset_returns_decoders() {
        let (registry, _log) = setup();
        let mut pool = CodecPool::new();
        let mut queue = InboundQueue::new();
        let a = frame("partial");

        queue.parse(&chunk(DataTag::NewSignal, &a[..3]), &mut pool, &registry, &peer());
        queue.reset(&mut pool);

        assert_eq!(queue.in_progress(), 0);
        assert_eq!(pool.pooled().1, 1);
    }
}
