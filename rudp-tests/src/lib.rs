//! Simulated network for session tests
//!
//! Two sessions are wired back to back through an in-memory link with a
//! virtual clock. Datagrams are delivered instantly and in order unless the
//! configured `Loss` drops them; when nothing is on the link the clock jumps to
//! the earliest armed timer. Runs are fully deterministic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rudp_io::TimerQueue;
use rudp_protocol::buffer::ChunkReader;
use rudp_protocol::{
    Buffer, BufferType, CodecError, DataTag, Execution, PeerInfo, SendDisposition, SendKey,
    SendOptions, SendStatus, Session, SessionConfig, SessionError, SessionState, Signal,
    SignalRegistry, SignalUid, TalkerStub, TimerKey,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Registry id of `TestSignal`
pub const TEST_SIGNAL: u16 = 42;

const FLAG_REQUEST: u8 = 0x01;
const FLAG_RESPONSE: u8 = 0x02;

/// Install a test subscriber once; `RUST_LOG` selects the level
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

/// Signal lifecycle events recorded by `TestSignal`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Received {
        side: Side,
        id: u32,
        body: Vec<u8>,
        request: Option<SignalUid>,
    },
    Succeeded {
        side: Side,
        id: u32,
    },
    Failed {
        side: Side,
        id: u32,
        sent_once: bool,
    },
}

/// Shared, append-only event record
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn push(&self, event: Event) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Ids received on `side`, in delivery order
    pub fn received(&self, side: Side) -> Vec<u32> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Received { side: s, id, .. } if *s == side => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Body of the first signal `id` received on `side`
    pub fn received_body(&self, side: Side, id: u32) -> Option<Vec<u8>> {
        self.events.lock().iter().find_map(|event| match event {
            Event::Received {
                side: s,
                id: i,
                body,
                ..
            } if *s == side && *i == id => Some(body.clone()),
            _ => None,
        })
    }

    /// Ids whose send completed on `side`
    pub fn succeeded(&self, side: Side) -> Vec<u32> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Succeeded { side: s, id } if *s == side => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// `(id, sent_once)` of every failed send on `side`
    pub fn failed(&self, side: Side) -> Vec<(u32, bool)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Failed {
                    side: s,
                    id,
                    sent_once,
                } if *s == side => Some((*id, *sent_once)),
                _ => None,
            })
            .collect()
    }
}

/// Application signal used by the tests.
///
/// Wire body: `id:u32, flags:u8, [uid index:u32, uid generation:u32], body`.
/// A request carries its own uid so the peer can answer it; a response
/// carries the uid it answers.
pub struct TestSignal {
    id: u32,
    body: Bytes,
    waits: bool,
    uid: Option<SignalUid>,
    responds_to: Option<SignalUid>,
    side: Side,
    log: Option<EventLog>,
}

impl TestSignal {
    pub fn new(id: u32, body: impl Into<Bytes>) -> Self {
        TestSignal {
            id,
            body: body.into(),
            waits: false,
            uid: None,
            responds_to: None,
            side: Side::A,
            log: None,
        }
    }

    /// Body of `len` bytes following a fixed pattern seeded by `id`
    pub fn patterned(id: u32, len: usize) -> Self {
        Self::new(id, pattern(id, len))
    }

    /// Stay in flight until the peer answers
    pub fn request(mut self) -> Self {
        self.waits = true;
        self
    }

    /// Answer the request `uid`
    pub fn response_to(mut self, uid: SignalUid) -> Self {
        self.responds_to = Some(uid);
        self
    }

    /// Record the lifecycle of this signal as sent from `side`
    pub fn recorded_by(mut self, side: Side, log: &EventLog) -> Self {
        self.side = side;
        self.log = Some(log.clone());
        self
    }

    fn record(&self, event: Event) {
        if let Some(log) = &self.log {
            log.push(event);
        }
    }

    fn decode(mut body: Bytes, side: Side, log: &EventLog) -> Result<Self, CodecError> {
        if body.remaining() < 5 {
            return Err(CodecError::Malformed("short test signal".into()));
        }
        let id = body.get_u32();
        let flags = body.get_u8();
        let uid = if flags & (FLAG_REQUEST | FLAG_RESPONSE) != 0 {
            if body.remaining() < 8 {
                return Err(CodecError::Malformed("missing uid".into()));
            }
            Some(SignalUid::new(body.get_u32(), body.get_u32()))
        } else {
            None
        };
        Ok(TestSignal {
            id,
            body,
            waits: false,
            uid: if flags & FLAG_REQUEST != 0 { uid } else { None },
            responds_to: if flags & FLAG_RESPONSE != 0 { uid } else { None },
            side,
            log: Some(log.clone()),
        })
    }
}

/// Deterministic test payload
pub fn pattern(seed: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed.wrapping_mul(7)) as u8)
        .collect()
}

impl Signal for TestSignal {
    fn signal_type(&self) -> u16 {
        TEST_SIGNAL
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.id);
        match (self.waits, self.uid, self.responds_to) {
            (true, Some(uid), _) => {
                out.put_u8(FLAG_REQUEST);
                out.put_u32(uid.index);
                out.put_u32(uid.generation);
            }
            (_, _, Some(uid)) => {
                out.put_u8(FLAG_RESPONSE);
                out.put_u32(uid.index);
                out.put_u32(uid.generation);
            }
            _ => out.put_u8(0),
        }
        out.put_slice(&self.body);
    }

    fn prepare_for_send(&mut self, uid: SignalUid) -> SendDisposition {
        self.uid = Some(uid);
        if self.waits {
            SendDisposition::WaitsForResponse
        } else {
            SendDisposition::NoResponseExpected
        }
    }

    fn on_fully_received(self: Box<Self>, _peer: &PeerInfo) -> Option<SignalUid> {
        self.record(Event::Received {
            side: self.side,
            id: self.id,
            body: self.body.to_vec(),
            request: self.uid,
        });
        self.responds_to
    }

    fn on_send_failed(&mut self, sent_once: bool) {
        self.record(Event::Failed {
            side: self.side,
            id: self.id,
            sent_once,
        });
    }

    fn on_send_succeeded(&mut self) {
        self.record(Event::Succeeded {
            side: self.side,
            id: self.id,
        });
    }
}

/// Registry of the receiving `side`
pub fn signal_registry(side: Side, log: &EventLog) -> SignalRegistry {
    let mut registry = SignalRegistry::new();
    let log = log.clone();
    registry.register(TEST_SIGNAL, move |body: Bytes| {
        Ok(Box::new(TestSignal::decode(body, side, &log)?) as Box<dyn Signal>)
    });
    registry
}

pub fn registry(side: Side, log: &EventLog) -> Arc<SignalRegistry> {
    Arc::new(signal_registry(side, log))
}

/// Talker double with a virtual clock
pub struct SimStub {
    pub now: Instant,
    pub base_port: u16,
    pub outgoing: Vec<Bytes>,
    /// Report sends as queued; they complete on the next network step
    pub queue_sends: bool,
    pub queued: Vec<(SendKey, Bytes)>,
    pub timers: TimerQueue<TimerKey>,
}

impl SimStub {
    pub fn new(now: Instant, base_port: u16) -> Self {
        SimStub {
            now,
            base_port,
            outgoing: Vec::new(),
            queue_sends: false,
            queued: Vec::new(),
            timers: TimerQueue::new(),
        }
    }
}

impl TalkerStub for SimStub {
    fn push_send_buffer(&mut self, key: SendKey, data: Bytes) -> SendStatus {
        if self.queue_sends {
            self.queued.push((key, data));
            SendStatus::Queued
        } else {
            self.outgoing.push(data);
            SendStatus::Sent
        }
    }

    fn push_timer(&mut self, key: TimerKey, deadline: Instant) {
        self.timers.push(deadline, key);
    }

    fn current_time(&self) -> Instant {
        self.now
    }

    fn base_port(&self) -> u16 {
        self.base_port
    }
}

/// One end of the link
pub struct Node {
    pub session: Session,
    pub stub: SimStub,
    pub addr: SocketAddr,
    /// Every distinct state the session went through, in order
    pub states: Vec<SessionState>,
}

impl Node {
    fn observe(&mut self) {
        let state = self.session.state();
        if self.states.last() != Some(&state) {
            self.states.push(state);
        }
    }

    /// Execute until the session stops asking for it
    pub fn run(&mut self) {
        loop {
            self.observe();
            let execution = self.session.execute(&mut self.stub);
            self.observe();
            if execution != Execution::Reschedule {
                break;
            }
        }
    }

    pub fn saw_state(&self, state: SessionState) -> bool {
        self.states.contains(&state)
    }
}

/// Which datagrams the link drops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loss {
    None,
    /// Drop every n-th datagram, counted over both directions
    EveryNth(u64),
    /// Drop everything
    Partition,
}

/// First chunk tag of a data buffer as it first went on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireChunk {
    pub from: Side,
    pub id: u32,
    pub tag: DataTag,
}

/// Two sessions and the link between them
pub struct Network {
    pub a: Node,
    pub b: Node,
    pub log: EventLog,
    pub wire: Vec<WireChunk>,
    pub datagrams: u64,
    pub dropped: u64,
    loss: Loss,
    start: Instant,
    now: Instant,
    capacity: usize,
    auto_reply: bool,
    reply_cursor: usize,
    next_reply_id: u32,
}

impl Network {
    /// `A` connects to `B`; nothing has been exchanged yet
    pub fn new(config: SessionConfig) -> Self {
        let log = EventLog::default();
        let start = Instant::now();
        let a_addr = SocketAddr::from(([10, 0, 0, 1], 4000));
        let b_addr = SocketAddr::from(([10, 0, 0, 2], 5000));
        let capacity = config.buffer_capacity;

        let a = Session::connector(b_addr, config.clone(), registry(Side::A, &log))
            .expect("valid session config");
        let b = Session::acceptor(a_addr, config, registry(Side::B, &log))
            .expect("valid session config");

        let mut network = Network {
            a: Node {
                session: a,
                stub: SimStub::new(start, a_addr.port()),
                addr: a_addr,
                states: Vec::new(),
            },
            b: Node {
                session: b,
                stub: SimStub::new(start, b_addr.port()),
                addr: b_addr,
                states: Vec::new(),
            },
            log,
            wire: Vec::new(),
            datagrams: 0,
            dropped: 0,
            loss: Loss::None,
            start,
            now: start,
            capacity,
            auto_reply: false,
            reply_cursor: 0,
            next_reply_id: 1_000_000,
        };
        network.a.run();
        network.b.observe();
        network
    }

    /// Like `new`, but runs the handshake to completion over a clean link
    pub fn connected(config: SessionConfig) -> Self {
        let mut network = Self::new(config);
        let done = network.run_until(Duration::from_secs(5), |net| {
            net.a.session.is_connected() && net.b.session.is_connected()
        });
        assert!(done, "handshake did not complete");
        network
    }

    pub fn node(&self, side: Side) -> &Node {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }

    pub fn node_mut(&mut self, side: Side) -> &mut Node {
        match side {
            Side::A => &mut self.a,
            Side::B => &mut self.b,
        }
    }

    pub fn set_loss(&mut self, loss: Loss) {
        self.loss = loss;
    }

    /// Make both talkers report every send as queued
    pub fn set_queued_sends(&mut self, enabled: bool) {
        self.a.stub.queue_sends = enabled;
        self.b.stub.queue_sends = enabled;
    }

    /// Answer every received request with a response signal
    pub fn set_auto_reply(&mut self, enabled: bool) {
        self.auto_reply = enabled;
    }

    /// Virtual time since the network was created
    pub fn elapsed(&self) -> Duration {
        self.now - self.start
    }

    /// Queue `signal` on `side` and execute the session if it was idle
    pub fn send(
        &mut self,
        side: Side,
        signal: TestSignal,
        options: SendOptions,
    ) -> Result<(), SessionError> {
        let signal = signal.recorded_by(side, &self.log);
        let node = self.node_mut(side);
        if node.session.push_signal(Box::new(signal), options)? {
            node.run();
        }
        Ok(())
    }

    /// Deliver pending datagrams, or advance the clock to the next timer.
    ///
    /// Returns false when there is nothing left to do.
    pub fn step(&mut self) -> bool {
        let mut moved = false;
        for side in [Side::A, Side::B] {
            let outgoing = std::mem::take(&mut self.node_mut(side).stub.outgoing);
            for data in outgoing {
                moved = true;
                self.transmit(side, data);
            }

            let queued = std::mem::take(&mut self.node_mut(side).stub.queued);
            for (key, data) in queued {
                moved = true;
                self.transmit(side, data);
                let node = self.node_mut(side);
                let run = node.session.on_buffer_sent(&mut node.stub, key);
                node.observe();
                if run {
                    node.run();
                }
            }
        }
        if moved {
            self.answer_requests();
            return true;
        }

        let deadline = match (
            self.a.stub.timers.next_deadline(),
            self.b.stub.timers.next_deadline(),
        ) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => return false,
        };
        self.now = self.now.max(deadline);
        for side in [Side::A, Side::B] {
            let now = self.now;
            let node = self.node_mut(side);
            node.stub.now = now;
            while let Some((_, key)) = node.stub.timers.pop_due(now) {
                let run = node.session.on_timer(&mut node.stub, key);
                node.observe();
                if run {
                    node.run();
                }
            }
        }
        true
    }

    /// Step until `done` holds or `limit` of virtual time has passed
    pub fn run_until<F>(&mut self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&Network) -> bool,
    {
        while !done(self) {
            if self.elapsed() > limit || !self.step() {
                return done(self);
            }
        }
        true
    }

    /// Step until the link is quiet and no timer is armed, bounded by `limit`
    pub fn run_idle(&mut self, limit: Duration) {
        while self.elapsed() <= limit && self.step() {}
    }

    fn transmit(&mut self, from: Side, data: Bytes) {
        self.datagrams += 1;
        let buffer =
            Buffer::from_bytes(&data, self.capacity).expect("session sent a malformed buffer");

        if buffer.buffer_type() == BufferType::Data && buffer.retransmit_count() == 0 {
            if let Some(Ok((tag, _))) = ChunkReader::new(buffer.payload()).next_tag() {
                self.wire.push(WireChunk {
                    from,
                    id: buffer.raw_id(),
                    tag,
                });
            }
        }

        let lost = match self.loss {
            Loss::None => false,
            Loss::EveryNth(n) => n > 0 && self.datagrams % n == 0,
            Loss::Partition => true,
        };
        if lost {
            self.dropped += 1;
            return;
        }

        let source = self.node(from).addr;
        let now = self.now;
        let node = self.node_mut(from.other());
        node.stub.now = now;
        let run = node.session.on_buffer_received(&mut node.stub, buffer, source);
        node.observe();
        if run {
            node.run();
        }
    }

    fn answer_requests(&mut self) {
        if !self.auto_reply {
            return;
        }
        let events = self.log.events();
        let pending: Vec<(Side, SignalUid)> = events[self.reply_cursor..]
            .iter()
            .filter_map(|event| match event {
                Event::Received {
                    side,
                    request: Some(uid),
                    ..
                } => Some((*side, *uid)),
                _ => None,
            })
            .collect();
        self.reply_cursor = events.len();

        for (side, uid) in pending {
            let id = self.next_reply_id;
            self.next_reply_id += 1;
            let reply = TestSignal::new(id, Bytes::new()).response_to(uid);
            // A closed session simply drops the reply
            let _ = self.send(side, reply, SendOptions::default());
        }
    }
}
