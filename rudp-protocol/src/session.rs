//! Session State Machine
//!
//! One session per peer. The owning talker feeds it received buffers, timer
//! expirations and send completions, and calls `execute` whenever one of those
//! reports that there is work to do. Nothing here blocks or performs I/O; all
//! output goes through the `TalkerStub`.

use crate::buffer::{Buffer, BufferType, Handshake, MAX_DATA_UPDATES, MAX_UPDATES};
use crate::codec::{CodecPool, SignalRegistry};
use crate::config::{SessionConfig, SessionError};
use crate::inbound::InboundQueue;
use crate::multiplexer::Multiplexer;
use crate::reassembly::{Arrival, ReceiveWindow};
use crate::retransmit::{Backoff, RetransmitTimeoutTable};
use crate::sequence::{BufferId, KEEPALIVE_BUFFER_ID, UPDATE_BUFFER_ID};
use crate::signal::{ConnectionUid, PeerInfo, SendOptions, Signal};
use crate::stub::{SendStatus, TalkerStub};
use crate::window::{SendKey, SendWindow, TimerKey, KEEPALIVE_SLOT};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Pending acknowledgments tolerated while the peer is mid-signal
pub const MAX_RECV_NO_UPDATE_COUNT: usize = 4;

const MAX_POOLED_PAYLOADS: usize = 16;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// About to send a connect handshake
    Connecting,
    /// About to answer a connect handshake
    Accepting,
    /// Connect sent, waiting for the peer
    WaitAccept,
    /// Handshake complete
    Connected,
    /// Giving up on the peer
    Disconnecting,
    /// Connection lost, about to restart the handshake
    Reconnecting,
    /// Terminal
    Disconnected,
}

/// What the talker should do after `execute`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// Call `execute` again
    Reschedule,
    /// Nothing to do until the next event
    Wait,
    /// The session can be destroyed
    Dead,
}

/// Session statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Buffers put on the wire (window buffers and keepalives)
    pub buffers_sent: u64,
    /// Buffers received from the peer
    pub buffers_received: u64,
    /// Retransmissions
    pub buffers_retransmitted: u64,
    /// Received buffers that were already seen
    pub duplicates: u64,
    /// Buffers dropped because the out-of-order store was full
    pub out_of_order_dropped: u64,
    /// Update-only buffers sent
    pub update_buffers_sent: u64,
    /// Keepalive transmissions
    pub keepalives_sent: u64,
    /// Times the window state was rebuilt
    pub reconnects: u64,
}

/// Per-peer protocol state
pub struct Session {
    state: SessionState,
    config: SessionConfig,
    registry: Arc<SignalRegistry>,
    table: &'static RetransmitTimeoutTable,
    backoff: Backoff,
    peer_addr: SocketAddr,
    connection: ConnectionUid,
    local_epoch: u32,
    peer_epoch: Option<u32>,
    next_send_id: BufferId,
    send_window: SendWindow,
    receive: ReceiveWindow,
    inbound: InboundQueue,
    mux: Multiplexer,
    codecs: CodecPool,
    payloads: Vec<BytesMut>,
    updates_queued: bool,
    keepalive_sent: bool,
    last_receive: Option<Instant>,
    stats: SessionStats,
}

impl Session {
    /// Session that opens the connection to `peer_addr`
    pub fn connector(
        peer_addr: SocketAddr,
        config: SessionConfig,
        registry: Arc<SignalRegistry>,
    ) -> Result<Self, SessionError> {
        Self::new(peer_addr, config, registry, SessionState::Connecting)
    }

    /// Session answering a connect buffer received from `peer_addr`
    pub fn acceptor(
        peer_addr: SocketAddr,
        config: SessionConfig,
        registry: Arc<SignalRegistry>,
    ) -> Result<Self, SessionError> {
        Self::new(peer_addr, config, registry, SessionState::Accepting)
    }

    fn new(
        peer_addr: SocketAddr,
        config: SessionConfig,
        registry: Arc<SignalRegistry>,
        state: SessionState,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Session {
            state,
            send_window: SendWindow::new(config.max_send_buffers),
            config,
            registry,
            table: RetransmitTimeoutTable::standard(),
            backoff: Backoff::new(),
            peer_addr,
            connection: ConnectionUid::default(),
            local_epoch: rand::random(),
            peer_epoch: None,
            next_send_id: BufferId::ZERO,
            receive: ReceiveWindow::new(),
            inbound: InboundQueue::new(),
            mux: Multiplexer::new(),
            codecs: CodecPool::new(),
            payloads: Vec::new(),
            updates_queued: false,
            keepalive_sent: false,
            last_receive: None,
            stats: SessionStats::default(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Current destination of outgoing buffers
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connection_uid(&self) -> ConnectionUid {
        self.connection
    }

    pub fn set_connection_uid(&mut self, uid: ConnectionUid) {
        self.connection = uid;
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Epoch of the current connect attempt
    pub fn local_epoch(&self) -> u32 {
        self.local_epoch
    }

    /// Signals received and handed to the application
    #[cfg(test)]
    fn signals_delivered(&self) -> u64 {
        self.inbound.delivered()
    }

    /// Queue a signal for sending.
    ///
    /// Returns true when the session was idle and should now be executed.
    pub fn push_signal(
        &mut self,
        mut signal: Box<dyn Signal>,
        options: SendOptions,
    ) -> Result<bool, SessionError> {
        if matches!(
            self.state,
            SessionState::Disconnecting | SessionState::Disconnected
        ) {
            signal.on_send_failed(false);
            return Err(SessionError::Closed);
        }
        let was_idle = !self.mux.has_work();
        self.mux.push(signal, options);
        Ok(was_idle)
    }

    /// Drop the current connection and handshake again
    pub fn reconnect(&mut self) {
        if !matches!(
            self.state,
            SessionState::Disconnecting | SessionState::Disconnected
        ) {
            self.state = SessionState::Reconnecting;
        }
    }

    /// Give up on the peer; the next `execute` fails all signals
    pub fn disconnect(&mut self) {
        if self.state != SessionState::Disconnected {
            self.state = SessionState::Disconnecting;
        }
    }

    /// Run the state machine
    pub fn execute(&mut self, stub: &mut dyn TalkerStub) -> Execution {
        match self.state {
            SessionState::Connecting => {
                self.do_connect(stub);
                Execution::Wait
            }
            SessionState::Accepting => {
                if self.do_accept(stub) {
                    Execution::Reschedule
                } else {
                    Execution::Wait
                }
            }
            SessionState::WaitAccept => Execution::Wait,
            SessionState::Connected => {
                self.do_connected(stub);
                Execution::Wait
            }
            SessionState::Reconnecting => {
                self.reset();
                self.state = SessionState::Connecting;
                info!(peer = %self.peer_addr, "reconnecting");
                Execution::Reschedule
            }
            SessionState::Disconnecting => {
                self.mux.fail_all(&mut self.codecs);
                self.inbound.reset(&mut self.codecs);
                self.send_window.reset();
                self.receive.reset();
                self.state = SessionState::Disconnected;
                info!(peer = %self.peer_addr, "session disconnected");
                Execution::Dead
            }
            SessionState::Disconnected => Execution::Dead,
        }
    }

    /// Handle a buffer received from `source`.
    ///
    /// Returns true when the session should be executed.
    pub fn on_buffer_received(
        &mut self,
        stub: &mut dyn TalkerStub,
        buffer: Buffer,
        source: SocketAddr,
    ) -> bool {
        if matches!(
            self.state,
            SessionState::Disconnecting | SessionState::Disconnected
        ) {
            return false;
        }

        let now = stub.current_time();
        self.last_receive = Some(now);
        self.stats.buffers_received += 1;
        trace!(
            id = buffer.raw_id(),
            kind = ?buffer.buffer_type(),
            updates = buffer.updates_count(),
            size = buffer.size(),
            "buffer received"
        );

        match buffer.buffer_type() {
            BufferType::Connecting => self.handle_connect(buffer, source),
            BufferType::Accepting => self.handle_accept(buffer, source, now),
            BufferType::KeepAlive => {
                if self.accepts_stream(source, now) {
                    self.process_updates(buffer.updates());
                    self.receive.queue_ack(KEEPALIVE_BUFFER_ID);
                }
            }
            BufferType::Data => {
                if self.accepts_stream(source, now) {
                    self.handle_stream(buffer);
                }
            }
        }

        self.needs_execute()
    }

    /// Handle the expiration of a timer armed through `TalkerStub::push_timer`.
    ///
    /// Returns true when the session should be executed.
    pub fn on_timer(&mut self, stub: &mut dyn TalkerStub, key: TimerKey) -> bool {
        if matches!(
            self.state,
            SessionState::Disconnecting | SessionState::Disconnected
        ) {
            return false;
        }
        if key.is_keepalive() {
            return self.on_keepalive_timer(stub, key);
        }

        let Some(slot) = self.send_window.get_mut(key) else {
            trace!(%key, "stale timer");
            return false;
        };
        if slot.sending {
            return false;
        }
        let Some(buffer) = slot.buffer.as_mut() else {
            return false;
        };
        let count = buffer.bump_retransmit_count();
        let buffer_type = buffer.buffer_type();
        let raw_id = buffer.raw_id();

        if self.retries_exhausted(buffer_type, count, raw_id) {
            return true;
        }
        debug!(id = raw_id, count, "retransmitting");
        self.stats.buffers_retransmitted += 1;
        self.send_slot(stub, key);
        false
    }

    /// A send reported as `SendStatus::Queued` finished.
    ///
    /// Returns true when the session should be executed.
    pub fn on_buffer_sent(&mut self, stub: &mut dyn TalkerStub, key: SendKey) -> bool {
        match key {
            SendKey::Updates => {
                self.updates_queued = false;
                self.stats.update_buffers_sent += 1;
            }
            SendKey::Window(key) => {
                if self.send_window.sent(key) {
                    self.stats.buffers_sent += 1;
                    self.arm_retransmit(stub, key);
                }
            }
        }
        self.needs_execute()
    }

    fn needs_execute(&self) -> bool {
        match self.state {
            SessionState::Connecting
            | SessionState::Reconnecting
            | SessionState::Disconnecting => true,
            SessionState::Accepting => self.peer_epoch.is_some(),
            SessionState::WaitAccept | SessionState::Disconnected => false,
            SessionState::Connected => {
                (!self.updates_queued && self.must_send_updates())
                    || (self.mux.has_work() && self.send_window.has_free())
                    || (!self.send_window.keepalive_armed() && self.keepalive_conditions())
            }
        }
    }

    fn must_send_updates(&self) -> bool {
        let pending = self.receive.pending_ack_count();
        pending > 0
            && (!self.inbound.expecting_immediate_data() || pending >= MAX_RECV_NO_UPDATE_COUNT)
    }

    fn retries_exhausted(&mut self, buffer_type: BufferType, count: u8, raw_id: u32) -> bool {
        if buffer_type.is_handshake() {
            if count > self.config.connect_retransmit_count {
                warn!(peer = %self.peer_addr, "handshake not answered, disconnecting");
                self.state = SessionState::Disconnecting;
                return true;
            }
        } else if count > self.config.data_retransmit_count {
            warn!(
                peer = %self.peer_addr,
                id = raw_id,
                "retransmissions exhausted, reconnecting"
            );
            self.state = SessionState::Reconnecting;
            return true;
        }
        false
    }

    fn do_connect(&mut self, stub: &mut dyn TalkerStub) {
        let handshake = Handshake {
            base_port: stub.base_port(),
            epoch: self.local_epoch,
        };
        let buffer = Buffer::handshake(BufferType::Connecting, BufferId::ZERO, handshake);
        self.next_send_id = BufferId::ZERO.next();

        match self.send_window.allocate(buffer, Vec::new()) {
            Some(key) => {
                debug!(peer = %self.peer_addr, epoch = self.local_epoch, "sending connect");
                self.state = SessionState::WaitAccept;
                self.send_slot(stub, key);
            }
            None => warn!(peer = %self.peer_addr, "no free slot for connect buffer"),
        }
    }

    fn do_accept(&mut self, stub: &mut dyn TalkerStub) -> bool {
        let Some(epoch) = self.peer_epoch else {
            return false;
        };
        let handshake = Handshake {
            base_port: stub.base_port(),
            epoch,
        };
        let mut buffer = Buffer::handshake(BufferType::Accepting, BufferId::ZERO, handshake);
        for id in self.receive.take_acks(MAX_DATA_UPDATES) {
            buffer.push_update(id);
        }
        self.next_send_id = BufferId::ZERO.next();

        match self.send_window.allocate(buffer, Vec::new()) {
            Some(key) => {
                self.state = SessionState::Connected;
                info!(peer = %self.peer_addr, "session accepted");
                self.send_slot(stub, key);
                true
            }
            None => {
                warn!(peer = %self.peer_addr, "no free slot for accept buffer");
                false
            }
        }
    }

    fn do_connected(&mut self, stub: &mut dyn TalkerStub) {
        while self.send_window.has_free() {
            self.mux.admit();
            if !self.mux.has_work() {
                break;
            }

            let payload = self.take_payload();
            let mut buffer =
                Buffer::with_payload(BufferType::Data, self.config.buffer_capacity, payload);
            let acks = self.receive.take_acks(MAX_DATA_UPDATES);
            for &id in &acks {
                buffer.push_update(id);
            }

            let signals = self.mux.fill(&mut buffer, &mut self.codecs);
            if buffer.data_size() == 0 {
                // Every signal at the front failed to encode
                self.receive.restore_acks(acks);
                self.recycle(buffer);
                continue;
            }

            buffer.set_id(self.next_send_id);
            self.next_send_id.increment();
            trace!(
                id = %buffer.raw_id(),
                size = buffer.size(),
                completed = signals.len(),
                "data buffer built"
            );

            match self.send_window.allocate(buffer, signals) {
                Some(key) => self.send_slot(stub, key),
                None => break,
            }
        }

        while !self.updates_queued && self.must_send_updates() {
            self.send_updates(stub);
        }

        self.schedule_keepalive(stub);
    }

    fn send_updates(&mut self, stub: &mut dyn TalkerStub) {
        let mut buffer = Buffer::updates_only(self.config.buffer_capacity);
        for id in self.receive.take_acks(MAX_UPDATES) {
            buffer.push_update(id);
        }
        trace!(updates = buffer.updates_count(), "sending updates");
        match stub.push_send_buffer(SendKey::Updates, buffer.to_bytes()) {
            SendStatus::Sent => self.stats.update_buffers_sent += 1,
            SendStatus::Queued => self.updates_queued = true,
        }
    }

    /// Put the buffer of `key` on the wire, arming its timer once sent
    fn send_slot(&mut self, stub: &mut dyn TalkerStub, key: TimerKey) {
        let Some(slot) = self.send_window.get_mut(key) else {
            return;
        };
        let Some(data) = slot.buffer.as_ref().map(Buffer::to_bytes) else {
            return;
        };
        match stub.push_send_buffer(SendKey::Window(key), data) {
            SendStatus::Sent => {
                self.stats.buffers_sent += 1;
                self.arm_retransmit(stub, key);
            }
            SendStatus::Queued => slot.sending = true,
        }
    }

    fn arm_retransmit(&mut self, stub: &mut dyn TalkerStub, key: TimerKey) {
        let Some(buffer) = self
            .send_window
            .get_mut(key)
            .and_then(|slot| slot.buffer.as_ref())
        else {
            return;
        };
        let delay = self
            .backoff
            .timeout(self.table, buffer.retransmit_count(), buffer.raw_id());
        stub.push_timer(key, stub.current_time() + delay);
    }

    fn keepalive_conditions(&self) -> bool {
        self.state == SessionState::Connected
            && !self.config.keepalive_interval.is_zero()
            && self.mux.waiting_response() > 0
            && !self.inbound.expecting_immediate_data()
            && !self.mux.has_work()
            && self.send_window.in_flight() == 0
    }

    fn keepalive_due(&self, now: Instant) -> Instant {
        self.last_receive.unwrap_or(now) + self.config.keepalive_interval
    }

    fn schedule_keepalive(&mut self, stub: &mut dyn TalkerStub) {
        if self.send_window.keepalive_armed() || !self.keepalive_conditions() {
            return;
        }
        let now = stub.current_time();
        let due = self.keepalive_due(now);
        let key = self.send_window.arm_keepalive(Buffer::keepalive());
        self.keepalive_sent = false;

        if now >= due {
            self.keepalive_sent = true;
            self.stats.keepalives_sent += 1;
            self.send_slot(stub, key);
        } else {
            trace!("keepalive armed");
            stub.push_timer(key, due);
        }
    }

    fn on_keepalive_timer(&mut self, stub: &mut dyn TalkerStub, key: TimerKey) -> bool {
        let now = stub.current_time();
        match self.send_window.get_mut(key) {
            Some(slot) if !slot.sending => {}
            _ => return false,
        }

        if !self.keepalive_conditions() {
            self.send_window.disarm_keepalive();
            self.keepalive_sent = false;
            return false;
        }

        let due = self.keepalive_due(now);
        if now < due {
            // Heard from the peer since the keepalive was armed
            if let Some(buffer) = self.keepalive_buffer(key) {
                buffer.set_retransmit_count(0);
            }
            self.keepalive_sent = false;
            stub.push_timer(key, due);
            return false;
        }

        if self.keepalive_sent {
            let Some(count) = self
                .keepalive_buffer(key)
                .map(Buffer::bump_retransmit_count)
            else {
                return false;
            };
            if self.retries_exhausted(BufferType::KeepAlive, count, KEEPALIVE_BUFFER_ID) {
                return true;
            }
            self.stats.buffers_retransmitted += 1;
        }
        self.keepalive_sent = true;
        self.stats.keepalives_sent += 1;
        self.send_slot(stub, key);
        false
    }

    fn keepalive_buffer(&mut self, key: TimerKey) -> Option<&mut Buffer> {
        self.send_window
            .get_mut(key)
            .and_then(|slot| slot.buffer.as_mut())
    }

    /// Data and keepalive buffers are only taken once the handshake has
    /// progressed far enough; in `WaitAccept` the first one completes it.
    fn accepts_stream(&mut self, source: SocketAddr, now: Instant) -> bool {
        match self.state {
            SessionState::Connected => true,
            SessionState::WaitAccept => {
                self.complete_connect(source, now);
                true
            }
            _ => {
                trace!(state = ?self.state, "dropping buffer before handshake");
                false
            }
        }
    }

    fn complete_connect(&mut self, source: SocketAddr, now: Instant) {
        if source != self.peer_addr {
            debug!(from = %self.peer_addr, to = %source, "peer address updated");
            self.peer_addr = source;
        }
        self.state = SessionState::Connected;
        self.last_receive = Some(now);
        info!(peer = %self.peer_addr, "session connected");
    }

    fn handle_connect(&mut self, buffer: Buffer, source: SocketAddr) {
        let handshake = match Handshake::parse(buffer.payload()) {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!(error = %e, %source, "malformed connect buffer");
                return;
            }
        };

        if self.peer_epoch != Some(handshake.epoch) {
            match self.state {
                SessionState::Accepting if self.peer_epoch.is_none() => {
                    debug!(%source, epoch = handshake.epoch, "connect received");
                    self.peer_epoch = Some(handshake.epoch);
                    self.peer_addr = source;
                }
                SessionState::Connecting | SessionState::WaitAccept
                    if self.local_epoch > handshake.epoch =>
                {
                    debug!(%source, "simultaneous connect, keeping our attempt");
                    return;
                }
                SessionState::Connecting | SessionState::WaitAccept => {
                    debug!(%source, "simultaneous connect, accepting the peer's attempt");
                    self.clear_stream();
                    self.state = SessionState::Accepting;
                    self.peer_epoch = Some(handshake.epoch);
                    self.peer_addr = source;
                }
                _ => {
                    info!(%source, "peer restarted handshake");
                    self.reset();
                    self.state = SessionState::Accepting;
                    self.peer_epoch = Some(handshake.epoch);
                    self.peer_addr = source;
                }
            }
        }

        self.handle_stream(buffer);
    }

    fn handle_accept(&mut self, buffer: Buffer, source: SocketAddr, now: Instant) {
        let handshake = match Handshake::parse(buffer.payload()) {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!(error = %e, %source, "malformed accept buffer");
                return;
            }
        };
        if handshake.epoch != self.local_epoch {
            debug!(%source, epoch = handshake.epoch, "stale accept buffer");
            return;
        }

        match self.state {
            SessionState::WaitAccept => self.complete_connect(source, now),
            SessionState::Connected => {}
            _ => return,
        }
        self.handle_stream(buffer);
    }

    /// Process the updates of a stream buffer, then sequence and decode it
    fn handle_stream(&mut self, buffer: Buffer) {
        self.process_updates(buffer.updates());
        if buffer.raw_id() == UPDATE_BUFFER_ID {
            return;
        }

        match self.receive.push(buffer) {
            Arrival::Expected(buffer) => {
                self.deliver(buffer);
                while let Some(buffer) = self.receive.next_in_order() {
                    self.deliver(buffer);
                }
            }
            Arrival::Duplicate => self.stats.duplicates += 1,
            Arrival::Stored => {}
            Arrival::Dropped => self.stats.out_of_order_dropped += 1,
        }
    }

    fn deliver(&mut self, buffer: Buffer) {
        if buffer.buffer_type() == BufferType::Data {
            let peer = PeerInfo {
                connection: self.connection,
                addr: self.peer_addr,
            };
            let responses =
                self.inbound
                    .parse(buffer.payload(), &mut self.codecs, &self.registry, &peer);
            for uid in responses {
                self.mux.resolve_response(uid, &mut self.codecs);
            }
        }
        self.recycle(buffer);
    }

    fn process_updates(&mut self, updates: &[u32]) {
        for &id in updates {
            if id == KEEPALIVE_BUFFER_ID {
                if let Some(buffer) = self
                    .send_window
                    .key(KEEPALIVE_SLOT)
                    .and_then(|key| self.keepalive_buffer(key))
                {
                    buffer.set_retransmit_count(0);
                }
                continue;
            }
            match self.send_window.find(id) {
                Some(index) => {
                    trace!(id, "buffer acknowledged");
                    let (signals, buffer) = self.send_window.release(index);
                    self.mux.buffer_acked(&signals, &mut self.codecs);
                    if let Some(buffer) = buffer {
                        self.recycle(buffer);
                    }
                }
                None => trace!(id, "update for buffer not in flight"),
            }
        }
    }

    /// Rebuild all per-connection state for a new handshake
    fn reset(&mut self) {
        self.inbound.reset(&mut self.codecs);
        self.mux.reset_for_reconnect(&mut self.codecs);
        self.clear_stream();
        self.local_epoch = rand::random();
        self.stats.reconnects += 1;
    }

    /// Drop the handshake and stream bookkeeping. Queued signals stay put;
    /// no data has been sent before the handshake completes.
    fn clear_stream(&mut self) {
        self.send_window.reset();
        self.receive.reset();
        self.backoff.reset();
        self.next_send_id = BufferId::ZERO;
        self.updates_queued = false;
        self.keepalive_sent = false;
        self.peer_epoch = None;
    }

    fn take_payload(&mut self) -> BytesMut {
        self.payloads
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.config.buffer_capacity))
    }

    fn recycle(&mut self, buffer: Buffer) {
        if self.payloads.len() < MAX_POOLED_PAYLOADS {
            self.payloads.push(buffer.into_payload());
        }
    }
}
