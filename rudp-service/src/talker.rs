//! Talker
//!
//! One talker owns one UDP socket and every session bound to it. It runs on
//! its own thread: each loop iteration drains the command channel, reads
//! datagrams, fires due timers, flushes the send backlog and finally
//! executes the sessions that asked for it.

use crate::service::Shared;
use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use rudp_io::{RudpSocket, Timer, TimerQueue};
use rudp_protocol::{
    Buffer, BufferType, ConnectionUid, Execution, Handshake, SendKey, SendOptions, SendStatus,
    Session, SessionState, Signal, TalkerStub, TimerKey,
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Datagrams read per loop iteration before other work gets a turn
const MAX_RECEIVES_PER_POLL: usize = 64;

const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Largest UDP payload
const RECEIVE_BUFFER_SIZE: usize = 65_536;

/// How a command names its session
#[derive(Debug, Clone, Copy)]
pub(crate) enum Target {
    Base(SocketAddr),
    Connection(ConnectionUid),
}

pub(crate) enum TalkerCommand {
    /// Open a connector session to `base` unless one exists
    Connect { base: SocketAddr },
    Push {
        target: Target,
        signal: Box<dyn Signal>,
        options: SendOptions,
    },
    /// Connect buffer routed here by the service
    Accept {
        base: SocketAddr,
        source: SocketAddr,
        buffer: Buffer,
    },
    Disconnect { connection: ConnectionUid },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SessionTimer {
    session: usize,
    generation: u32,
    key: TimerKey,
}

struct Outgoing {
    session: usize,
    generation: u32,
    key: SendKey,
    dest: SocketAddr,
    data: Bytes,
}

struct Entry {
    session: Session,
    base: SocketAddr,
    /// Address the session is reachable under in `by_addr`
    addr: SocketAddr,
    scheduled: bool,
}

#[derive(Default)]
struct Slot {
    entry: Option<Entry>,
    generation: u32,
}

/// Per-event view of the talker handed to a session
struct EventStub<'a> {
    socket: &'a RudpSocket,
    timers: &'a mut TimerQueue<SessionTimer>,
    backlog: &'a mut VecDeque<Outgoing>,
    session: usize,
    generation: u32,
    peer: SocketAddr,
    now: Instant,
    base_port: u16,
}

impl TalkerStub for EventStub<'_> {
    fn push_send_buffer(&mut self, key: SendKey, data: Bytes) -> SendStatus {
        if self.backlog.is_empty() {
            match self.socket.send_to(&data, self.peer) {
                Ok(_) => return SendStatus::Sent,
                Err(e) if e.is_would_block() => {}
                Err(e) => {
                    // Lost like any other datagram; retransmission covers it
                    debug!(peer = %self.peer, error = %e, "send failed");
                    return SendStatus::Sent;
                }
            }
        }
        self.backlog.push_back(Outgoing {
            session: self.session,
            generation: self.generation,
            key,
            dest: self.peer,
            data,
        });
        SendStatus::Queued
    }

    fn push_timer(&mut self, key: TimerKey, deadline: Instant) {
        self.timers.push(
            deadline,
            SessionTimer {
                session: self.session,
                generation: self.generation,
                key,
            },
        );
    }

    fn current_time(&self) -> Instant {
        self.now
    }

    fn base_port(&self) -> u16 {
        self.base_port
    }
}

pub(crate) struct Talker {
    index: usize,
    socket: RudpSocket,
    commands: Receiver<TalkerCommand>,
    shared: Arc<Shared>,
    base_port: u16,
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_addr: HashMap<SocketAddr, usize>,
    by_base: HashMap<SocketAddr, usize>,
    timers: TimerQueue<SessionTimer>,
    backlog: VecDeque<Outgoing>,
    runnable: VecDeque<usize>,
    receive_buffer: Vec<u8>,
    stats: Timer,
}

impl Talker {
    pub(crate) fn new(
        index: usize,
        socket: RudpSocket,
        commands: Receiver<TalkerCommand>,
        shared: Arc<Shared>,
        base_port: u16,
    ) -> Self {
        Talker {
            index,
            socket,
            commands,
            shared,
            base_port,
            slots: Vec::new(),
            free: Vec::new(),
            by_addr: HashMap::new(),
            by_base: HashMap::new(),
            timers: TimerQueue::new(),
            backlog: VecDeque::new(),
            runnable: VecDeque::new(),
            receive_buffer: vec![0u8; RECEIVE_BUFFER_SIZE],
            stats: Timer::new(STATS_INTERVAL),
        }
    }

    pub(crate) fn run(mut self) {
        debug!(talker = self.index, "talker loop started");
        while self.poll() {}
        self.close_all();
        info!(talker = self.index, "talker stopped");
    }

    /// One loop iteration; false once the talker was told to stop
    fn poll(&mut self) -> bool {
        let mut busy = match self.drain_commands() {
            Some(busy) => busy,
            None => return false,
        };
        busy |= self.receive();
        self.fire_timers();
        self.flush_backlog();
        self.execute_runnable();

        let now = Instant::now();
        if self.stats.try_fire(now) {
            debug!(
                talker = self.index,
                sessions = self.by_base.len(),
                timers = self.timers.len(),
                backlog = self.backlog.len(),
                "talker stats"
            );
        }

        if busy || !self.runnable.is_empty() {
            return true;
        }
        self.wait_for_command(now)
    }

    /// Returns whether any command was handled, or `None` on shutdown
    fn drain_commands(&mut self) -> Option<bool> {
        let mut handled = false;
        loop {
            match self.commands.try_recv() {
                Ok(TalkerCommand::Shutdown) | Err(TryRecvError::Disconnected) => return None,
                Ok(command) => {
                    self.handle_command(command);
                    handled = true;
                }
                Err(TryRecvError::Empty) => return Some(handled),
            }
        }
    }

    /// Idle until a command arrives, the next timer is due or the poll
    /// interval passes
    fn wait_for_command(&mut self, now: Instant) -> bool {
        let mut wait = self.shared.poll_interval();
        if let Some(until_timer) = self.timers.time_until_next(now) {
            wait = wait.min(until_timer);
        }
        if !self.backlog.is_empty() {
            wait = wait.min(Duration::from_millis(1));
        }
        match self.commands.recv_timeout(wait) {
            Ok(TalkerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => false,
            Ok(command) => {
                self.handle_command(command);
                true
            }
            Err(RecvTimeoutError::Timeout) => true,
        }
    }

    fn handle_command(&mut self, command: TalkerCommand) {
        match command {
            TalkerCommand::Connect { base } => {
                if !self.by_base.contains_key(&base) {
                    match Session::connector(
                        base,
                        self.shared.session_config().clone(),
                        Arc::clone(self.shared.registry()),
                    ) {
                        Ok(session) => {
                            let index = self.insert(session, base, base);
                            self.schedule(index);
                        }
                        Err(e) => {
                            warn!(%base, error = %e, "cannot create session");
                            self.shared
                                .disconnect_session(self.index, base, ConnectionUid::default());
                        }
                    }
                }
            }
            TalkerCommand::Push {
                target,
                mut signal,
                options,
            } => match self.resolve(target) {
                Some(index) => {
                    let Some(entry) = self.entry_mut(index) else {
                        return;
                    };
                    if let Ok(true) = entry.session.push_signal(signal, options) {
                        self.schedule(index);
                    }
                }
                None => {
                    debug!(?target, "no session for signal");
                    signal.on_send_failed(false);
                }
            },
            TalkerCommand::Accept {
                base,
                source,
                buffer,
            } => {
                let index = match self.by_base.get(&base) {
                    Some(&index) => index,
                    None => match Session::acceptor(
                        source,
                        self.shared.session_config().clone(),
                        Arc::clone(self.shared.registry()),
                    ) {
                        Ok(session) => self.insert(session, base, source),
                        Err(e) => {
                            warn!(%base, error = %e, "cannot create session");
                            self.shared
                                .disconnect_session(self.index, base, ConnectionUid::default());
                            return;
                        }
                    },
                };
                self.deliver(index, buffer, source);
            }
            TalkerCommand::Disconnect { connection } => {
                if let Some(index) = self.resolve(Target::Connection(connection)) {
                    if let Some(entry) = self.entry_mut(index) {
                        entry.session.disconnect();
                    }
                    self.schedule(index);
                }
            }
            TalkerCommand::Shutdown => {}
        }
    }

    fn resolve(&self, target: Target) -> Option<usize> {
        match target {
            Target::Base(base) => self.by_base.get(&base).copied(),
            Target::Connection(uid) => {
                let index = uid.session as usize;
                let slot = self.slots.get(index)?;
                (uid.talker as usize == self.index
                    && slot.generation == uid.generation
                    && slot.entry.is_some())
                .then_some(index)
            }
        }
    }

    fn entry_mut(&mut self, index: usize) -> Option<&mut Entry> {
        self.slots.get_mut(index).and_then(|slot| slot.entry.as_mut())
    }

    fn insert(&mut self, mut session: Session, base: SocketAddr, addr: SocketAddr) -> usize {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let generation = self.slots[index].generation;
        let connection = ConnectionUid::new(self.index as u32, index as u32, generation);
        session.set_connection_uid(connection);
        self.slots[index].entry = Some(Entry {
            session,
            base,
            addr,
            scheduled: false,
        });
        self.by_base.insert(base, index);
        self.by_addr.insert(addr, index);
        self.shared.register_connection(base, connection);
        debug!(talker = self.index, %base, %connection, "session created");
        index
    }

    fn remove(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        let Some(entry) = slot.entry.take() else {
            return;
        };
        let connection = entry.session.connection_uid();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);

        if self.by_addr.get(&entry.addr) == Some(&index) {
            self.by_addr.remove(&entry.addr);
        }
        if self.by_base.get(&entry.base) == Some(&index) {
            self.by_base.remove(&entry.base);
        }
        self.timers.retain(|timer| timer.session != index);
        self.backlog.retain(|out| out.session != index);
        self.shared.disconnect_session(self.index, entry.base, connection);
    }

    fn schedule(&mut self, index: usize) {
        if let Some(entry) = self.entry_mut(index) {
            if !entry.scheduled {
                entry.scheduled = true;
                self.runnable.push_back(index);
            }
        }
    }

    /// Run `f` on the session in `index` with a stub bound to it
    fn with_session<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut Session, &mut dyn TalkerStub) -> R,
    ) -> Option<R> {
        let Talker {
            slots,
            socket,
            timers,
            backlog,
            base_port,
            ..
        } = self;
        let slot = slots.get_mut(index)?;
        let generation = slot.generation;
        let entry = slot.entry.as_mut()?;
        let mut stub = EventStub {
            socket: &*socket,
            timers,
            backlog,
            session: index,
            generation,
            peer: entry.session.peer_addr(),
            now: Instant::now(),
            base_port: *base_port,
        };
        Some(f(&mut entry.session, &mut stub))
    }

    /// Keep `by_addr` in step with the session's current peer address
    fn sync_addr(&mut self, index: usize) {
        let Some(entry) = self.slots.get_mut(index).and_then(|slot| slot.entry.as_mut()) else {
            return;
        };
        let current = entry.session.peer_addr();
        if current == entry.addr {
            return;
        }
        let previous = std::mem::replace(&mut entry.addr, current);
        if self.by_addr.get(&previous) == Some(&index) {
            self.by_addr.remove(&previous);
        }
        self.by_addr.insert(current, index);
        trace!(%previous, %current, "session address rebound");
    }

    fn deliver(&mut self, index: usize, buffer: Buffer, source: SocketAddr) {
        let run = self.with_session(index, |session, stub| {
            session.on_buffer_received(stub, buffer, source)
        });
        self.sync_addr(index);
        if run == Some(true) {
            self.schedule(index);
        }
    }

    /// Returns whether anything was read
    fn receive(&mut self) -> bool {
        let capacity = self.shared.session_config().buffer_capacity;
        let mut received = false;
        for _ in 0..MAX_RECEIVES_PER_POLL {
            let (buffer, source) = match self.socket.recv_from(&mut self.receive_buffer) {
                Ok((n, source)) => {
                    (Buffer::from_bytes(&self.receive_buffer[..n], capacity), source)
                }
                Err(e) if e.is_would_block() => break,
                Err(e) => {
                    // ICMP errors of earlier sends surface here
                    debug!(talker = self.index, error = %e, "receive failed");
                    break;
                }
            };
            received = true;
            match buffer {
                Ok(buffer) => self.dispatch(buffer, source),
                Err(e) => warn!(%source, error = %e, "dropping malformed buffer"),
            }
        }
        received
    }

    fn dispatch(&mut self, buffer: Buffer, source: SocketAddr) {
        if let Some(&index) = self.by_addr.get(&source) {
            self.deliver(index, buffer, source);
            return;
        }

        match buffer.buffer_type() {
            BufferType::Connecting => match Handshake::parse(buffer.payload()) {
                Ok(handshake) => {
                    let base = SocketAddr::new(source.ip(), handshake.base_port);
                    self.shared.accept_session(self.index, base, source, buffer);
                }
                Err(e) => warn!(%source, error = %e, "malformed connect buffer"),
            },
            // The acceptor may answer from another talker's port; match the
            // echoed epoch against our pending connects.
            BufferType::Accepting => match Handshake::parse(buffer.payload()) {
                Ok(handshake) => match self.find_waiting(handshake.epoch) {
                    Some(index) => self.deliver(index, buffer, source),
                    None => trace!(%source, "accept for no pending connect"),
                },
                Err(e) => warn!(%source, error = %e, "malformed accept buffer"),
            },
            _ => trace!(%source, "buffer from unknown peer dropped"),
        }
    }

    fn find_waiting(&self, epoch: u32) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.entry.as_ref().map_or(false, |entry| {
                entry.session.state() == SessionState::WaitAccept
                    && entry.session.local_epoch() == epoch
            })
        })
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some((_, timer)) = self.timers.pop_due(now) {
            let current = self
                .slots
                .get(timer.session)
                .map_or(false, |slot| slot.generation == timer.generation);
            if !current {
                continue;
            }
            let run = self.with_session(timer.session, |session, stub| {
                session.on_timer(stub, timer.key)
            });
            if run == Some(true) {
                self.schedule(timer.session);
            }
        }
    }

    fn flush_backlog(&mut self) {
        while let Some(out) = self.backlog.front() {
            match self.socket.send_to(&out.data, out.dest) {
                Ok(_) => {}
                Err(e) if e.is_would_block() => return,
                Err(e) => debug!(peer = %out.dest, error = %e, "send failed"),
            }
            let Some(out) = self.backlog.pop_front() else {
                return;
            };
            let current = self
                .slots
                .get(out.session)
                .map_or(false, |slot| slot.generation == out.generation);
            if !current {
                continue;
            }
            let run = self.with_session(out.session, |session, stub| {
                session.on_buffer_sent(stub, out.key)
            });
            if run == Some(true) {
                self.schedule(out.session);
            }
        }
    }

    fn execute_runnable(&mut self) {
        for _ in 0..self.runnable.len() {
            let Some(index) = self.runnable.pop_front() else {
                break;
            };
            let Some(entry) = self.entry_mut(index) else {
                continue;
            };
            entry.scheduled = false;

            match self.with_session(index, |session, stub| session.execute(stub)) {
                Some(Execution::Reschedule) => self.schedule(index),
                Some(Execution::Wait) => {}
                Some(Execution::Dead) => self.remove(index),
                None => {}
            }
        }
    }

    /// Fail everything still queued before the thread exits
    fn close_all(&mut self) {
        for index in 0..self.slots.len() {
            let dead = self.with_session(index, |session, stub| {
                session.disconnect();
                while session.execute(stub) != Execution::Dead {}
            });
            if dead.is_some() {
                self.remove(index);
            }
        }
    }
}
