//! Service
//!
//! Routes signals to sessions by the peer's base address and owns the pool of
//! talker threads. The routing table and the talker allocator sit behind one
//! mutex; everything else reaches a talker through its command channel.

use crate::allocator::TalkerAllocator;
use crate::talker::{Talker, TalkerCommand, Target};
use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use rudp_io::{RudpSocket, SocketError};
use rudp_protocol::{
    Buffer, ConnectionUid, SendOptions, SessionConfig, SessionError, Signal, SignalRegistry,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Failed to spawn talker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionUid),

    #[error("No talker available")]
    NoTalker,

    #[error("Service is shut down")]
    ShutDown,
}

/// Service tunables
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address of the first talker; its port is the advertised base port
    pub base_addr: SocketAddr,
    /// Sessions a talker takes before another talker is started
    pub sessions_per_talker: u32,
    /// Upper bound on talker threads
    pub max_talkers: usize,
    /// Longest idle wait of a talker loop
    pub poll_interval: Duration,
    /// Kernel send and receive buffer size of each talker socket; zero keeps
    /// the system default
    pub socket_buffer_size: usize,
    pub session: SessionConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            base_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            sessions_per_talker: 64,
            max_talkers: 4,
            poll_interval: Duration::from_millis(5),
            socket_buffer_size: 1 << 20,
            session: SessionConfig::default(),
        }
    }
}

struct Route {
    talker: usize,
    /// Filled in once the owning talker created the session
    connection: Option<ConnectionUid>,
}

struct TalkerHandle {
    commands: Sender<TalkerCommand>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

struct Routing {
    allocator: TalkerAllocator,
    talkers: Vec<TalkerHandle>,
    sessions: HashMap<SocketAddr, Route>,
    base_port: u16,
    closed: bool,
}

/// State shared between the service handle and its talkers
pub(crate) struct Shared {
    config: ServiceConfig,
    registry: Arc<SignalRegistry>,
    routing: Mutex<Routing>,
}

impl Shared {
    pub(crate) fn session_config(&self) -> &SessionConfig {
        &self.config.session
    }

    pub(crate) fn registry(&self) -> &Arc<SignalRegistry> {
        &self.registry
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    /// A talker got a connect buffer from a source it does not know.
    ///
    /// The buffer goes to the talker already owning `base`, or to a newly
    /// allocated one.
    pub(crate) fn accept_session(
        self: &Arc<Self>,
        from_talker: usize,
        base: SocketAddr,
        source: SocketAddr,
        buffer: Buffer,
    ) {
        let mut routing = self.routing.lock();
        if routing.closed {
            return;
        }

        let talker = match routing.sessions.get(&base) {
            Some(route) => route.talker,
            None => match self.allocate_talker(&mut routing) {
                Ok(talker) => {
                    routing.sessions.insert(
                        base,
                        Route {
                            talker,
                            connection: None,
                        },
                    );
                    talker
                }
                Err(e) => {
                    warn!(%base, error = %e, "cannot accept session");
                    return;
                }
            },
        };
        debug!(%base, %source, from_talker, talker, "routing connect");

        let command = TalkerCommand::Accept {
            base,
            source,
            buffer,
        };
        if routing.talkers[talker].commands.send(command).is_err() {
            warn!(talker, "talker is gone, dropping connect");
        }
    }

    /// The owning talker created the session for `base`
    pub(crate) fn register_connection(&self, base: SocketAddr, connection: ConnectionUid) {
        let mut routing = self.routing.lock();
        if let Some(route) = routing.sessions.get_mut(&base) {
            if route.talker == connection.talker as usize {
                route.connection = Some(connection);
            }
        }
    }

    /// A session of `talker` died; forget the route and free its slot
    pub(crate) fn disconnect_session(
        &self,
        talker: usize,
        base: SocketAddr,
        connection: ConnectionUid,
    ) {
        let mut routing = self.routing.lock();
        let owned = routing.sessions.get(&base).map_or(false, |route| {
            route.talker == talker && route.connection.map_or(true, |uid| uid == connection)
        });
        if owned {
            routing.sessions.remove(&base);
        }
        routing.allocator.release(talker);
        debug!(
            %base,
            %connection,
            sessions = routing.allocator.session_count(talker),
            "session released"
        );
    }

    fn allocate_talker(self: &Arc<Self>, routing: &mut Routing) -> Result<usize, ServiceError> {
        if let Some(talker) = routing.allocator.allocate() {
            return Ok(talker);
        }
        if routing.allocator.can_grow() {
            match self.spawn_talker(routing) {
                Ok(_) => {
                    if let Some(talker) = routing.allocator.allocate() {
                        return Ok(talker);
                    }
                }
                Err(e) => warn!(error = %e, "could not start talker"),
            }
        }
        routing.allocator.allocate_forced().ok_or(ServiceError::NoTalker)
    }

    fn spawn_talker(self: &Arc<Self>, routing: &mut Routing) -> Result<usize, ServiceError> {
        let index = routing.talkers.len();
        let bind_addr = if index == 0 {
            self.config.base_addr
        } else {
            SocketAddr::new(self.config.base_addr.ip(), 0)
        };

        let socket = RudpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;
        let buffer_size = self.config.socket_buffer_size;
        if buffer_size > 0 {
            socket.set_send_buffer_size(buffer_size)?;
            socket.set_recv_buffer_size(buffer_size)?;
        }
        let local_addr = socket.local_addr()?;
        if index == 0 {
            routing.base_port = local_addr.port();
        }

        let (commands, receiver) = unbounded();
        let talker = Talker::new(index, socket, receiver, Arc::clone(self), routing.base_port);
        let thread = thread::Builder::new()
            .name(format!("rudp-talker-{}", index))
            .spawn(move || talker.run())
            .map_err(ServiceError::Spawn)?;

        routing.talkers.push(TalkerHandle {
            commands,
            local_addr,
            thread: Some(thread),
        });
        routing.allocator.add_talker();
        info!(talker = index, addr = %local_addr, "talker started");
        Ok(index)
    }
}

/// Handle of a running service
pub struct Service {
    shared: Arc<Shared>,
}

impl Service {
    /// Validate the configuration and start the first talker on `base_addr`
    pub fn start(config: ServiceConfig, registry: SignalRegistry) -> Result<Self, ServiceError> {
        config.session.validate()?;
        let shared = Arc::new(Shared {
            routing: Mutex::new(Routing {
                allocator: TalkerAllocator::new(config.sessions_per_talker, config.max_talkers),
                talkers: Vec::new(),
                sessions: HashMap::new(),
                base_port: config.base_addr.port(),
                closed: false,
            }),
            config,
            registry: Arc::new(registry),
        });

        {
            let mut routing = shared.routing.lock();
            shared.spawn_talker(&mut routing)?;
        }
        Ok(Service { shared })
    }

    /// Address peers connect to
    pub fn base_addr(&self) -> SocketAddr {
        let routing = self.shared.routing.lock();
        routing
            .talkers
            .first()
            .map(|talker| talker.local_addr)
            .unwrap_or(self.shared.config.base_addr)
    }

    pub fn talker_count(&self) -> usize {
        self.shared.routing.lock().talkers.len()
    }

    pub fn session_count(&self) -> usize {
        self.shared.routing.lock().sessions.len()
    }

    /// Connection of the session for `peer_base`, once its talker created it
    pub fn connection_for(&self, peer_base: SocketAddr) -> Option<ConnectionUid> {
        self.shared
            .routing
            .lock()
            .sessions
            .get(&peer_base)
            .and_then(|route| route.connection)
    }

    /// Send to the peer whose service listens on `peer_base`, connecting
    /// first if there is no session yet
    pub fn send_signal(
        &self,
        peer_base: SocketAddr,
        mut signal: Box<dyn Signal>,
        options: SendOptions,
    ) -> Result<(), ServiceError> {
        let mut routing = self.shared.routing.lock();
        if routing.closed {
            signal.on_send_failed(false);
            return Err(ServiceError::ShutDown);
        }

        let talker = match routing.sessions.get(&peer_base) {
            Some(route) => route.talker,
            None => {
                let talker = match self.shared.allocate_talker(&mut routing) {
                    Ok(talker) => talker,
                    Err(e) => {
                        signal.on_send_failed(false);
                        return Err(e);
                    }
                };
                routing.sessions.insert(
                    peer_base,
                    Route {
                        talker,
                        connection: None,
                    },
                );
                debug!(peer = %peer_base, talker, "connecting");
                let connect = TalkerCommand::Connect { base: peer_base };
                if routing.talkers[talker].commands.send(connect).is_err() {
                    routing.sessions.remove(&peer_base);
                    routing.allocator.release(talker);
                    signal.on_send_failed(false);
                    return Err(ServiceError::ShutDown);
                }
                talker
            }
        };

        push(&routing.talkers[talker], Target::Base(peer_base), signal, options)
    }

    /// Send over an existing connection. The signal is bound to that
    /// connection and fails instead of surviving a reconnect.
    pub fn send_to(
        &self,
        connection: ConnectionUid,
        mut signal: Box<dyn Signal>,
    ) -> Result<(), ServiceError> {
        let routing = self.shared.routing.lock();
        let Some(talker) = routing.talkers.get(connection.talker as usize) else {
            signal.on_send_failed(false);
            return Err(ServiceError::UnknownConnection(connection));
        };
        push(
            talker,
            Target::Connection(connection),
            signal,
            SendOptions::same_connector(),
        )
    }

    /// Ask the owning talker to close the session
    pub fn disconnect(&self, connection: ConnectionUid) -> Result<(), ServiceError> {
        let routing = self.shared.routing.lock();
        let talker = routing
            .talkers
            .get(connection.talker as usize)
            .ok_or(ServiceError::UnknownConnection(connection))?;
        talker
            .commands
            .send(TalkerCommand::Disconnect { connection })
            .map_err(|_| ServiceError::ShutDown)
    }

    /// Stop every talker and wait for their threads
    pub fn shutdown(self) {
        self.stop();
    }

    fn stop(&self) {
        let threads: Vec<JoinHandle<()>> = {
            let mut routing = self.shared.routing.lock();
            if routing.closed {
                return;
            }
            routing.closed = true;
            routing
                .talkers
                .iter_mut()
                .filter_map(|talker| {
                    let _ = talker.commands.send(TalkerCommand::Shutdown);
                    talker.thread.take()
                })
                .collect()
        };
        for thread in threads {
            if thread.join().is_err() {
                warn!("talker thread panicked");
            }
        }
        info!("service stopped");
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
    }
}

fn push(
    talker: &TalkerHandle,
    target: Target,
    signal: Box<dyn Signal>,
    options: SendOptions,
) -> Result<(), ServiceError> {
    let command = TalkerCommand::Push {
        target,
        signal,
        options,
    };
    match talker.commands.send(command) {
        Ok(()) => Ok(()),
        Err(err) => {
            if let TalkerCommand::Push { mut signal, .. } = err.into_inner() {
                signal.on_send_failed(false);
            }
            Err(ServiceError::ShutDown)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> ServiceConfig {
        ServiceConfig {
            base_addr: "127.0.0.1:0".parse().unwrap(),
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn test_start_binds_base_talker() {
        let service = Service::start(loopback(), SignalRegistry::new()).unwrap();
        assert_eq!(service.talker_count(), 1);
        assert!(service.base_addr().port() > 0);
        assert_eq!(service.session_count(), 0);
        service.shutdown();
    }

    #[test]
    fn test_invalid_session_config_rejected() {
        let mut config = loopback();
        config.session.max_send_buffers = 0;
        let err = Service::start(config, SignalRegistry::new()).err().unwrap();
        assert!(matches!(err, ServiceError::Session(SessionError::InvalidConfig(_))));
    }

    #[test]
    fn test_disconnect_unknown_talker() {
        let service = Service::start(loopback(), SignalRegistry::new()).unwrap();
        let uid = ConnectionUid::new(7, 0, 0);
        assert!(matches!(
            service.disconnect(uid),
            Err(ServiceError::UnknownConnection(_))
        ));
    }
}
