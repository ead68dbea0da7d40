//! Application Signals
//!
//! A signal is the unit of application work carried by a session. Sessions
//! own the signals they send or receive and talk to the application only
//! through the lifecycle hooks of the `Signal` trait.

use bytes::BytesMut;
use std::fmt;
use std::net::SocketAddr;

/// Handle of an in-flight outbound signal (slot index + generation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalUid {
    pub index: u32,
    pub generation: u32,
}

impl SignalUid {
    pub fn new(index: u32, generation: u32) -> Self {
        SignalUid { index, generation }
    }
}

impl fmt::Display for SignalUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.generation)
    }
}

/// Handle of a session inside a talker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnectionUid {
    pub talker: u32,
    pub session: u32,
    pub generation: u32,
}

impl ConnectionUid {
    pub fn new(talker: u32, session: u32, generation: u32) -> Self {
        ConnectionUid {
            talker,
            session,
            generation,
        }
    }
}

impl fmt::Display for ConnectionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.talker, self.session, self.generation)
    }
}

/// Where a received signal came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub connection: ConnectionUid,
    pub addr: SocketAddr,
}

/// Returned by `Signal::prepare_for_send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDisposition {
    /// The signal is done once its buffers are acknowledged
    NoResponseExpected,
    /// The signal stays in flight until a response names its uid
    WaitsForResponse,
}

/// Per-signal send options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOptions {
    /// The signal is bound to the current connection and must not survive a
    /// reconnect
    pub same_connector: bool,
}

impl SendOptions {
    pub fn same_connector() -> Self {
        SendOptions {
            same_connector: true,
        }
    }
}

/// An application message
pub trait Signal: Send + 'static {
    /// Registry id used to pick the constructor on the receiving side
    fn signal_type(&self) -> u16;

    /// Write the signal body
    fn encode(&self, out: &mut BytesMut);

    /// Called once when the signal is admitted for sending
    fn prepare_for_send(&mut self, _uid: SignalUid) -> SendDisposition {
        SendDisposition::NoResponseExpected
    }

    /// Called when the signal has been fully received and decoded.
    ///
    /// The signal is handed over by value; returning a uid marks the outbound
    /// signal this one answers.
    fn on_fully_received(self: Box<Self>, peer: &PeerInfo) -> Option<SignalUid>;

    /// The signal will not be delivered. `sent_once` tells whether at least one
    /// complete copy went on the wire.
    fn on_send_failed(&mut self, _sent_once: bool) {}

    /// The signal was acknowledged (or, for waiting signals, answered)
    fn on_send_succeeded(&mut self) {}
}
