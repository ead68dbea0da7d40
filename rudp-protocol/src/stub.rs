//! Talker Interface
//!
//! The narrow view of its owning socket handler that a session gets while
//! handling an event.

use crate::window::{SendKey, TimerKey};
use bytes::Bytes;
use std::time::Instant;

/// Outcome of handing a datagram to the talker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Written to the socket
    Sent,
    /// Backlogged; `Session::on_buffer_sent` is called with the key later
    Queued,
}

/// Services a session needs from its talker
pub trait TalkerStub {
    /// Send a serialized buffer to the session's peer
    fn push_send_buffer(&mut self, key: SendKey, data: Bytes) -> SendStatus;

    /// Fire `Session::on_timer(key)` at `deadline`
    fn push_timer(&mut self, key: TimerKey, deadline: Instant);

    /// Time of the event being handled
    fn current_time(&self) -> Instant;

    /// Base port advertised in handshakes
    fn base_port(&self) -> u16;
}
