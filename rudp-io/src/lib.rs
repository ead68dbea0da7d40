//! RUDP I/O and Platform Abstraction
//!
//! This crate provides the platform layer under the talkers: a UDP socket
//! wrapper and the timer bookkeeping used by the talker event loop.

pub mod socket;
pub mod time;

pub use socket::{RudpSocket, SocketError};
pub use time::{Timer, TimerQueue};
