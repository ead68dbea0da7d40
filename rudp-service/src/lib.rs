//! RUDP Service Layer
//!
//! Runs sessions over real UDP sockets. A service shards its sessions over a
//! bounded pool of talker threads and routes outgoing signals by the peer's
//! base address.

pub mod allocator;
pub mod service;
mod talker;

pub use allocator::TalkerAllocator;
pub use service::{Service, ServiceConfig, ServiceError};
