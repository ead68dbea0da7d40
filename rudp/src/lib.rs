//! RUDP - Reliable session messaging over UDP
//!
//! High-level entry point re-exporting the protocol core, the socket layer
//! and the talker service.

pub use rudp_io as io;
pub use rudp_protocol as protocol;
pub use rudp_service as service;

// Re-export commonly used types
pub use protocol::{
    ConnectionUid, PeerInfo, SendDisposition, SendOptions, SessionConfig, Signal, SignalRegistry,
    SignalUid,
};
pub use service::{Service, ServiceConfig, ServiceError};
