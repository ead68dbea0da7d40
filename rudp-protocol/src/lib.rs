//! RUDP Protocol Core Implementation
//!
//! This crate implements a session-level reliable messaging protocol over
//! datagrams: buffer wire format, wraparound-safe sequencing, retransmission
//! backoff, out-of-order reassembly, signal multiplexing and the session
//! state machine. It performs no I/O; the owning talker drives sessions
//! through the `TalkerStub` interface.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod inbound;
pub mod multiplexer;
pub mod reassembly;
pub mod retransmit;
pub mod sequence;
pub mod session;
pub mod signal;
pub mod stub;
pub mod window;

pub use buffer::{Buffer, BufferError, BufferType, DataTag, Handshake};
pub use codec::{CodecError, CodecPool, FrameDecoder, FrameEncoder, SignalRegistry};
pub use config::{SessionConfig, SessionError};
pub use reassembly::{Arrival, ReceiveWindow};
pub use retransmit::{Backoff, RetransmitTimeoutTable};
pub use sequence::BufferId;
pub use session::{Execution, Session, SessionState, SessionStats};
pub use signal::{ConnectionUid, PeerInfo, SendDisposition, SendOptions, Signal, SignalUid};
pub use stub::{SendStatus, TalkerStub};
pub use window::{SendKey, TimerKey};
