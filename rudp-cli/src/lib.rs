//! RUDP CLI Library
//!
//! Shared functionality for the RUDP command-line tools.

pub mod config;
pub mod logging;
pub mod text;

pub use config::{ConfigError, NodeConfig, SessionSettings};
pub use text::{text_registry, Incoming, TextSignal, TEXT_SIGNAL};
