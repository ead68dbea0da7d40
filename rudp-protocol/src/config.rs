//! Session Configuration

use crate::buffer::{MIN_CAPACITY, DEFAULT_CAPACITY};
use crate::retransmit::{CONNECT_RETRANSMIT_COUNT, DATA_RETRANSMIT_COUNT};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on data slots; timer keys carry the slot in 16 bits
pub const MAX_SEND_BUFFERS: usize = 1024;

/// Session errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Session is disconnected")]
    Closed,
}

/// Tunables of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Data buffers in flight at once
    pub max_send_buffers: usize,
    /// Datagram size
    pub buffer_capacity: usize,
    /// Idle time before a keepalive is sent; zero disables keepalives
    pub keepalive_interval: Duration,
    /// Retransmissions of a data buffer before reconnecting
    pub data_retransmit_count: u8,
    /// Retransmissions of a handshake before giving up
    pub connect_retransmit_count: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_send_buffers: 6,
            buffer_capacity: DEFAULT_CAPACITY,
            keepalive_interval: Duration::ZERO,
            data_retransmit_count: DATA_RETRANSMIT_COUNT,
            connect_retransmit_count: CONNECT_RETRANSMIT_COUNT,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.max_send_buffers == 0 || self.max_send_buffers > MAX_SEND_BUFFERS {
            return Err(SessionError::InvalidConfig(format!(
                "max_send_buffers must be in 1..={}, got {}",
                MAX_SEND_BUFFERS, self.max_send_buffers
            )));
        }
        if self.buffer_capacity < MIN_CAPACITY || self.buffer_capacity > u16::MAX as usize {
            return Err(SessionError::InvalidConfig(format!(
                "buffer_capacity must be in {}..={}, got {}",
                MIN_CAPACITY,
                u16::MAX,
                self.buffer_capacity
            )));
        }
        // Buffer retransmit counts saturate at u8::MAX
        for (name, count) in [
            ("data_retransmit_count", self.data_retransmit_count),
            ("connect_retransmit_count", self.connect_retransmit_count),
        ] {
            if count == 0 || count == u8::MAX {
                return Err(SessionError::InvalidConfig(format!(
                    "{} must be in 1..{}, got {}",
                    name,
                    u8::MAX,
                    count
                )));
            }
        }
        if self.connect_retransmit_count < self.data_retransmit_count {
            return Err(SessionError::InvalidConfig(format!(
                "connect_retransmit_count ({}) must not be below data_retransmit_count ({})",
                self.connect_retransmit_count, self.data_retransmit_count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_small_capacity() {
        let config = SessionConfig {
            buffer_capacity: 64,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SessionError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_unreachable_retransmit_count() {
        let config = SessionConfig {
            data_retransmit_count: u8::MAX,
            connect_retransmit_count: u8::MAX,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SessionError::InvalidConfig(_))));

        let config = SessionConfig {
            data_retransmit_count: 254,
            connect_retransmit_count: 254,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_handshake_tolerating_fewer_retries() {
        let config = SessionConfig {
            data_retransmit_count: 10,
            connect_retransmit_count: 8,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SessionError::InvalidConfig(_))));

        let config = SessionConfig {
            data_retransmit_count: 8,
            connect_retransmit_count: 8,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_window() {
        let config = SessionConfig {
            max_send_buffers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
