//! Configuration file support for rudp-node

use rudp::{ServiceConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Per-session tunables as written in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub max_send_buffers: usize,
    pub buffer_capacity: usize,
    /// Zero disables keepalives
    pub keepalive_ms: u64,
    pub data_retransmit_count: u8,
    pub connect_retransmit_count: u8,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let session = SessionConfig::default();
        SessionSettings {
            max_send_buffers: session.max_send_buffers,
            buffer_capacity: session.buffer_capacity,
            keepalive_ms: session.keepalive_interval.as_millis() as u64,
            data_retransmit_count: session.data_retransmit_count,
            connect_retransmit_count: session.connect_retransmit_count,
        }
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        SessionConfig {
            max_send_buffers: settings.max_send_buffers,
            buffer_capacity: settings.buffer_capacity,
            keepalive_interval: Duration::from_millis(settings.keepalive_ms),
            data_retransmit_count: settings.data_retransmit_count,
            connect_retransmit_count: settings.connect_retransmit_count,
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Base address of the local service
    pub bind: SocketAddr,
    /// Base addresses of the peers every input line is sent to
    pub peers: Vec<SocketAddr>,
    pub sessions_per_talker: u32,
    pub max_talkers: usize,
    pub poll_interval_ms: u64,
    /// Zero keeps the system default
    pub socket_buffer_size: usize,
    pub session: SessionSettings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let service = ServiceConfig::default();
        NodeConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], 9500)),
            peers: Vec::new(),
            sessions_per_talker: service.sessions_per_talker,
            max_talkers: service.max_talkers,
            poll_interval_ms: service.poll_interval.as_millis() as u64,
            socket_buffer_size: service.socket_buffer_size,
            session: SessionSettings::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Configuration with one peer, printed by `--example-config`
    pub fn example() -> Self {
        NodeConfig {
            peers: vec![SocketAddr::from(([127, 0, 0, 1], 9501))],
            session: SessionSettings {
                keepalive_ms: 5_000,
                ..SessionSettings::default()
            },
            ..NodeConfig::default()
        }
    }

    /// Build the service configuration, checking the session tunables
    pub fn service_config(&self) -> Result<ServiceConfig, ConfigError> {
        let session = SessionConfig::from(&self.session);
        session
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.sessions_per_talker == 0 || self.max_talkers == 0 {
            return Err(ConfigError::Invalid(
                "sessions_per_talker and max_talkers must be positive".to_string(),
            ));
        }
        Ok(ServiceConfig {
            base_addr: self.bind,
            sessions_per_talker: self.sessions_per_talker,
            max_talkers: self.max_talkers,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            socket_buffer_size: self.socket_buffer_size,
            session,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
