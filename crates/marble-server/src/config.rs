//! Process configuration from the environment.

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

pub const COMMAND_CHANNEL_CAPACITY: usize = 256;
pub const EVENT_BROADCAST_CAPACITY: usize = 64;
pub const CLIENT_WRITER_CAPACITY: usize = 16;

const DEFAULT_PORT: u16 = 3000;

#[derive(thiserror::Error, Debug)]
pub enum ServerConfigError {
    #[error("MARBLE_BIND is not an IP address: {0}")]
    InvalidBind(String),

    #[error("MARBLE_PORT is not a port number: {0}")]
    InvalidPort(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Path to the JSON game config; built-in defaults when unset.
    pub game_config: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ServerConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServerConfigError> {
        let bind = match lookup("MARBLE_BIND") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ServerConfigError::InvalidBind(raw))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let port = match lookup("MARBLE_PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ServerConfigError::InvalidPort(raw))?,
            None => DEFAULT_PORT,
        };
        let game_config = lookup("MARBLE_CONFIG")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            bind,
            port,
            game_config,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}
