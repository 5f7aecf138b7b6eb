//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::proxy::relay::DEFAULT_BUFFER_SIZE;

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 1080;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address; all interfaces unless narrowed
    pub listen_addr: IpAddr,
    /// Listen port, validated on start
    pub listen_port: u32,
    /// Give up on a dial after this long; unlimited when `None`
    pub connect_timeout: Option<Duration>,
    /// Copy buffer per relay direction
    pub relay_buffer_size: usize,
}

impl ServerConfig {
    /// Listen on every interface at `port`.
    pub fn new(port: u32) -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: port,
            connect_timeout: None,
            relay_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Validate the configuration, returning the port as a 16-bit value.
    pub fn validate(&self) -> Result<u16> {
        let port = u16::try_from(self.listen_port).map_err(|_| Error::InvalidPort(self.listen_port))?;
        if self.relay_buffer_size == 0 {
            return Err(Error::config("relay_buffer_size must be non-zero"));
        }
        if self.connect_timeout == Some(Duration::ZERO) {
            return Err(Error::config("connect_timeout must be non-zero"));
        }
        Ok(port)
    }

    /// Address the listener binds.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.listen_addr, self.validate()?))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PORT as u32)
    }
}

/// Configuration file format for serialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerConfigFile {
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u32,
    /// Dial timeout (seconds), unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
    /// Relay buffer size (bytes)
    #[serde(default = "default_buffer_size")]
    pub relay_buffer_size: usize,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl ServerConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ServerConfig> {
        let listen_addr: IpAddr = self
            .listen_addr
            .parse()
            .map_err(|e| Error::config(format!("invalid listen_addr {:?}: {}", self.listen_addr, e)))?;

        let config = ServerConfig {
            listen_addr,
            listen_port: self.listen_port,
            connect_timeout: self.connect_timeout_secs.map(Duration::from_secs),
            relay_buffer_size: self.relay_buffer_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.to_string(),
            listen_port: config.listen_port,
            connect_timeout_secs: config.connect_timeout.map(|t| t.as_secs()),
            relay_buffer_size: config.relay_buffer_size,
        }
    }

    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(e.to_string()))
    }

    /// Render as a TOML document.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }
}
