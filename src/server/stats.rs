//! Per-connection statistics snapshots.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::proxy::socks5::Address;

/// Unique connection identifier.
pub type ConnectionId = u64;

/// Connection lifecycle, in the only order it may be traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Waiting for the method-selection message
    AwaitingGreeting,
    /// Method negotiated, waiting for the connect request
    AwaitingRequest,
    /// Dialing the destination
    Connecting,
    /// Pumping bytes in both directions
    Relaying,
    /// Terminal
    Closed,
}

impl ConnectionState {
    /// The state that normally follows this one.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::AwaitingGreeting => Some(Self::AwaitingRequest),
            Self::AwaitingRequest => Some(Self::Connecting),
            Self::Connecting => Some(Self::Relaying),
            Self::Relaying => Some(Self::Closed),
            Self::Closed => None,
        }
    }

    /// One step forward, or straight to `Closed` from anywhere but `Closed`.
    pub fn can_transition_to(self, target: Self) -> bool {
        if self == Self::Closed {
            return false;
        }
        target == Self::Closed || self.next() == Some(target)
    }

    /// Whether the state is terminal.
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingGreeting => "awaiting greeting",
            Self::AwaitingRequest => "awaiting request",
            Self::Connecting => "connecting",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Requested destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    /// Destination for a parsed request address.
    pub fn new(address: &Address, port: u16) -> Self {
        Self {
            host: address.host(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Point-in-time view of one connection, handed to the owner by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    /// Unknown until the connect request has been parsed
    pub destination: Option<Destination>,
    /// Bytes relayed from the client to the target
    pub bytes_in: u64,
    /// Bytes relayed from the target to the client
    pub bytes_out: u64,
    pub state: ConnectionState,
    pub started_at: DateTime<Utc>,
}

impl ConnectionStats {
    /// Whether this is the terminal snapshot of its connection.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}
