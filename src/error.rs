//! Error types for the relay engine.

use std::net::SocketAddr;

use serde::Serialize;
use thiserror::Error;

use crate::proxy::socks5::Reply;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the proxy.
#[derive(Error, Debug)]
pub enum Error {
    /// Configured port does not fit in 16 bits
    #[error("invalid port: {0}")]
    InvalidPort(u32),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Listening socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Not enough bytes buffered to parse a complete message
    #[error("truncated message: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Protocol version mismatch
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// Command byte outside the defined set
    #[error("unknown command: 0x{0:02x}")]
    UnknownCommand(u8),

    /// Address type byte outside the defined set
    #[error("unsupported address type: 0x{0:02x}")]
    UnsupportedAddressType(u8),

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Client offered no method the proxy accepts
    #[error("no acceptable authentication method offered")]
    NoAcceptableMethod,

    /// Recognized command the proxy does not implement
    #[error("command not supported: 0x{0:02x}")]
    UnsupportedCommand(u8),

    /// Target could not be reached
    #[error("failed to connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Work abandoned because the server is stopping
    #[error("operation cancelled")]
    Cancelled,
}

/// Coarse error taxonomy reported to the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad configuration, fatal to `start`
    Configuration,
    /// Listening socket unavailable, fatal to `start`
    Bind,
    /// Malformed handshake, local to one connection
    Protocol,
    /// Target unreachable, local to one connection
    Dial,
    /// Read/write failure or cancellation
    Io,
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new invalid message error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidMessage(msg.into())
    }

    /// Taxonomy bucket for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidPort(_) | Error::Config(_) => ErrorCategory::Configuration,
            Error::Bind { .. } => ErrorCategory::Bind,
            Error::Truncated { .. }
            | Error::VersionMismatch { .. }
            | Error::UnknownCommand(_)
            | Error::UnsupportedAddressType(_)
            | Error::InvalidMessage(_)
            | Error::NoAcceptableMethod
            | Error::UnsupportedCommand(_) => ErrorCategory::Protocol,
            Error::Dial { .. } => ErrorCategory::Dial,
            Error::Network(_) | Error::Cancelled => ErrorCategory::Io,
        }
    }

    /// Check if more input could turn this failure into a successful parse
    pub fn is_truncated(&self) -> bool {
        matches!(self, Error::Truncated { .. })
    }

    /// Reply code to send the client, if the failure can still be answered.
    pub fn reply_code(&self) -> Option<Reply> {
        match self {
            Error::UnsupportedAddressType(_) => Some(Reply::AddressTypeNotSupported),
            Error::UnknownCommand(_) | Error::UnsupportedCommand(_) => {
                Some(Reply::CommandNotSupported)
            }
            Error::Truncated { .. } | Error::VersionMismatch { .. } | Error::InvalidMessage(_) => {
                Some(Reply::GeneralFailure)
            }
            Error::Dial { source, .. } => Some(Reply::from_io_error(source)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidPort(70000);
        assert_eq!(err.to_string(), "invalid port: 70000");

        let err = Error::UnknownCommand(0x09);
        assert_eq!(err.to_string(), "unknown command: 0x09");
    }

    #[test]
    fn test_error_category() {
        assert_eq!(Error::InvalidPort(1 << 20).category(), ErrorCategory::Configuration);
        assert_eq!(Error::NoAcceptableMethod.category(), ErrorCategory::Protocol);
        assert_eq!(Error::Cancelled.category(), ErrorCategory::Io);
    }

    #[test]
    fn test_reply_code() {
        let refused = Error::Dial {
            target: "127.0.0.1:1".into(),
            source: std::io::ErrorKind::ConnectionRefused.into(),
        };
        assert_eq!(refused.reply_code(), Some(Reply::ConnectionRefused));
        assert_eq!(
            Error::UnsupportedAddressType(0x02).reply_code(),
            Some(Reply::AddressTypeNotSupported)
        );
        assert_eq!(
            Error::Truncated { expected: 10, actual: 4 }.reply_code(),
            Some(Reply::GeneralFailure)
        );
        assert_eq!(Error::Cancelled.reply_code(), None);
    }
}
