//! # lansocks
//!
//! A SOCKS5 relay engine that shares a device's connectivity with other
//! machines on the same local network.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Owner (CLI, mobile shell via C ABI, ...)         │
//! ├─────────────────────────────────────────────────────────┤
//! │  Server: listener, connection table, lifecycle events   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Connection handler: greeting → request → dial → relay  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Proxy layer: SOCKS5 codec, bidirectional relay pumps   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lansocks::server::{Server, ServerConfig, ServerEvent};
//!
//! # async fn run() -> lansocks::Result<()> {
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let server = Server::new(ServerConfig::new(1080), Arc::new(tx));
//! server.start().await?;
//!
//! while let Some(event) = rx.recv().await {
//!     if let ServerEvent::ConnectionUpdated(stats) = event {
//!         println!("{} {} in={} out={}", stats.id, stats.state, stats.bytes_in, stats.bytes_out);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(feature = "ffi"), deny(unsafe_code))]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod proxy;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "ffi")]
pub mod ffi;

pub use error::{Error, ErrorCategory, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
