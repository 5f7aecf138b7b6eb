//! SOCKS5 wire protocol and byte relay.
//!
//! Neither module touches sockets directly: the codec works on byte slices
//! and the relay on any `AsyncRead + AsyncWrite` pair.

pub mod relay;
pub mod socks5;
