//! SOCKS5 wire codec (RFC 1928).
//!
//! Pure functions over byte buffers. Every decoder returns the parsed message
//! together with the number of bytes it consumed, or an error. A
//! [`Error::Truncated`] result means the buffer holds a valid prefix and more
//! input may complete it; every other error is final.
//!
//! ```text
//! greeting   +----+----------+----------+
//!            |VER | NMETHODS | METHODS  |
//!            +----+----------+----------+
//! request    +----+-----+-------+------+----------+----------+
//!            |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
//!            +----+-----+-------+------+----------+----------+
//! reply      +----+-----+-------+------+----------+----------+
//!            |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
//!            +----+-----+-------+------+----------+----------+
//! ```

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Protocol version byte.
pub const SOCKS_VERSION: u8 = 0x05;

/// "No authentication required" method code.
pub const METHOD_NO_AUTH: u8 = 0x00;
/// "No acceptable methods" marker in the selection response.
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// IPv4 address type tag.
pub const ATYP_IPV4: u8 = 0x01;
/// Domain name address type tag.
pub const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type tag.
pub const ATYP_IPV6: u8 = 0x04;

/// Longest domain name the one-byte length prefix can describe.
pub const MAX_DOMAIN_LEN: usize = 255;

/// VER + CMD/REP + RSV + ATYP
const HEADER_LEN: usize = 4;

fn ensure_len(data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(Error::Truncated {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn check_version(version: u8) -> Result<()> {
    if version != SOCKS_VERSION {
        return Err(Error::VersionMismatch {
            expected: SOCKS_VERSION,
            actual: version,
        });
    }
    Ok(())
}

/// Client greeting: the authentication methods it supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSelection {
    /// Method codes in the order the client sent them.
    pub methods: Vec<u8>,
}

impl MethodSelection {
    /// Create a greeting offering the given methods.
    pub fn new(methods: impl Into<Vec<u8>>) -> Self {
        Self {
            methods: methods.into(),
        }
    }

    /// Whether the client offered "no authentication".
    pub fn offers_no_auth(&self) -> bool {
        self.methods.contains(&METHOD_NO_AUTH)
    }

    /// Encode the greeting.
    pub fn encode(&self) -> Result<Bytes> {
        let count = u8::try_from(self.methods.len())
            .map_err(|_| Error::invalid(format!("{} methods offered", self.methods.len())))?;
        let mut buf = BytesMut::with_capacity(2 + self.methods.len());
        buf.put_u8(SOCKS_VERSION);
        buf.put_u8(count);
        buf.put_slice(&self.methods);
        Ok(buf.freeze())
    }

    /// Decode a greeting from the front of `data`.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        ensure_len(data, 2)?;
        check_version(data[0])?;

        let count = data[1] as usize;
        ensure_len(data, 2 + count)?;

        let methods = data[2..2 + count].to_vec();
        Ok((Self { methods }, 2 + count))
    }
}

/// Server's method choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodResponse {
    /// Chosen method, or [`METHOD_NO_ACCEPTABLE`].
    pub method: u8,
}

impl MethodResponse {
    /// Response selecting "no authentication".
    pub fn no_auth() -> Self {
        Self {
            method: METHOD_NO_AUTH,
        }
    }

    /// Response rejecting every offered method.
    pub fn no_acceptable() -> Self {
        Self {
            method: METHOD_NO_ACCEPTABLE,
        }
    }

    /// Response answering `greeting`.
    pub fn for_greeting(greeting: &MethodSelection) -> Self {
        if greeting.offers_no_auth() {
            Self::no_auth()
        } else {
            Self::no_acceptable()
        }
    }

    /// Whether the client may proceed to the request phase.
    pub fn is_accepted(&self) -> bool {
        self.method != METHOD_NO_ACCEPTABLE
    }

    /// Encode the response.
    pub fn encode(&self) -> [u8; 2] {
        [SOCKS_VERSION, self.method]
    }

    /// Decode a response from the front of `data`.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        ensure_len(data, 2)?;
        check_version(data[0])?;
        Ok((Self { method: data[1] }, 2))
    }
}

/// Request command.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Open a TCP connection to the destination.
    Connect = 0x01,
    /// Listen for an inbound connection.
    Bind = 0x02,
    /// Relay UDP datagrams.
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::Connect),
            0x02 => Ok(Self::Bind),
            0x03 => Ok(Self::UdpAssociate),
            _ => Err(Error::UnknownCommand(v)),
        }
    }
}

/// Destination or bound address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Raw IPv4 address.
    Ipv4(Ipv4Addr),
    /// Domain name, resolved by the proxy.
    Domain(String),
    /// Raw IPv6 address.
    Ipv6(Ipv6Addr),
}

impl Address {
    /// The unspecified IPv4 address, reported as the bound address.
    pub const UNSPECIFIED: Address = Address::Ipv4(Ipv4Addr::UNSPECIFIED);

    /// Address type tag.
    pub fn atyp(&self) -> u8 {
        match self {
            Address::Ipv4(_) => ATYP_IPV4,
            Address::Domain(_) => ATYP_DOMAIN,
            Address::Ipv6(_) => ATYP_IPV6,
        }
    }

    /// Encoded length of the address field, excluding the type tag.
    pub fn encoded_len(&self) -> usize {
        match self {
            Address::Ipv4(_) => 4,
            Address::Domain(name) => 1 + name.len(),
            Address::Ipv6(_) => 16,
        }
    }

    /// Host string as the destination is displayed and dialed.
    ///
    /// IPv4 is dotted decimal, IPv6 is eight colon-separated hex groups.
    pub fn host(&self) -> String {
        self.to_string()
    }

    /// Write `ATYP` followed by the address field.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.atyp());
        match self {
            Address::Ipv4(ip) => buf.put_slice(&ip.octets()),
            Address::Domain(name) => {
                if name.len() > MAX_DOMAIN_LEN {
                    return Err(Error::invalid(format!(
                        "domain name is {} bytes, limit is {}",
                        name.len(),
                        MAX_DOMAIN_LEN
                    )));
                }
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
            Address::Ipv6(ip) => buf.put_slice(&ip.octets()),
        }
        Ok(())
    }

    /// Decode `ATYP` followed by the address field.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        ensure_len(data, 1)?;

        match data[0] {
            ATYP_IPV4 => {
                ensure_len(data, 5)?;
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                Ok((Address::Ipv4(ip), 5))
            }
            ATYP_DOMAIN => {
                ensure_len(data, 2)?;
                let len = data[1] as usize;
                ensure_len(data, 2 + len)?;
                let name = std::str::from_utf8(&data[2..2 + len])
                    .map_err(|_| Error::invalid("domain name is not valid UTF-8"))?;
                Ok((Address::Domain(name.to_string()), 2 + len))
            }
            ATYP_IPV6 => {
                ensure_len(data, 17)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                Ok((Address::Ipv6(Ipv6Addr::from(octets)), 17))
            }
            atyp => Err(Error::UnsupportedAddressType(atyp)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{}", ip),
            Address::Domain(name) => f.write_str(name),
            Address::Ipv6(ip) => {
                let s = ip.segments();
                write!(
                    f,
                    "{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}",
                    s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]
                )
            }
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::Ipv4(*v4.ip()),
            SocketAddr::V6(v6) => Address::Ipv6(*v6.ip()),
        }
    }
}

fn decode_port(data: &[u8], offset: usize) -> Result<u16> {
    ensure_len(data, offset + 2)?;
    Ok(u16::from_be_bytes([data[offset], data[offset + 1]]))
}

/// Client's connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub command: Command,
    pub address: Address,
    pub port: u16,
}

impl ConnectRequest {
    /// A CONNECT request for `address:port`.
    pub fn connect(address: Address, port: u16) -> Self {
        Self {
            command: Command::Connect,
            address,
            port,
        }
    }

    /// Encode the request.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.address.encoded_len() + 2);
        buf.put_u8(SOCKS_VERSION);
        buf.put_u8(self.command as u8);
        buf.put_u8(0x00);
        self.address.write_to(&mut buf)?;
        buf.put_u16(self.port);
        Ok(buf.freeze())
    }

    /// Decode a request from the front of `data`.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        ensure_len(data, HEADER_LEN)?;
        check_version(data[0])?;
        let command = Command::try_from(data[1])?;

        let (address, addr_len) = Address::decode(&data[3..])?;
        let port_at = 3 + addr_len;
        let port = decode_port(data, port_at)?;

        Ok((
            Self {
                command,
                address,
                port,
            },
            port_at + 2,
        ))
    }
}

/// Reply codes of the connect response.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Every defined reply code.
    pub const ALL: [Reply; 9] = [
        Reply::Succeeded,
        Reply::GeneralFailure,
        Reply::ConnectionNotAllowed,
        Reply::NetworkUnreachable,
        Reply::HostUnreachable,
        Reply::ConnectionRefused,
        Reply::TtlExpired,
        Reply::CommandNotSupported,
        Reply::AddressTypeNotSupported,
    ];

    /// Nearest reply code for a failed dial.
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            io::ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
            io::ErrorKind::HostUnreachable => Reply::HostUnreachable,
            io::ErrorKind::TimedOut => Reply::TtlExpired,
            _ => Reply::GeneralFailure,
        }
    }
}

impl TryFrom<u8> for Reply {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        Reply::ALL
            .into_iter()
            .find(|reply| *reply as u8 == v)
            .ok_or_else(|| Error::invalid(format!("unknown reply code: 0x{:02x}", v)))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Reply::Succeeded => "succeeded",
            Reply::GeneralFailure => "general SOCKS server failure",
            Reply::ConnectionNotAllowed => "connection not allowed by ruleset",
            Reply::NetworkUnreachable => "network unreachable",
            Reply::HostUnreachable => "host unreachable",
            Reply::ConnectionRefused => "connection refused",
            Reply::TtlExpired => "TTL expired",
            Reply::CommandNotSupported => "command not supported",
            Reply::AddressTypeNotSupported => "address type not supported",
        };
        f.write_str(text)
    }
}

/// Server's answer to a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub reply: Reply,
    pub address: Address,
    pub port: u16,
}

impl ConnectReply {
    /// Create a reply reporting `address:port` as the bound address.
    pub fn new(reply: Reply, address: Address, port: u16) -> Self {
        Self {
            reply,
            address,
            port,
        }
    }

    /// Reply with the bound address reported as `0.0.0.0:0`.
    pub fn unspecified(reply: Reply) -> Self {
        Self::new(reply, Address::UNSPECIFIED, 0)
    }

    /// Encode the reply.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.address.encoded_len() + 2);
        buf.put_u8(SOCKS_VERSION);
        buf.put_u8(self.reply as u8);
        buf.put_u8(0x00);
        self.address.write_to(&mut buf)?;
        buf.put_u16(self.port);
        Ok(buf.freeze())
    }

    /// Decode a reply from the front of `data`.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        ensure_len(data, HEADER_LEN)?;
        check_version(data[0])?;
        let reply = Reply::try_from(data[1])?;

        let (address, addr_len) = Address::decode(&data[3..])?;
        let port_at = 3 + addr_len;
        let port = decode_port(data, port_at)?;

        Ok((
            Self {
                reply,
                address,
                port,
            },
            port_at + 2,
        ))
    }
}
