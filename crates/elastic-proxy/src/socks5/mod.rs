//! SOCKS5 front end
//!
//! Only the no-authentication method is offered. The handshake stops after
//! the request has been read: the reply is sent later, through
//! [`crate::request::PendingRequest`], once the request is routed.

mod handshake;
mod protocol;

pub use handshake::{negotiate, PrefixedStream, SocksHandshake};
pub use protocol::{read_auth_methods, read_request, send_method_selection, send_reply};

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// Bound address sent when there is no meaningful one.
pub(crate) fn unspecified() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

/// SOCKS5 authentication methods
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    GssApi = 0x01,
    UserPass = 0x02,
    NoAcceptable = 0xFF,
}

impl AuthMethod {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::NoAuth),
            0x01 => Some(Self::GssApi),
            0x02 => Some(Self::UserPass),
            0xFF => Some(Self::NoAcceptable),
            _ => None,
        }
    }
}

/// SOCKS5 command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl Command {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Connect),
            0x02 => Some(Self::Bind),
            0x03 => Some(Self::UdpAssociate),
            _ => None,
        }
    }

    /// Name used in session arguments
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Bind => "BIND",
            Command::UdpAssociate => "UDP_ASSOCIATE",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" => Ok(Command::Connect),
            "BIND" => Ok(Command::Bind),
            "UDP_ASSOCIATE" => Ok(Command::UdpAssociate),
            other => Err(format!("unknown command: {}", other)),
        }
    }
}

/// SOCKS5 address type
#[derive(Debug, Clone, PartialEq)]
pub enum AddressType {
    IPv4([u8; 4]),
    Domain(String),
    IPv6([u8; 16]),
}

impl AddressType {
    /// Host part as text: dotted quad, IPv6 literal or domain name
    pub fn host(&self) -> String {
        match self {
            AddressType::IPv4(octets) => Ipv4Addr::from(*octets).to_string(),
            AddressType::IPv6(octets) => Ipv6Addr::from(*octets).to_string(),
            AddressType::Domain(domain) => domain.clone(),
        }
    }
}

/// SOCKS5 reply code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Success = 0x00,
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
    /// Reply reported to the client when dialing the destination failed.
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            io::ErrorKind::TimedOut => Reply::TtlExpired,
            io::ErrorKind::PermissionDenied => Reply::ConnectionNotAllowed,
            io::ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
            io::ErrorKind::HostUnreachable
            | io::ErrorKind::NotFound
            | io::ErrorKind::AddrNotAvailable => Reply::HostUnreachable,
            _ => Reply::GeneralFailure,
        }
    }

    /// Label used in metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::Success => "success",
            Reply::GeneralFailure => "general_failure",
            Reply::ConnectionNotAllowed => "not_allowed",
            Reply::NetworkUnreachable => "network_unreachable",
            Reply::HostUnreachable => "host_unreachable",
            Reply::ConnectionRefused => "connection_refused",
            Reply::TtlExpired => "ttl_expired",
            Reply::CommandNotSupported => "command_not_supported",
            Reply::AddressTypeNotSupported => "address_type_not_supported",
        }
    }
}

/// SOCKS5 request
#[derive(Debug)]
pub struct Socks5Request {
    pub command: Command,
    pub address: AddressType,
    pub port: u16,
}
