//! Proxy destinations and how they travel in session arguments

use crate::error::{ProxyError, Result};
use crate::socks5::Command;
use bytes::Bytes;
use std::fmt;
use std::io;
use tokio::net::TcpStream;

/// Where a client wants to go, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub command: Command,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16, command: Command) -> Self {
        Self {
            host: host.into(),
            port,
            command,
        }
    }

    /// Encode as session open arguments: host, decimal port, command name.
    pub fn to_session_args(&self) -> Vec<Bytes> {
        vec![
            Bytes::from(self.host.clone()),
            Bytes::from(self.port.to_string()),
            Bytes::from_static(self.command.as_str().as_bytes()),
        ]
    }

    pub fn from_session_args(args: &[Bytes]) -> Result<Self> {
        let [host, port, command] = args else {
            return Err(ProxyError::invalid_request(format!(
                "expected 3 session arguments, got {}",
                args.len()
            )));
        };

        let host = text(host, "host")?;
        if host.is_empty() {
            return Err(ProxyError::invalid_request("empty host"));
        }
        let port = text(port, "port")?
            .parse::<u16>()
            .map_err(|e| ProxyError::invalid_request(format!("invalid port: {}", e)))?;
        let command = text(command, "command")?
            .parse::<Command>()
            .map_err(ProxyError::invalid_request)?;

        Ok(Self::new(host, port, command))
    }

    /// Open a TCP connection to the destination.
    pub async fn dial(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

fn text<'a>(arg: &'a Bytes, what: &str) -> Result<&'a str> {
    std::str::from_utf8(arg)
        .map_err(|_| ProxyError::invalid_request(format!("{} is not UTF-8", what)))
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
