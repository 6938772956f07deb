//! SOCKS5 protocol implementation

use super::{unspecified, AddressType, AuthMethod, Command, Reply, Socks5Request};
use crate::error::{ProxyError, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;

/// Read authentication methods from client
pub async fn read_auth_methods<S>(stream: &mut S) -> Result<Vec<AuthMethod>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(ProxyError::socks5(format!(
            "Invalid SOCKS version: {}",
            header[0]
        )));
    }

    let nmethods = header[1] as usize;
    if nmethods == 0 {
        return Err(ProxyError::socks5("No authentication methods provided"));
    }

    let mut methods_buf = vec![0u8; nmethods];
    stream.read_exact(&mut methods_buf).await?;

    let methods: Vec<AuthMethod> = methods_buf
        .iter()
        .filter_map(|&b| AuthMethod::from_byte(b))
        .collect();

    debug!("Client supports auth methods: {:?}", methods);

    Ok(methods)
}

/// Tell the client which authentication method was chosen
pub async fn send_method_selection<S>(stream: &mut S, method: AuthMethod) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS_VERSION, method as u8]).await?;
    stream.flush().await?;
    Ok(())
}

/// Read SOCKS5 request
///
/// Unknown commands and address types are answered with the matching
/// failure reply before the error is returned.
pub async fn read_request<S>(stream: &mut S) -> Result<Socks5Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(ProxyError::socks5(format!(
            "Invalid SOCKS version: {}",
            header[0]
        )));
    }

    let command = match Command::from_byte(header[1]) {
        Some(command) => command,
        None => {
            send_reply(stream, Reply::CommandNotSupported, unspecified()).await?;
            return Err(ProxyError::socks5(format!("Invalid command: {}", header[1])));
        }
    };

    if header[2] != 0x00 {
        return Err(ProxyError::socks5("Reserved field must be 0"));
    }

    let atyp = header[3];

    let address = match atyp {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            AddressType::IPv4(addr)
        }
        0x03 => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            let len = len_buf[0] as usize;
            if len == 0 {
                return Err(ProxyError::socks5("Empty domain name"));
            }

            let mut domain_buf = vec![0u8; len];
            stream.read_exact(&mut domain_buf).await?;

            let domain = String::from_utf8(domain_buf)
                .map_err(|_| ProxyError::socks5("Invalid domain encoding"))?;

            AddressType::Domain(domain)
        }
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            AddressType::IPv6(addr)
        }
        _ => {
            send_reply(stream, Reply::AddressTypeNotSupported, unspecified()).await?;
            return Err(ProxyError::socks5(format!(
                "Invalid address type: {}",
                atyp
            )));
        }
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    Ok(Socks5Request {
        command,
        address,
        port,
    })
}

/// Send SOCKS5 reply
pub async fn send_reply<S>(stream: &mut S, reply: Reply, addr: SocketAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut response = vec![SOCKS_VERSION, reply as u8, 0x00];

    match addr {
        SocketAddr::V4(addr) => {
            response.push(0x01);
            response.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            response.push(0x04);
            response.extend_from_slice(&addr.ip().octets());
        }
    }

    response.extend_from_slice(&addr.port().to_be_bytes());

    stream.write_all(&response).await?;
    stream.flush().await?;

    Ok(())
}
