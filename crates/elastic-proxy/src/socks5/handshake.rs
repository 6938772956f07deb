//! SOCKS5 negotiation up to the routing decision

use super::protocol;
use super::{unspecified, AuthMethod, Reply};
use crate::destination::Destination;
use crate::error::{ProxyError, Result};
use crate::request::{Handshake, PendingRequest};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use pin_project::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

/// Bytes buffered from a client that starts sending before its reply.
const EARLY_DATA_LIMIT: usize = 64 * 1024;

/// Run method selection and read the request, leaving the reply pending.
pub async fn negotiate<S>(mut stream: S) -> Result<PendingRequest<SocksHandshake<S>>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let methods = protocol::read_auth_methods(&mut stream).await?;
    if !methods.contains(&AuthMethod::NoAuth) {
        protocol::send_method_selection(&mut stream, AuthMethod::NoAcceptable).await?;
        return Err(ProxyError::socks5("No acceptable authentication method"));
    }
    protocol::send_method_selection(&mut stream, AuthMethod::NoAuth).await?;

    let request = protocol::read_request(&mut stream).await?;
    let destination = Destination::new(request.address.host(), request.port, request.command);
    debug!("SOCKS5 {} request to {}", destination.command, destination);

    Ok(PendingRequest::new(destination, SocksHandshake::new(stream)))
}

/// Client stream between request and reply.
pub struct SocksHandshake<S> {
    stream: S,
    early: BytesMut,
    eof: bool,
}

impl<S> SocksHandshake<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            early: BytesMut::new(),
            eof: false,
        }
    }
}

#[async_trait]
impl<S> Handshake for SocksHandshake<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = PrefixedStream<S>;

    async fn accept(mut self, bound: SocketAddr) -> Result<Self::Stream> {
        protocol::send_reply(&mut self.stream, Reply::Success, bound).await?;
        Ok(PrefixedStream::new(self.early.freeze(), self.stream))
    }

    async fn deny(mut self, reply: Reply) -> Result<()> {
        protocol::send_reply(&mut self.stream, reply, unspecified()).await?;
        let _ = self.stream.shutdown().await;
        Ok(())
    }

    async fn client_closed(&mut self) {
        while !self.eof {
            if self.early.len() >= EARLY_DATA_LIMIT {
                // Stop reading; the client gets the reply eventually.
                std::future::pending::<()>().await;
            }
            self.early.reserve(4096);
            match self.stream.read_buf(&mut self.early).await {
                Ok(0) | Err(_) => self.eof = true,
                Ok(_) => {}
            }
        }
    }
}

/// A stream that first replays bytes read ahead of time.
#[pin_project]
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Bytes,
    #[pin]
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks5::Command;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    async fn start(client: &mut tokio::io::DuplexStream) {
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 10, 1, 2, 3];
        request.extend_from_slice(&8080u16.to_be_bytes());
        client.write_all(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_negotiate_leaves_reply_pending() {
        let (server, mut client) = duplex(1024);
        let (negotiated, _) = tokio::join!(negotiate(server), start(&mut client));
        let mut request = negotiated.unwrap();

        assert_eq!(
            request.destination(),
            &Destination::new("10.1.2.3", 8080, Command::Connect)
        );

        // Nothing was answered yet.
        let mut buf = [0u8; 1];
        assert!(timeout(Duration::from_millis(20), client.read(&mut buf))
            .await
            .is_err());

        request.deny(Reply::ConnectionRefused).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::ConnectionRefused as u8);
    }

    #[tokio::test]
    async fn test_auth_only_clients_are_refused() {
        let (server, mut client) = duplex(1024);
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        assert!(negotiate(server).await.is_err());
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_early_data_is_replayed_after_accept() {
        let (server, mut client) = duplex(1024);
        let (negotiated, _) = tokio::join!(negotiate(server), start(&mut client));
        let mut request = negotiated.unwrap();

        client.write_all(b"early").await.unwrap();
        assert!(timeout(Duration::from_millis(50), request.client_closed())
            .await
            .is_err());

        let mut stream = request.accept(unspecified()).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::Success as u8);

        client.write_all(b" late").await.unwrap();
        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early late");
    }

    #[tokio::test]
    async fn test_client_close_is_detected() {
        let (server, mut client) = duplex(1024);
        let (negotiated, _) = tokio::join!(negotiate(server), start(&mut client));
        let mut request = negotiated.unwrap();

        drop(client);
        timeout(Duration::from_secs(5), request.client_closed())
            .await
            .unwrap();
    }
}
