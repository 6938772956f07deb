//! Pending proxy requests
//!
//! A request is parsed from the client but not yet answered. Whoever routes
//! it decides between [`PendingRequest::accept`] and
//! [`PendingRequest::deny`]; exactly one answer is ever sent.

use crate::destination::Destination;
use crate::error::{ProxyError, Result};
use crate::socks5::Reply;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Client-protocol side of a pending request.
#[async_trait]
pub trait Handshake: Send {
    /// Byte stream handed to the relay once the request is accepted
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Send the success reply and hand over the client stream.
    async fn accept(self, bound: SocketAddr) -> Result<Self::Stream>;

    /// Send a failure reply and close the client.
    async fn deny(self, reply: Reply) -> Result<()>;

    /// Resolve once the client has gone away. Never resolves while the
    /// client is still connected.
    async fn client_closed(&mut self);
}

/// A parsed request waiting for a routing decision.
#[derive(Debug)]
pub struct PendingRequest<H> {
    destination: Destination,
    handshake: Option<H>,
}

impl<H: Handshake> PendingRequest<H> {
    pub fn new(destination: Destination, handshake: H) -> Self {
        Self {
            destination,
            handshake: Some(handshake),
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn is_answered(&self) -> bool {
        self.handshake.is_none()
    }

    pub async fn accept(&mut self, bound: SocketAddr) -> Result<H::Stream> {
        let handshake = self.handshake.take().ok_or(ProxyError::AlreadyAnswered)?;
        handshake.accept(bound).await
    }

    pub async fn deny(&mut self, reply: Reply) -> Result<()> {
        let handshake = self.handshake.take().ok_or(ProxyError::AlreadyAnswered)?;
        handshake.deny(reply).await
    }

    /// Resolve once the client disconnects before an answer was sent.
    pub async fn client_closed(&mut self) {
        match self.handshake.as_mut() {
            Some(handshake) => handshake.client_closed().await,
            None => std::future::pending().await,
        }
    }
}
