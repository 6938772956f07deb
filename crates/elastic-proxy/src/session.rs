//! Relay sessions
//!
//! A session is one channel on a worker link carrying one proxied
//! connection. Its lifecycle is tracked by [`SessionState`]; the transition
//! table lives in [`SessionState::next`] and is the only place states change.
//!
//! ```text
//! Created --Accepted--> AwaitingConnect --Connected--> Connected
//! Connected --EndOfStream(side)--> Closing(side) --EndOfStream(other)--> Closed
//! any non-terminal --Failed--> Errored   (Closing(_) --Failed--> Closed)
//! Created | AwaitingConnect --Cancelled--> Closed
//! ```

use crate::error::{ProxyError, Result};
use bytes::{Buf, Bytes};
use elastic_mux::{Channel, ChannelEvent, ChannelId, Link, LinkId, MuxError};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

/// Tag used for proxied TCP sessions.
pub const SOCKS_TAG: &str = "SOCKS";

/// Largest payload put into one data frame by [`Session`]'s writer.
pub const MAX_CHUNK: usize = 64 * 1024;

/// Which end of a session stopped sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// This process
    Local,
    /// The process on the other end of the link
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    AwaitingConnect,
    Connected,
    Closing(Side),
    Closed,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The worker acknowledged the open request
    Accepted,
    /// The worker reached the destination
    Connected,
    /// One side finished sending
    EndOfStream(Side),
    /// Reset, link loss or a local error
    Failed(String),
    /// The requester gave up before the session connected
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }

    /// Next state for `event`, or `None` if the event does not apply here.
    pub fn next(self, event: &SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Closed | S::Errored, _) => None,

            (S::Created, E::Accepted) => Some(S::AwaitingConnect),
            (S::AwaitingConnect, E::Connected) => Some(S::Connected),
            (S::Created | S::AwaitingConnect, E::Cancelled) => Some(S::Closed),

            (S::Connected, E::EndOfStream(side)) => Some(S::Closing(*side)),
            (S::Closing(closed), E::EndOfStream(side)) if *side != closed => Some(S::Closed),

            (S::Closing(_), E::Failed(_)) => Some(S::Closed),
            (_, E::Failed(_)) => Some(S::Errored),

            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::AwaitingConnect => write!(f, "awaiting-connect"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Closing(Side::Local) => write!(f, "closing(local)"),
            SessionState::Closing(Side::Remote) => write!(f, "closing(remote)"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::Errored => write!(f, "errored"),
        }
    }
}

/// One proxied connection carried over a worker link.
///
/// Once established, a session is a byte stream: reads yield the remote
/// side's data and end at its end-of-stream, `shutdown` half-closes the
/// local direction. Dropping a session that has not reached a terminal
/// state resets it on the link.
pub struct Session {
    channel: Channel,
    state: SessionState,
    pending: Bytes,
    released: bool,
    failure: Option<String>,
}

impl Session {
    /// Open a new session on `link` (dispatcher side).
    pub async fn open(link: &Link, tag: &str, args: Vec<Bytes>) -> Result<Self> {
        let channel = link.open_channel(tag, args).await?;
        debug!("Opened session {} on worker {}", channel.id(), link.id());
        Ok(Self::from_channel(channel))
    }

    /// Wrap a channel the remote side opened (worker side).
    pub fn incoming(channel: Channel) -> Self {
        Self::from_channel(channel)
    }

    fn from_channel(channel: Channel) -> Self {
        Self {
            channel,
            state: SessionState::Created,
            pending: Bytes::new(),
            released: false,
            failure: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn link_id(&self) -> LinkId {
        self.channel.link_id()
    }

    pub fn tag(&self) -> &str {
        self.channel.tag()
    }

    pub fn args(&self) -> &[Bytes] {
        self.channel.args()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Reason for the failure that ended the session, if it failed.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Feed `event` through the transition table.
    ///
    /// Returns whether the state changed. Events that do not apply to the
    /// current state are ignored; in particular nothing moves a session out
    /// of a terminal state.
    pub fn apply(&mut self, event: SessionEvent) -> bool {
        let Some(next) = self.state.next(&event) else {
            trace!(
                "Session {} ignored {:?} in state {}",
                self.id(),
                event,
                self.state
            );
            return false;
        };

        trace!("Session {}: {} -> {}", self.id(), self.state, next);
        if let SessionEvent::Failed(reason) = &event {
            self.failure.get_or_insert_with(|| reason.clone());
        }
        self.state = next;
        if next.is_terminal() {
            self.release();
        }
        true
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.pending = Bytes::new();
        match &self.failure {
            Some(reason) => debug!("Session {} errored: {}", self.id(), reason),
            None => debug!("Session {} {}", self.id(), self.state),
        }
    }

    /// Wait until the remote side confirms the session is connected.
    pub async fn wait_connected(&mut self) -> Result<()> {
        loop {
            if self.state == SessionState::Connected {
                return Ok(());
            }
            if self.state.is_terminal() {
                return Err(self.terminal_error());
            }

            match self.channel.next_event().await {
                Some(ChannelEvent::Accepted) => {
                    self.apply(SessionEvent::Accepted);
                }
                Some(ChannelEvent::Connected) => {
                    if !self.apply(SessionEvent::Connected) {
                        return Err(self.protocol_failure("connect before accept"));
                    }
                }
                Some(ChannelEvent::Reset(reason)) => {
                    self.apply(SessionEvent::Failed(reason.clone()));
                    return Err(ProxyError::SessionRejected(reason));
                }
                Some(ChannelEvent::Data(_)) | Some(ChannelEvent::End) => {
                    return Err(self.protocol_failure("stream event before connect"));
                }
                None => {
                    self.apply(SessionEvent::Failed("link lost".to_string()));
                    return Err(ProxyError::LinkLost);
                }
            }
        }
    }

    /// Reset a session whose peer broke the open sequence.
    fn protocol_failure(&mut self, reason: &str) -> ProxyError {
        self.channel.try_reset(reason);
        self.apply(SessionEvent::Failed(reason.to_string()));
        ProxyError::SessionRejected(reason.to_string())
    }

    /// Resolve when the remote side abandons a session that has not yet
    /// connected. Stays pending otherwise.
    pub async fn abandoned(&mut self) {
        loop {
            if self.state.is_terminal() {
                return;
            }
            match self.channel.next_event().await {
                Some(ChannelEvent::Reset(reason)) => {
                    self.apply(SessionEvent::Failed(reason));
                }
                Some(ChannelEvent::End) => {
                    self.apply(SessionEvent::Failed("ended before connect".to_string()));
                }
                None => {
                    self.apply(SessionEvent::Failed("link lost".to_string()));
                }
                Some(event) => {
                    trace!("Session {} ignored {:?} while connecting", self.id(), event);
                }
            }
        }
    }

    /// Acknowledge an incoming session (worker side).
    pub async fn acknowledge(&mut self) -> Result<()> {
        self.ensure(SessionState::Created)?;
        self.channel.accept().await?;
        self.apply(SessionEvent::Accepted);
        Ok(())
    }

    /// Report that the destination is reached (worker side).
    pub async fn confirm_connected(&mut self) -> Result<()> {
        if self.state != SessionState::AwaitingConnect {
            return Err(self.invalid("confirm_connected"));
        }
        self.channel.connect().await?;
        self.apply(SessionEvent::Connected);
        Ok(())
    }

    /// Fail the session and tell the remote side why.
    pub async fn reject(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.state.is_terminal() {
            return;
        }
        if let Err(e) = self.channel.reset(reason.clone()).await {
            trace!("Session {} reset not sent: {}", self.id(), e);
        }
        self.apply(SessionEvent::Failed(reason));
    }

    /// Give up on a session that has not connected yet (dispatcher side).
    pub async fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if let Err(e) = self.channel.reset("cancelled").await {
            trace!("Session {} reset not sent: {}", self.id(), e);
        }
        if !self.apply(SessionEvent::Cancelled) {
            self.apply(SessionEvent::Failed("cancelled".to_string()));
        }
    }

    fn ensure(&self, expected: SessionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid("transition"))
        }
    }

    fn channel_failure(&mut self, err: MuxError) -> io::Error {
        match err {
            MuxError::ChannelClosed => self.io_failure(io::ErrorKind::ConnectionReset, "session reset"),
            _ => self.io_failure(io::ErrorKind::ConnectionAborted, "link lost"),
        }
    }

    fn invalid(&self, op: &str) -> ProxyError {
        ProxyError::InvalidTransition(format!(
            "{} on session {} in state {}",
            op,
            self.id(),
            self.state
        ))
    }

    fn terminal_error(&self) -> ProxyError {
        match &self.failure {
            Some(reason) => ProxyError::SessionRejected(reason.clone()),
            None => ProxyError::SessionRejected(format!("session {}", self.state)),
        }
    }

    fn io_failure(&mut self, kind: io::ErrorKind, reason: &str) -> io::Error {
        self.apply(SessionEvent::Failed(reason.to_string()));
        io::Error::new(kind, format!("session {}: {}", self.id(), reason))
    }

    fn terminal_io_error(&self) -> io::Error {
        let reason = self.failure.as_deref().unwrap_or("session closed");
        io::Error::new(io::ErrorKind::ConnectionReset, reason.to_string())
    }
}

impl AsyncRead for Session {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            match this.state {
                SessionState::Closing(Side::Remote) | SessionState::Closed => {
                    if this.failure.is_none() {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(this.terminal_io_error()));
                }
                SessionState::Errored => return Poll::Ready(Err(this.terminal_io_error())),
                SessionState::Created | SessionState::AwaitingConnect => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "session is not connected",
                    )));
                }
                SessionState::Connected | SessionState::Closing(Side::Local) => {}
            }

            match ready!(this.channel.poll_event(cx)) {
                Some(ChannelEvent::Data(payload)) => this.pending = payload,
                Some(ChannelEvent::End) => {
                    this.apply(SessionEvent::EndOfStream(Side::Remote));
                }
                Some(ChannelEvent::Reset(reason)) => {
                    return Poll::Ready(Err(
                        this.io_failure(io::ErrorKind::ConnectionReset, &reason)
                    ));
                }
                Some(event) => {
                    trace!("Session {} ignored {:?} while reading", this.id(), event);
                }
                None => {
                    return Poll::Ready(Err(
                        this.io_failure(io::ErrorKind::ConnectionAborted, "link lost")
                    ));
                }
            }
        }
    }
}

impl AsyncWrite for Session {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match this.state {
            SessionState::Connected | SessionState::Closing(Side::Remote) => {}
            SessionState::Created | SessionState::AwaitingConnect => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "session is not connected",
                )));
            }
            SessionState::Closing(Side::Local) | SessionState::Closed => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "write after end of session",
                )));
            }
            SessionState::Errored => return Poll::Ready(Err(this.terminal_io_error())),
        }

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if let Err(e) = ready!(this.channel.poll_ready_data(cx)) {
            return Poll::Ready(Err(this.channel_failure(e)));
        }

        let n = data.len().min(MAX_CHUNK);
        if this.channel.start_data(Bytes::copy_from_slice(&data[..n])).is_err() {
            return Poll::Ready(Err(
                this.io_failure(io::ErrorKind::ConnectionAborted, "link lost")
            ));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match this.state {
            SessionState::Connected | SessionState::Closing(Side::Remote) => {}
            SessionState::Closing(Side::Local) | SessionState::Closed => {
                return Poll::Ready(Ok(()));
            }
            SessionState::Errored => return Poll::Ready(Err(this.terminal_io_error())),
            SessionState::Created | SessionState::AwaitingConnect => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "session is not connected",
                )));
            }
        }

        if ready!(this.channel.poll_ready(cx)).is_err() || this.channel.start_end().is_err() {
            return Poll::Ready(Err(
                this.io_failure(io::ErrorKind::ConnectionAborted, "link lost")
            ));
        }
        this.apply(SessionEvent::EndOfStream(Side::Local));
        Poll::Ready(Ok(()))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("link", &self.link_id())
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.channel.try_reset("session dropped");
        self.apply(SessionEvent::Failed("session dropped".to_string()));
    }
}
