//! Persistent links carrying control messages and multiplexed channels

use crate::channel::{Channel, ChannelEvent};
use crate::error::{MuxError, Result};
use crate::frame::{ChannelId, Frame, FrameCodec, CHANNEL_WINDOW, DEFAULT_MAX_PAYLOAD};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Unique identifier for a link
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct LinkId(Uuid);

impl LinkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which end of the transport connection this link is.
///
/// Connectors allocate odd channel ids and acceptors even ones, so both
/// sides can open channels without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Connector,
    Acceptor,
}

impl LinkRole {
    fn first_channel_id(self) -> ChannelId {
        match self {
            Self::Connector => 1,
            Self::Acceptor => 2,
        }
    }
}

/// Link tuning
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub role: LinkRole,

    /// Close the link when nothing arrives for this long
    pub idle_timeout: Option<Duration>,

    /// Send a ping this often
    pub ping_interval: Option<Duration>,

    /// Link event queue depth (control messages and incoming channels)
    pub event_buffer: usize,

    /// Outgoing frame queue depth
    pub frame_buffer: usize,

    pub max_payload: usize,
}

impl LinkConfig {
    pub fn connector() -> Self {
        Self {
            role: LinkRole::Connector,
            ..Self::acceptor()
        }
    }

    pub fn acceptor() -> Self {
        Self {
            role: LinkRole::Acceptor,
            idle_timeout: None,
            ping_interval: None,
            event_buffer: 64,
            frame_buffer: 256,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }
}

/// What arrives on a link besides channel traffic.
#[derive(Debug)]
pub enum LinkEvent {
    Message { name: String, args: Vec<Bytes> },
    Channel(Channel),
}

/// Incoming control messages and channel open requests.
///
/// Dropping it makes the link reset every further open request.
pub struct LinkEvents {
    rx: mpsc::Receiver<LinkEvent>,
}

impl LinkEvents {
    /// Next event; `None` once the link has closed.
    pub async fn next(&mut self) -> Option<LinkEvent> {
        self.rx.recv().await
    }
}

/// Reset reason sent to a peer that overran a channel's window.
const WINDOW_OVERRUN: &str = "receive window overrun";

/// Per-channel queue depth: a full window of data plus the handful of
/// non-data events a channel can see.
const CHANNEL_QUEUE: usize = CHANNEL_WINDOW as usize + 4;

struct Route {
    events: mpsc::Sender<ChannelEvent>,
    credit: Arc<Semaphore>,
}

pub(crate) struct Shared {
    pub(crate) id: LinkId,
    pub(crate) frames: mpsc::Sender<Frame>,
    routes: DashMap<ChannelId, Route>,
    /// Resets that could not be queued, keyed by channel.
    overruns: DashMap<ChannelId, String>,
    control: mpsc::UnboundedSender<Frame>,
    remote_addr: Option<SocketAddr>,
    next_id: AtomicU32,
    closed: CancellationToken,
}

impl Shared {
    fn allocate_id(&self) -> ChannelId {
        self.next_id.fetch_add(2, Ordering::Relaxed)
    }

    fn register(self: &Arc<Self>, id: ChannelId, tag: String, args: Vec<Bytes>) -> Channel {
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE);
        let credit = Arc::new(Semaphore::new(CHANNEL_WINDOW as usize));
        self.routes.insert(
            id,
            Route {
                events: tx,
                credit: credit.clone(),
            },
        );
        Channel::new(id, tag, args, rx, credit, self.clone())
    }

    pub(crate) fn unregister(&self, id: ChannelId) {
        self.routes.remove(&id);
        self.overruns.remove(&id);
    }

    pub(crate) fn take_overrun(&self, id: ChannelId) -> Option<String> {
        self.overruns.remove(&id).map(|(_, reason)| reason)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Queue a frame ahead of channel data. Never waits.
    pub(crate) fn send_control(&self, frame: Frame) -> bool {
        !self.is_closed() && self.control.send(frame).is_ok()
    }

    fn shutdown(&self) {
        self.closed.cancel();
        for route in self.routes.iter() {
            route.credit.close();
        }
        // Dropping the senders ends every channel's event stream.
        self.routes.clear();
        self.overruns.clear();
    }

    /// Hand `event` to the channel without waiting for queue space.
    fn deliver(&self, channel: ChannelId, event: ChannelEvent) -> bool {
        let sent = self
            .routes
            .get(&channel)
            .map(|route| route.events.try_send(event));

        match sent {
            Some(Ok(())) => true,
            Some(Err(TrySendError::Full(_))) => {
                self.overrun(channel);
                true
            }
            Some(Err(TrySendError::Closed(_))) | None => false,
        }
    }

    fn overrun(&self, channel: ChannelId) {
        warn!("link {} channel {} overran its window, resetting it", self.id, channel);
        if let Some((_, route)) = self.routes.remove(&channel) {
            route.credit.close();
        }
        self.overruns.insert(channel, WINDOW_OVERRUN.to_string());
        self.send_control(Frame::Reset {
            channel,
            reason: WINDOW_OVERRUN.to_string(),
        });
    }

    async fn route(self: &Arc<Self>, frame: Frame, events: &mpsc::Sender<LinkEvent>) -> Result<()> {
        match frame {
            Frame::Message { name, args } => {
                trace!("link {} message {}", self.id, name);
                let _ = events.send(LinkEvent::Message { name, args }).await;
            }
            Frame::Open { channel, tag, args } => {
                if self.routes.contains_key(&channel) {
                    return Err(MuxError::protocol(format!(
                        "channel {} opened twice",
                        channel
                    )));
                }
                debug!("link {} incoming channel {} ({})", self.id, channel, tag);
                let incoming = self.register(channel, tag, args);
                if events.send(LinkEvent::Channel(incoming)).await.is_err() {
                    self.send_control(Frame::Reset {
                        channel,
                        reason: "channels not accepted".to_string(),
                    });
                }
            }
            Frame::Accept { channel } => {
                self.deliver(channel, ChannelEvent::Accepted);
            }
            Frame::Connect { channel } => {
                self.deliver(channel, ChannelEvent::Connected);
            }
            Frame::Data { channel, payload } => {
                if !self.deliver(channel, ChannelEvent::Data(payload)) {
                    trace!("link {} data for unknown channel {}", self.id, channel);
                    self.send_control(Frame::Reset {
                        channel,
                        reason: "unknown channel".to_string(),
                    });
                }
            }
            Frame::End { channel } => {
                self.deliver(channel, ChannelEvent::End);
            }
            Frame::Reset { channel, reason } => {
                if let Some((_, route)) = self.routes.remove(&channel) {
                    route.credit.close();
                    if let Err(TrySendError::Full(ChannelEvent::Reset(reason))) =
                        route.events.try_send(ChannelEvent::Reset(reason))
                    {
                        self.overruns.insert(channel, reason);
                    }
                }
            }
            Frame::Credit { channel, frames } => {
                if let Some(route) = self.routes.get(&channel) {
                    let granted = route.credit.available_permits() as u64 + frames as u64;
                    if granted > CHANNEL_WINDOW as u64 {
                        return Err(MuxError::protocol(format!(
                            "channel {} credited beyond its window",
                            channel
                        )));
                    }
                    route.credit.add_permits(frames as usize);
                }
            }
            Frame::Ping => {
                self.send_control(Frame::Pong);
            }
            Frame::Pong => {}
        }
        Ok(())
    }
}

/// Handle to a running link. Cheap to clone.
#[derive(Clone)]
pub struct Link {
    shared: Arc<Shared>,
}

impl Link {
    /// Start reader and writer tasks over `io`.
    pub fn spawn<T>(io: T, remote_addr: Option<SocketAddr>, config: LinkConfig) -> (Link, LinkEvents)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (frame_tx, frame_rx) = mpsc::channel(config.frame_buffer);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);

        let shared = Arc::new(Shared {
            id: LinkId::new(),
            frames: frame_tx,
            routes: DashMap::new(),
            overruns: DashMap::new(),
            control: control_tx,
            remote_addr,
            next_id: AtomicU32::new(config.role.first_channel_id()),
            closed: CancellationToken::new(),
        });

        debug!("link {} started ({:?}, peer {:?})", shared.id, config.role, remote_addr);

        let writer = FramedWrite::new(write_half, FrameCodec::new(config.max_payload));
        tokio::spawn(write_loop(writer, control_rx, frame_rx, shared.clone()));

        let reader = FramedRead::new(read_half, FrameCodec::new(config.max_payload));
        tokio::spawn(read_loop(reader, shared.clone(), event_tx, config.idle_timeout));

        if let Some(interval) = config.ping_interval {
            tokio::spawn(ping_loop(shared.clone(), interval));
        }

        (Link { shared }, LinkEvents { rx: event_rx })
    }

    pub fn id(&self) -> LinkId {
        self.shared.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }

    /// Number of channels currently routed on this link
    pub fn channel_count(&self) -> usize {
        self.shared.routes.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves once the link is closed.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    pub fn close(&self) {
        self.shared.shutdown();
    }

    /// Send a link-level control message.
    pub async fn send_message(&self, name: &str, args: Vec<Bytes>) -> Result<()> {
        if self.is_closed() {
            return Err(MuxError::LinkClosed);
        }
        self.shared
            .frames
            .send(Frame::Message {
                name: name.to_string(),
                args,
            })
            .await
            .map_err(|_| MuxError::LinkClosed)
    }

    /// Open a channel; the open request is queued before this returns.
    pub async fn open_channel(&self, tag: &str, args: Vec<Bytes>) -> Result<Channel> {
        let id = self.shared.allocate_id();
        let channel = self.shared.register(id, tag.to_string(), args.clone());

        // A shutdown racing with the registration above must not leave a
        // route behind that nobody will ever clear.
        if self.is_closed() {
            return Err(MuxError::LinkClosed);
        }

        self.shared
            .frames
            .send(Frame::Open {
                channel: id,
                tag: tag.to_string(),
                args,
            })
            .await
            .map_err(|_| MuxError::LinkClosed)?;

        debug!("link {} opened channel {} ({})", self.shared.id, id, tag);
        Ok(channel)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.shared.id)
            .field("remote_addr", &self.shared.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn next_frame<R>(
    reader: &mut FramedRead<R, FrameCodec>,
    idle_timeout: Option<Duration>,
) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(idle) => match tokio::time::timeout(idle, reader.next()).await {
            Ok(next) => next.transpose(),
            Err(_) => Err(MuxError::IdleTimeout(idle)),
        },
        None => reader.next().await.transpose(),
    }
}

async fn read_loop<T>(
    mut reader: FramedRead<ReadHalf<T>, FrameCodec>,
    shared: Arc<Shared>,
    events: mpsc::Sender<LinkEvent>,
    idle_timeout: Option<Duration>,
) where
    T: AsyncRead + AsyncWrite,
{
    let result = loop {
        let next = tokio::select! {
            _ = shared.closed.cancelled() => break Ok(()),
            next = next_frame(&mut reader, idle_timeout) => next,
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        // Routing may wait on the link event queue; closing still wins.
        let routed = tokio::select! {
            _ = shared.closed.cancelled() => break Ok(()),
            routed = shared.route(frame, &events) => routed,
        };
        if let Err(e) = routed {
            break Err(e);
        }
    };

    match result {
        Ok(()) => debug!("link {} closed", shared.id),
        Err(e) if e.is_disconnect() => debug!("link {} dropped: {}", shared.id, e),
        Err(e) => warn!("link {} failed: {}", shared.id, e),
    }

    shared.shutdown();
}

async fn write_loop<T>(
    mut writer: FramedWrite<WriteHalf<T>, FrameCodec>,
    mut control: mpsc::UnboundedReceiver<Frame>,
    mut frames: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
) where
    T: AsyncRead + AsyncWrite,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = control.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shared.closed.cancelled() => break,
        };

        if let Err(e) = writer.send(frame).await {
            if !e.is_disconnect() {
                warn!("link {} write failed: {}", shared.id, e);
            }
            break;
        }
    }

    shared.shutdown();
    let _ = writer.get_mut().shutdown().await;
}

async fn ping_loop(shared: Arc<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => break,
            _ = ticker.tick() => {
                if shared.frames.send(Frame::Ping).await.is_err() {
                    break;
                }
            }
        }
    }
}
