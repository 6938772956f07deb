//! Named channels multiplexed over a link

use crate::error::{MuxError, Result};
use crate::frame::{ChannelId, Frame, CHANNEL_WINDOW};
use crate::link::{LinkId, Shared};
use bytes::Bytes;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::{PollSemaphore, PollSender};

/// Consumed data frames are credited back to the sender in batches of this size.
const CREDIT_BATCH: u32 = CHANNEL_WINDOW / 2;

/// Something the remote side did to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Accepted,
    Connected,
    Data(Bytes),
    End,
    Reset(String),
}

/// One end of a channel.
///
/// The event stream ends (`None`) when the link is lost. Dropping the
/// channel unregisters it from the link; it does not send anything.
///
/// Sending data spends one credit from the channel's window and waits when
/// none is left, so a receiver that stops reading holds back only its own
/// channel.
pub struct Channel {
    id: ChannelId,
    tag: String,
    args: Vec<Bytes>,
    events: mpsc::Receiver<ChannelEvent>,
    frames: mpsc::Sender<Frame>,
    sink: PollSender<Frame>,
    credit: Arc<Semaphore>,
    poll_credit: PollSemaphore,
    permit: Option<OwnedSemaphorePermit>,
    consumed: u32,
    shared: Arc<Shared>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        tag: String,
        args: Vec<Bytes>,
        events: mpsc::Receiver<ChannelEvent>,
        credit: Arc<Semaphore>,
        shared: Arc<Shared>,
    ) -> Self {
        let frames = shared.frames.clone();
        Self {
            id,
            tag,
            args,
            events,
            sink: PollSender::new(frames.clone()),
            frames,
            poll_credit: PollSemaphore::new(credit.clone()),
            credit,
            permit: None,
            consumed: 0,
            shared,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn link_id(&self) -> LinkId {
        self.shared.id
    }

    /// Wait for the next remote event; `None` once the link is gone.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        let event = self.events.recv().await;
        self.observe(event)
    }

    pub fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<ChannelEvent>> {
        let event = ready!(self.events.poll_recv(cx));
        Poll::Ready(self.observe(event))
    }

    fn observe(&mut self, event: Option<ChannelEvent>) -> Option<ChannelEvent> {
        match event {
            Some(ChannelEvent::Data(payload)) => {
                self.consumed += 1;
                if self.consumed >= CREDIT_BATCH {
                    self.shared.send_control(Frame::Credit {
                        channel: self.id,
                        frames: self.consumed,
                    });
                    self.consumed = 0;
                }
                Some(ChannelEvent::Data(payload))
            }
            Some(event) => Some(event),
            // A reset that did not fit the queue is reported once the queue drains.
            None => self.shared.take_overrun(self.id).map(ChannelEvent::Reset),
        }
    }

    /// Acknowledge an incoming open request.
    pub async fn accept(&self) -> Result<()> {
        self.send(Frame::Accept { channel: self.id }).await
    }

    /// Tell the opener that data may flow.
    pub async fn connect(&self) -> Result<()> {
        self.send(Frame::Connect { channel: self.id }).await
    }

    pub async fn data(&self, payload: Bytes) -> Result<()> {
        let permit = self.credit.acquire().await.map_err(|_| self.closed_error())?;
        permit.forget();
        self.send(Frame::Data {
            channel: self.id,
            payload,
        })
        .await
    }

    pub async fn end(&self) -> Result<()> {
        self.send(Frame::End { channel: self.id }).await
    }

    pub async fn reset(&self, reason: impl Into<String>) -> Result<()> {
        self.send(Frame::Reset {
            channel: self.id,
            reason: reason.into(),
        })
        .await
    }

    /// Reset without waiting for queue space. Used from `Drop` paths.
    pub fn try_reset(&self, reason: impl Into<String>) -> bool {
        let frame = Frame::Reset {
            channel: self.id,
            reason: reason.into(),
        };
        // Stay behind frames already queued for this channel when there is room.
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => self.shared.send_control(frame),
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Reserve queue space for one outgoing control frame.
    pub fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.sink.poll_reserve(cx).map_err(|_| MuxError::LinkClosed)
    }

    /// Reserve one credit and queue space for an outgoing data frame.
    pub fn poll_ready_data(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.permit.is_none() {
            match ready!(self.poll_credit.poll_acquire(cx)) {
                Some(permit) => self.permit = Some(permit),
                None => return Poll::Ready(Err(self.closed_error())),
            }
        }
        self.poll_ready(cx)
    }

    /// Queue a data frame into the slot reserved by [`Channel::poll_ready_data`].
    pub fn start_data(&mut self, payload: Bytes) -> Result<()> {
        let permit = self
            .permit
            .take()
            .ok_or_else(|| MuxError::protocol("data sent without credit"))?;
        permit.forget();
        let frame = Frame::Data {
            channel: self.id,
            payload,
        };
        self.sink.send_item(frame).map_err(|_| MuxError::LinkClosed)
    }

    /// Queue an end frame into the slot reserved by [`Channel::poll_ready`].
    pub fn start_end(&mut self) -> Result<()> {
        let frame = Frame::End { channel: self.id };
        self.sink.send_item(frame).map_err(|_| MuxError::LinkClosed)
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        self.frames.send(frame).await.map_err(|_| MuxError::LinkClosed)
    }

    fn closed_error(&self) -> MuxError {
        if self.shared.is_closed() {
            MuxError::LinkClosed
        } else {
            MuxError::ChannelClosed
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("link", &self.shared.id)
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shared.unregister(self.id);
    }
}
