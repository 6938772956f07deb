//! Link frame format and codec.
//!
//! Every frame has a 9-byte header: kind(1) + channel(4) + payload_len(4),
//! followed by the payload. Control frames (`Message`, `Ping`, `Pong`) use
//! channel 0.
//!
//! Data frames are flow controlled per channel: a sender starts with
//! [`CHANNEL_WINDOW`] credits, spends one per `Data` frame, and gets them
//! back through `Credit` frames as the receiver consumes its queue.

use crate::error::{MuxError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Channel identifier, unique within one link.
pub type ChannelId = u32;

/// Frame header size.
pub const HEADER_LEN: usize = 9;

/// Default upper bound for a single frame payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Data frames a channel may have in flight before the receiver grants more.
pub const CHANNEL_WINDOW: u32 = 64;

const KIND_MESSAGE: u8 = 0x01;
const KIND_OPEN: u8 = 0x02;
const KIND_ACCEPT: u8 = 0x03;
const KIND_CONNECT: u8 = 0x04;
const KIND_DATA: u8 = 0x05;
const KIND_END: u8 = 0x06;
const KIND_RESET: u8 = 0x07;
const KIND_PING: u8 = 0x08;
const KIND_PONG: u8 = 0x09;
const KIND_CREDIT: u8 = 0x0a;

/// A single unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Link-level control message, e.g. worker registration.
    Message { name: String, args: Vec<Bytes> },
    /// Request to open a named channel.
    Open {
        channel: ChannelId,
        tag: String,
        args: Vec<Bytes>,
    },
    /// The remote side took the open request and is working on it.
    Accept { channel: ChannelId },
    /// The remote side is ready; data may flow.
    Connect { channel: ChannelId },
    Data { channel: ChannelId, payload: Bytes },
    /// Graceful end of stream in the sender's direction.
    End { channel: ChannelId },
    /// Abrupt teardown of the channel.
    Reset { channel: ChannelId, reason: String },
    /// The receiver consumed `frames` data frames; the sender may send as
    /// many more.
    Credit { channel: ChannelId, frames: u32 },
    Ping,
    Pong,
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Self::Message { .. } => KIND_MESSAGE,
            Self::Open { .. } => KIND_OPEN,
            Self::Accept { .. } => KIND_ACCEPT,
            Self::Connect { .. } => KIND_CONNECT,
            Self::Data { .. } => KIND_DATA,
            Self::End { .. } => KIND_END,
            Self::Reset { .. } => KIND_RESET,
            Self::Credit { .. } => KIND_CREDIT,
            Self::Ping => KIND_PING,
            Self::Pong => KIND_PONG,
        }
    }

    /// Channel the frame belongs to, 0 for link-level frames.
    pub fn channel(&self) -> ChannelId {
        match self {
            Self::Open { channel, .. }
            | Self::Accept { channel }
            | Self::Connect { channel }
            | Self::Data { channel, .. }
            | Self::End { channel }
            | Self::Reset { channel, .. }
            | Self::Credit { channel, .. } => *channel,
            Self::Message { .. } | Self::Ping | Self::Pong => 0,
        }
    }

    fn into_payload(self) -> Result<Bytes> {
        match self {
            Self::Message { name, args } => {
                let mut buf = BytesMut::new();
                put_name(&mut buf, &name)?;
                put_args(&mut buf, &args)?;
                Ok(buf.freeze())
            }
            Self::Open { tag, args, .. } => {
                let mut buf = BytesMut::new();
                put_name(&mut buf, &tag)?;
                put_args(&mut buf, &args)?;
                Ok(buf.freeze())
            }
            Self::Data { payload, .. } => Ok(payload),
            Self::Reset { reason, .. } => Ok(Bytes::from(reason.into_bytes())),
            Self::Credit { frames, .. } => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(frames);
                Ok(buf.freeze())
            }
            Self::Accept { .. } | Self::Connect { .. } | Self::End { .. } | Self::Ping | Self::Pong => {
                Ok(Bytes::new())
            }
        }
    }

    fn from_parts(kind: u8, channel: ChannelId, mut payload: Bytes) -> Result<Self> {
        let frame = match kind {
            KIND_MESSAGE => {
                let name = get_name(&mut payload)?;
                let args = get_args(&mut payload)?;
                Self::Message { name, args }
            }
            KIND_OPEN => {
                let tag = get_name(&mut payload)?;
                let args = get_args(&mut payload)?;
                Self::Open { channel, tag, args }
            }
            KIND_ACCEPT => Self::Accept { channel },
            KIND_CONNECT => Self::Connect { channel },
            KIND_DATA => Self::Data { channel, payload },
            KIND_END => Self::End { channel },
            KIND_RESET => Self::Reset {
                channel,
                reason: String::from_utf8_lossy(&payload).into_owned(),
            },
            KIND_CREDIT => {
                if payload.remaining() < 4 {
                    return Err(MuxError::protocol("credit truncated"));
                }
                Self::Credit {
                    channel,
                    frames: payload.get_u32(),
                }
            }
            KIND_PING => Self::Ping,
            KIND_PONG => Self::Pong,
            other => {
                return Err(MuxError::protocol(format!(
                    "unknown frame kind: 0x{:02x}",
                    other
                )))
            }
        };
        Ok(frame)
    }
}

fn put_name(buf: &mut BytesMut, name: &str) -> Result<()> {
    let len = u8::try_from(name.len())
        .map_err(|_| MuxError::protocol(format!("name too long: {} bytes", name.len())))?;
    buf.put_u8(len);
    buf.extend_from_slice(name.as_bytes());
    Ok(())
}

fn put_args(buf: &mut BytesMut, args: &[Bytes]) -> Result<()> {
    let count = u16::try_from(args.len())
        .map_err(|_| MuxError::protocol(format!("too many arguments: {}", args.len())))?;
    buf.put_u16(count);
    for arg in args {
        let len = u16::try_from(arg.len())
            .map_err(|_| MuxError::protocol(format!("argument too long: {} bytes", arg.len())))?;
        buf.put_u16(len);
        buf.extend_from_slice(arg);
    }
    Ok(())
}

fn get_name(payload: &mut Bytes) -> Result<String> {
    if payload.remaining() < 1 {
        return Err(MuxError::protocol("missing name length"));
    }
    let len = payload.get_u8() as usize;
    if payload.remaining() < len {
        return Err(MuxError::protocol("name truncated"));
    }
    let raw = payload.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| MuxError::protocol("name is not valid UTF-8"))
}

fn get_args(payload: &mut Bytes) -> Result<Vec<Bytes>> {
    if payload.remaining() < 2 {
        return Err(MuxError::protocol("missing argument count"));
    }
    let count = payload.get_u16() as usize;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        if payload.remaining() < 2 {
            return Err(MuxError::protocol("missing argument length"));
        }
        let len = payload.get_u16() as usize;
        if payload.remaining() < len {
            return Err(MuxError::protocol("argument truncated"));
        }
        args.push(payload.split_to(len));
    }
    Ok(args)
}

/// `tokio_util` codec for [`Frame`]s.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = src[0];
        let channel = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        let len = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;

        if len > self.max_payload {
            return Err(MuxError::FrameTooLarge(len));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Frame::from_parts(kind, channel, payload).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let kind = frame.kind();
        let channel = frame.channel();
        let payload = frame.into_payload()?;

        if payload.len() > self.max_payload {
            return Err(MuxError::FrameTooLarge(payload.len()));
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(kind);
        dst.put_u32(channel);
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
