//! Error types for the mux substrate

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MuxError>;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame payload of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("Link closed")]
    LinkClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Link idle for {0:?}")]
    IdleTimeout(Duration),
}

impl MuxError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether the error means the peer simply went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::LinkClosed => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
