//! Error types for the relay

use elastic_mux::{LinkId, MuxError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SOCKS5 error: {0}")]
    Socks5(String),

    #[error("Link error: {0}")]
    Mux(#[from] MuxError),

    #[error("Session rejected by worker: {0}")]
    SessionRejected(String),

    #[error("Worker link lost")]
    LinkLost,

    #[error("Invalid session transition: {0}")]
    InvalidTransition(String),

    #[error("Request already answered")]
    AlreadyAnswered,

    #[error("Worker already registered: {0}")]
    DuplicateWorker(LinkId),

    #[error("Upstream connection failed: {0}")]
    UpstreamConnectionFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn socks5(msg: impl Into<String>) -> Self {
        Self::Socks5(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::UpstreamConnectionFailed(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}

impl From<prometheus::Error> for ProxyError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}
