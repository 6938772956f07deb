//! Elastic SOCKS relay
//!
//! A dispatcher accepts SOCKS5 clients and forwards each request through
//! one of the workers that hold a persistent link to it, falling back to a
//! direct connection when no worker is available. Workers dial out to the
//! dispatcher, so they can sit behind NAT.

pub mod config;
pub mod destination;
pub mod distributor;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod request;
pub mod server;
pub mod session;
pub mod socks5;
pub mod worker;

pub use config::{Config, DispatcherConfig, WorkerConfig};
pub use destination::Destination;
pub use distributor::{Distributor, Outcome, Resolution, Route};
pub use error::{ProxyError, Result};
pub use metrics::RelayMetrics;
pub use registry::{WorkerLink, WorkerRegistry};
pub use relay::{relay, RelayStats};
pub use request::{Handshake, PendingRequest};
pub use server::Dispatcher;
pub use session::{Session, SessionEvent, SessionState, Side};
pub use worker::Worker;

/// Control message a worker sends to make itself selectable.
pub const REGISTER_MESSAGE: &str = "RGST";
