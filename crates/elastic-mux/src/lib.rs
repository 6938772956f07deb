//! Multiplexed link substrate for the elastic SOCKS relay
//!
//! A [`Link`] wraps one persistent byte stream (normally a worker's TCP
//! connection to the dispatcher) and carries two kinds of traffic:
//! link-level control messages, such as worker registration, and any number
//! of named [`Channel`]s, each opened with a tag and an argument list.

pub mod channel;
pub mod error;
pub mod frame;
pub mod link;

pub use channel::{Channel, ChannelEvent};
pub use error::{MuxError, Result};
pub use frame::{ChannelId, Frame, FrameCodec, CHANNEL_WINDOW};
pub use link::{Link, LinkConfig, LinkEvent, LinkEvents, LinkId, LinkRole};
