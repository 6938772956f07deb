//! Worker role
//!
//! A worker keeps one link open to a dispatcher, registers itself, and
//! serves the sessions the dispatcher opens on that link by dialing the
//! requested destinations.

use crate::config::{ServerAddress, WorkerConfig};
use crate::destination::Destination;
use crate::error::{ProxyError, Result};
use crate::relay::relay;
use crate::session::{Session, SOCKS_TAG};
use crate::socks5::Command;
use crate::REGISTER_MESSAGE;
use elastic_mux::{Channel, Link, LinkConfig, LinkEvent};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Worker {
    config: WorkerConfig,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run until `shutdown` fires, reconnecting whenever the link drops.
    ///
    /// Fails only when `max_reconnect_attempts` consecutive connects fail.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let servers = &self.config.servers;
        let mut attempt = 0usize;
        let mut failures = 0u32;

        loop {
            let server = &servers[attempt % servers.len()];
            attempt = attempt.wrapping_add(1);

            let connected = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                result = TcpStream::connect((server.host.as_str(), server.port)) => result,
            };

            match connected {
                Ok(stream) => {
                    failures = 0;
                    info!("Connected to dispatcher {}", server);
                    self.serve_link(stream, server, &shutdown).await;
                    if shutdown.is_cancelled() {
                        return Ok(());
                    }
                    warn!("Lost connection to dispatcher {}", server);
                }
                Err(e) => {
                    failures += 1;
                    warn!("Failed to connect to dispatcher {}: {}", server, e);
                    if let Some(max) = self.config.max_reconnect_attempts {
                        if failures >= max {
                            return Err(ProxyError::upstream(format!(
                                "gave up after {} failed attempts",
                                failures
                            )));
                        }
                    }
                }
            }

            debug!(
                "Reconnecting in {}ms",
                self.config.reconnect_interval().as_millis()
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_interval()) => {}
            }
        }
    }

    /// Run on a background task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn serve_link(&self, stream: TcpStream, server: &ServerAddress, shutdown: &CancellationToken) {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let mut link_config = LinkConfig::connector();
        if let Some(interval) = self.config.idle_ping_interval() {
            link_config = link_config.with_ping_interval(interval);
        }
        let (link, mut events) = Link::spawn(stream, peer, link_config);

        if self.config.auto_register {
            if let Err(e) = link.send_message(REGISTER_MESSAGE, Vec::new()).await {
                warn!("Failed to register with dispatcher {}: {}", server, e);
                link.close();
                return;
            }
            info!("Registered with dispatcher {} as link {}", server, link.id());
        }

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    link.close();
                    return;
                }
                event = events.next() => event,
            };

            match event {
                Some(LinkEvent::Channel(channel)) => {
                    tokio::spawn(handle_session(channel));
                }
                Some(LinkEvent::Message { name, .. }) => {
                    debug!("Ignoring message {} from dispatcher", name);
                }
                None => return,
            }
        }
    }
}

/// Serve one session opened by the dispatcher.
pub async fn handle_session(channel: Channel) {
    let mut session = Session::incoming(channel);

    if session.tag() != SOCKS_TAG {
        debug!("Rejecting session {} with tag {}", session.id(), session.tag());
        let reason = format!("unsupported session type {}", session.tag());
        session.reject(reason).await;
        return;
    }

    let destination = match Destination::from_session_args(session.args()) {
        Ok(destination) => destination,
        Err(e) => {
            warn!("Malformed session {}: {}", session.id(), e);
            session.reject(e.to_string()).await;
            return;
        }
    };

    if let Err(e) = session.acknowledge().await {
        debug!("Session {} lost before acknowledge: {}", session.id(), e);
        return;
    }

    if destination.command != Command::Connect {
        session
            .reject(format!("{} is not supported", destination.command))
            .await;
        return;
    }

    let dialed = tokio::select! {
        result = destination.dial() => result,
        _ = session.abandoned() => {
            debug!("Session {} abandoned while dialing {}", session.id(), destination);
            return;
        }
    };

    let target = match dialed {
        Ok(target) => target,
        Err(e) => {
            warn!("Failed to connect to {}: {}", destination, e);
            session.reject(e.to_string()).await;
            return;
        }
    };

    if let Err(e) = session.confirm_connected().await {
        debug!("Session {} lost before connect: {}", session.id(), e);
        return;
    }

    let id = session.id();
    debug!("Session {} connected to {}", id, destination);
    match relay(session, target).await {
        Ok(stats) => debug!(
            "Session {} finished: {} bytes from dispatcher, {} bytes to dispatcher",
            id, stats.upload, stats.download
        ),
        Err(e) => debug!("Session {} aborted: {}", id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use bytes::Bytes;
    use elastic_mux::ChannelEvent;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn dispatch_side() -> (Link, tokio::task::JoinHandle<()>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (dispatcher, _events) = Link::spawn(a, None, LinkConfig::acceptor());
        let (_worker, mut worker_events) = Link::spawn(b, None, LinkConfig::connector());
        let serving = tokio::spawn(async move {
            while let Some(event) = worker_events.next().await {
                if let LinkEvent::Channel(channel) = event {
                    tokio::spawn(handle_session(channel));
                }
            }
        });
        (dispatcher, serving)
    }

    #[tokio::test]
    async fn test_session_reaches_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (dispatcher, _serving) = dispatch_side().await;

        let destination = Destination::new("127.0.0.1", port, Command::Connect);
        let mut session = Session::open(&dispatcher, SOCKS_TAG, destination.to_session_args())
            .await
            .unwrap();

        let (mut upstream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(5), session.wait_connected())
            .await
            .unwrap()
            .unwrap();

        session.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        upstream.write_all(b"there").await.unwrap();
        drop(upstream);
        let mut received = Vec::new();
        session.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"there");
        assert_eq!(session.state(), SessionState::Closing(crate::session::Side::Remote));
    }

    #[tokio::test]
    async fn test_dial_failure_resets_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let (dispatcher, _serving) = dispatch_side().await;

        let destination = Destination::new("127.0.0.1", port, Command::Connect);
        let mut session = Session::open(&dispatcher, SOCKS_TAG, destination.to_session_args())
            .await
            .unwrap();

        let result = timeout(Duration::from_secs(5), session.wait_connected())
            .await
            .unwrap();
        assert!(matches!(result, Err(ProxyError::SessionRejected(_))));
        assert_eq!(session.state(), SessionState::Errored);
    }

    #[tokio::test]
    async fn test_unknown_tag_is_reset() {
        let (dispatcher, _serving) = dispatch_side().await;
        let mut channel = dispatcher.open_channel("UDP", Vec::new()).await.unwrap();

        match timeout(Duration::from_secs(5), channel.next_event()).await.unwrap() {
            Some(ChannelEvent::Reset(reason)) => assert!(reason.contains("UDP")),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_reset() {
        let (dispatcher, _serving) = dispatch_side().await;
        let mut channel = dispatcher
            .open_channel(SOCKS_TAG, vec![Bytes::from_static(b"example.com")])
            .await
            .unwrap();

        assert!(matches!(
            timeout(Duration::from_secs(5), channel.next_event()).await.unwrap(),
            Some(ChannelEvent::Reset(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_is_rejected_after_acknowledge() {
        let (dispatcher, _serving) = dispatch_side().await;
        let destination = Destination::new("127.0.0.1", 80, Command::Bind);
        let mut channel = dispatcher
            .open_channel(SOCKS_TAG, destination.to_session_args())
            .await
            .unwrap();

        let events = [
            timeout(Duration::from_secs(5), channel.next_event()).await.unwrap(),
            timeout(Duration::from_secs(5), channel.next_event()).await.unwrap(),
        ];
        assert_eq!(events[0], Some(ChannelEvent::Accepted));
        assert!(matches!(&events[1], Some(ChannelEvent::Reset(reason)) if reason.contains("BIND")));
    }

    #[tokio::test]
    async fn test_worker_gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = WorkerConfig {
            servers: vec![ServerAddress {
                host: "127.0.0.1".to_string(),
                port,
            }],
            reconnect_interval_ms: 10,
            max_reconnect_attempts: Some(3),
            ..WorkerConfig::default()
        };
        let worker = Worker::new(config).unwrap();
        let result = timeout(Duration::from_secs(5), worker.run(CancellationToken::new()))
            .await
            .unwrap();
        assert!(matches!(result, Err(ProxyError::UpstreamConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_worker_registers_and_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = WorkerConfig {
            servers: vec![ServerAddress {
                host: "127.0.0.1".to_string(),
                port,
            }],
            reconnect_interval_ms: 10,
            ..WorkerConfig::default()
        };
        let shutdown = CancellationToken::new();
        let handle = Worker::new(config).unwrap().spawn(shutdown.clone());

        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let (_link, mut events) = Link::spawn(stream, None, LinkConfig::acceptor());
        match timeout(Duration::from_secs(5), events.next()).await.unwrap() {
            Some(LinkEvent::Message { name, .. }) => assert_eq!(name, REGISTER_MESSAGE),
            other => panic!("unexpected event: {:?}", other),
        }

        shutdown.cancel();
        timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
