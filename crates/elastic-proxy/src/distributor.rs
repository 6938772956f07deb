//! Request routing: through a worker when one is available, directly
//! otherwise

use crate::error::Result;
use crate::metrics::RelayMetrics;
use crate::registry::{WorkerLink, WorkerRegistry};
use crate::relay::{relay, RelayStats};
use crate::request::{Handshake, PendingRequest};
use crate::session::{Session, SOCKS_TAG};
use crate::socks5::{unspecified, Command, Reply};
use elastic_mux::LinkId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Path a request took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The dispatcher dialed the destination itself
    Direct,
    /// The request went through the worker on this link
    Worker(LinkId),
}

impl Route {
    pub fn label(&self) -> &'static str {
        match self {
            Route::Direct => "direct",
            Route::Worker(_) => "worker",
        }
    }
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Accepted, and the relay finished cleanly
    Relayed(RelayStats),
    /// Accepted, but the relay was aborted by an error
    Aborted(String),
    /// Denied with this reply
    Denied(Reply),
    /// The client left before an answer was sent
    Cancelled,
}

impl Resolution {
    fn outcome_label(&self) -> &'static str {
        match self {
            Resolution::Relayed(_) => "relayed",
            Resolution::Aborted(_) => "aborted",
            Resolution::Denied(_) => "denied",
            Resolution::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub route: Route,
    pub resolution: Resolution,
}

/// Routes pending requests across the registered workers.
#[derive(Clone)]
pub struct Distributor {
    registry: Arc<WorkerRegistry>,
    metrics: RelayMetrics,
}

impl Distributor {
    pub fn new(registry: Arc<WorkerRegistry>, metrics: RelayMetrics) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Route one request and drive it to completion.
    pub async fn dispatch<H: Handshake>(&self, request: PendingRequest<H>) -> Result<Outcome> {
        let outcome = if self.registry.count() == 0 {
            debug!("No workers registered, handling {} directly", request.destination());
            self.handle_direct(request).await?
        } else {
            match self.registry.select() {
                Some(worker) => self.distribute(worker, request).await?,
                None => {
                    debug!("No worker link usable, handling {} directly", request.destination());
                    self.handle_direct(request).await?
                }
            }
        };

        self.record(&outcome);
        Ok(outcome)
    }

    fn record(&self, outcome: &Outcome) {
        self.metrics
            .record_request(outcome.route.label(), outcome.resolution.outcome_label());
    }

    /// Answer with a failure reply. The denial is counted even when the
    /// reply cannot be written.
    async fn deny<H: Handshake>(
        &self,
        route: Route,
        request: &mut PendingRequest<H>,
        reply: Reply,
    ) -> Result<Outcome> {
        let outcome = Outcome {
            route,
            resolution: Resolution::Denied(reply),
        };
        if let Err(e) = request.deny(reply).await {
            self.record(&outcome);
            return Err(e);
        }
        Ok(outcome)
    }

    async fn distribute<H: Handshake>(
        &self,
        worker: WorkerLink,
        mut request: PendingRequest<H>,
    ) -> Result<Outcome> {
        let route = Route::Worker(worker.id());
        let args = request.destination().to_session_args();

        let mut session = match Session::open(worker.link(), SOCKS_TAG, args).await {
            Ok(session) => session,
            Err(e) => {
                // The link died after it was selected.
                warn!("Failed to open session on worker {}: {}", worker.id(), e);
                return self.handle_direct(request).await;
            }
        };

        let connected = tokio::select! {
            result = session.wait_connected() => result,
            _ = request.client_closed() => {
                debug!("Client left before session {} connected", session.id());
                session.cancel().await;
                return Ok(Outcome { route, resolution: Resolution::Cancelled });
            }
        };

        if let Err(e) = connected {
            warn!(
                "Worker {} could not reach {}: {}",
                worker.id(),
                request.destination(),
                e
            );
            return self.deny(route, &mut request, Reply::HostUnreachable).await;
        }

        let client = request.accept(unspecified()).await?;
        debug!(
            "Relaying {} through worker {} (session {})",
            request.destination(),
            worker.id(),
            session.id()
        );
        let resolution = self.run_relay(route, client, session).await;
        Ok(Outcome { route, resolution })
    }

    async fn handle_direct<H: Handshake>(&self, mut request: PendingRequest<H>) -> Result<Outcome> {
        let route = Route::Direct;
        let destination = request.destination().clone();

        if destination.command != Command::Connect {
            debug!("{} is not supported for direct connections", destination.command);
            return self.deny(route, &mut request, Reply::CommandNotSupported).await;
        }

        let dialed = tokio::select! {
            result = destination.dial() => result,
            _ = request.client_closed() => {
                debug!("Client left while dialing {}", destination);
                return Ok(Outcome { route, resolution: Resolution::Cancelled });
            }
        };

        match dialed {
            Ok(target) => {
                let bound = target.local_addr().unwrap_or_else(|_| unspecified());
                let client = request.accept(bound).await?;
                debug!("Relaying {} directly", destination);
                let resolution = self.run_relay(route, client, target).await;
                Ok(Outcome { route, resolution })
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", destination, e);
                self.deny(route, &mut request, Reply::from_io_error(&e)).await
            }
        }
    }

    async fn run_relay<A, B>(&self, route: Route, client: A, target: B) -> Resolution
    where
        A: AsyncRead + AsyncWrite,
        B: AsyncRead + AsyncWrite,
    {
        self.metrics.relay_started(route.label());
        let result = relay(client, target).await;
        self.metrics.relay_finished(route.label());

        match result {
            Ok(stats) => {
                self.metrics.record_bytes(route.label(), &stats);
                info!(
                    "Relay via {} finished: {} bytes up, {} bytes down",
                    route.label(),
                    stats.upload,
                    stats.download
                );
                Resolution::Relayed(stats)
            }
            Err(e) => {
                warn!("Relay via {} aborted: {}", route.label(), e);
                Resolution::Aborted(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::Destination;
    use crate::error::ProxyError;
    use crate::request::testing::{Answer, FakeHandshake};
    use crate::session::SessionState;
    use elastic_mux::{Link, LinkConfig, LinkEvent, LinkEvents};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    struct Client {
        stream: DuplexStream,
        answers: Arc<Mutex<Vec<Answer>>>,
        close: oneshot::Sender<()>,
    }

    fn request(destination: Destination) -> (PendingRequest<FakeHandshake>, Client) {
        let (server_side, client_side) = tokio::io::duplex(64 * 1024);
        let answers = Arc::new(Mutex::new(Vec::new()));
        let (close, closed) = oneshot::channel();
        let handshake = FakeHandshake {
            stream: server_side,
            answers: answers.clone(),
            closed: Some(closed),
        };
        (
            PendingRequest::new(destination, handshake),
            Client {
                stream: client_side,
                answers,
                close,
            },
        )
    }

    fn distributor() -> Distributor {
        Distributor::new(Arc::new(WorkerRegistry::new()), RelayMetrics::new().unwrap())
    }

    fn registered_worker(distributor: &Distributor) -> (WorkerLink, LinkEvents, Link) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (dispatcher_side, _events) = Link::spawn(a, None, LinkConfig::acceptor());
        let (worker_side, worker_events) = Link::spawn(b, None, LinkConfig::connector());
        let worker = WorkerLink::new(dispatcher_side);
        distributor.registry().add_worker(worker.clone()).unwrap();
        (worker, worker_events, worker_side)
    }

    async fn next_session(events: &mut LinkEvents) -> Session {
        loop {
            match timeout(Duration::from_secs(5), events.next()).await.unwrap() {
                Some(LinkEvent::Channel(channel)) => return Session::incoming(channel),
                Some(_) => continue,
                None => panic!("worker link closed"),
            }
        }
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_no_workers_goes_direct() {
        let distributor = distributor();
        let addr = echo_server().await;
        let (pending, mut client) =
            request(Destination::new("127.0.0.1", addr.port(), Command::Connect));

        let task = tokio::spawn({
            let distributor = distributor.clone();
            async move { distributor.dispatch(pending).await }
        });

        client.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.stream.shutdown().await.unwrap();

        let outcome = timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.route, Route::Direct);
        assert_eq!(
            outcome.resolution,
            Resolution::Relayed(RelayStats { upload: 4, download: 4 })
        );
        assert_eq!(*client.answers.lock().unwrap(), vec![Answer::Accepted]);
        assert_eq!(distributor.metrics.requests("direct", "relayed"), 1);
    }

    #[tokio::test]
    async fn test_direct_dial_failure_is_denied() {
        let distributor = distributor();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (pending, client) = request(Destination::new("127.0.0.1", port, Command::Connect));
        let outcome = distributor.dispatch(pending).await.unwrap();

        assert_eq!(outcome.resolution, Resolution::Denied(Reply::ConnectionRefused));
        assert_eq!(
            *client.answers.lock().unwrap(),
            vec![Answer::Denied(Reply::ConnectionRefused)]
        );
    }

    #[tokio::test]
    async fn test_direct_bind_is_not_supported() {
        let distributor = distributor();
        let (pending, client) = request(Destination::new("127.0.0.1", 80, Command::Bind));

        let outcome = distributor.dispatch(pending).await.unwrap();
        assert_eq!(outcome.resolution, Resolution::Denied(Reply::CommandNotSupported));
        assert_eq!(
            *client.answers.lock().unwrap(),
            vec![Answer::Denied(Reply::CommandNotSupported)]
        );
        assert_eq!(distributor.metrics.requests("direct", "denied"), 1);
    }

    #[tokio::test]
    async fn test_denial_is_counted_when_reply_fails() {
        let distributor = distributor();
        let (mut pending, _client) = request(Destination::new("127.0.0.1", 80, Command::Bind));
        // Answering early makes the distributor's own reply fail.
        pending.deny(Reply::GeneralFailure).await.unwrap();

        assert!(matches!(
            distributor.dispatch(pending).await,
            Err(ProxyError::AlreadyAnswered)
        ));
        assert_eq!(distributor.metrics.requests("direct", "denied"), 1);
    }

    #[tokio::test]
    async fn test_worker_session_carries_traffic() {
        let distributor = distributor();
        let (worker, mut worker_events, _worker_link) = registered_worker(&distributor);
        let (pending, mut client) =
            request(Destination::new("example.com", 443, Command::Connect));

        let task = tokio::spawn({
            let distributor = distributor.clone();
            async move { distributor.dispatch(pending).await }
        });

        let mut session = next_session(&mut worker_events).await;
        assert_eq!(session.tag(), SOCKS_TAG);
        assert_eq!(
            Destination::from_session_args(session.args()).unwrap(),
            Destination::new("example.com", 443, Command::Connect)
        );
        session.acknowledge().await.unwrap();
        session.confirm_connected().await.unwrap();

        client.stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        session.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        session.write_all(b"world").await.unwrap();
        session.shutdown().await.unwrap();
        client.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
        client.stream.shutdown().await.unwrap();

        let outcome = timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.route, Route::Worker(worker.id()));
        assert_eq!(
            outcome.resolution,
            Resolution::Relayed(RelayStats { upload: 5, download: 5 })
        );
        assert_eq!(*client.answers.lock().unwrap(), vec![Answer::Accepted]);
    }

    #[tokio::test]
    async fn test_worker_rejection_is_denied() {
        let distributor = distributor();
        let (_worker, mut worker_events, _worker_link) = registered_worker(&distributor);
        let (pending, client) = request(Destination::new("nowhere.invalid", 80, Command::Connect));

        let task = tokio::spawn({
            let distributor = distributor.clone();
            async move { distributor.dispatch(pending).await }
        });

        let mut session = next_session(&mut worker_events).await;
        session.acknowledge().await.unwrap();
        session.reject("name resolution failed").await;

        let outcome = timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.resolution, Resolution::Denied(Reply::HostUnreachable));
        assert_eq!(
            *client.answers.lock().unwrap(),
            vec![Answer::Denied(Reply::HostUnreachable)]
        );
    }

    #[tokio::test]
    async fn test_client_leaving_cancels_session() {
        let distributor = distributor();
        let (_worker, mut worker_events, _worker_link) = registered_worker(&distributor);
        let (pending, client) = request(Destination::new("example.com", 80, Command::Connect));

        let task = tokio::spawn({
            let distributor = distributor.clone();
            async move { distributor.dispatch(pending).await }
        });

        let mut session = next_session(&mut worker_events).await;
        session.acknowledge().await.unwrap();
        client.close.send(()).unwrap();

        let outcome = timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.resolution, Resolution::Cancelled);
        assert!(client.answers.lock().unwrap().is_empty());

        timeout(Duration::from_secs(5), session.abandoned()).await.unwrap();
        assert_eq!(session.state(), SessionState::Errored);
        assert_eq!(session.failure(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_closed_worker_link_falls_back_to_direct() {
        let distributor = distributor();
        let (worker, _worker_events, _worker_link) = registered_worker(&distributor);
        worker.link().close();

        let (pending, _client) = request(Destination::new("127.0.0.1", 9, Command::Bind));
        let outcome = distributor.dispatch(pending).await.unwrap();
        assert_eq!(outcome.route, Route::Direct);
        assert_eq!(distributor.registry().count(), 0);
        assert_eq!(distributor.registry().workers().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_link_loss_mid_relay_aborts() {
        let distributor = distributor();
        let (_worker, mut worker_events, worker_link) = registered_worker(&distributor);
        let (pending, mut client) = request(Destination::new("example.com", 80, Command::Connect));

        let task = tokio::spawn({
            let distributor = distributor.clone();
            async move { distributor.dispatch(pending).await }
        });

        let mut session = next_session(&mut worker_events).await;
        session.acknowledge().await.unwrap();
        session.confirm_connected().await.unwrap();

        client.stream.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        session.read_exact(&mut buf).await.unwrap();

        worker_link.close();

        let outcome = timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        assert!(matches!(outcome.resolution, Resolution::Aborted(_)));

        // The client connection was destroyed, not half-closed.
        let mut rest = Vec::new();
        let _ = client.stream.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }
}
