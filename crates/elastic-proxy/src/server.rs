//! Dispatcher (server role)
//!
//! Listens for SOCKS clients and for worker links, keeps the worker
//! registry current, and hands every client request to the
//! [`Distributor`].

use crate::config::DispatcherConfig;
use crate::distributor::Distributor;
use crate::error::{ProxyError, Result};
use crate::metrics::{self, RelayMetrics};
use crate::registry::{WorkerLink, WorkerRegistry};
use crate::socks5;
use crate::REGISTER_MESSAGE;
use elastic_mux::{Link, LinkConfig, LinkEvent, LinkEvents};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A bound dispatcher, ready to [`run`](Dispatcher::run).
pub struct Dispatcher {
    config: DispatcherConfig,
    registry: Arc<WorkerRegistry>,
    metrics: RelayMetrics,
    socks_listener: TcpListener,
    link_listener: TcpListener,
    metrics_listener: Option<TcpListener>,
}

impl Dispatcher {
    /// Bind every listener named in `config`.
    pub async fn bind(config: DispatcherConfig) -> Result<Self> {
        config.validate()?;

        let socks_listener =
            bind_listener(&config.socks.host, config.socks.port, config.socks.backlog).await?;
        let link_listener =
            bind_listener(&config.link.host, config.link.port, config.link.backlog).await?;
        let metrics_listener = if config.metrics.enabled {
            Some(TcpListener::bind(config.metrics.bind_address.as_str()).await?)
        } else {
            None
        };

        Ok(Self {
            config,
            registry: Arc::new(WorkerRegistry::new()),
            metrics: RelayMetrics::new()?,
            socks_listener,
            link_listener,
            metrics_listener,
        })
    }

    pub fn socks_addr(&self) -> Result<SocketAddr> {
        Ok(self.socks_listener.local_addr()?)
    }

    pub fn link_addr(&self) -> Result<SocketAddr> {
        Ok(self.link_listener.local_addr()?)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        self.registry.clone()
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Dispatcher {
            config,
            registry,
            metrics,
            socks_listener,
            link_listener,
            metrics_listener,
        } = self;

        info!("SOCKS5 listening on {}", socks_listener.local_addr()?);
        info!("Worker links listening on {}", link_listener.local_addr()?);

        let mut link_config = LinkConfig::acceptor();
        if let Some(timeout) = config.link.idle_close_timeout() {
            link_config = link_config.with_idle_timeout(timeout);
        }

        let distributor = Distributor::new(registry.clone(), metrics.clone());

        let metrics_task = metrics_listener.map(|listener| {
            tokio::spawn(metrics::serve(
                listener,
                config.metrics.path.clone(),
                metrics.clone(),
                shutdown.clone(),
            ))
        });

        let served = tokio::try_join!(
            accept_socks(socks_listener, distributor, shutdown.clone()),
            accept_links(
                link_listener,
                link_config,
                registry.clone(),
                metrics.clone(),
                shutdown.clone(),
            ),
        );

        shutdown.cancel();
        registry.close_all();

        if let Some(task) = metrics_task {
            match task.await {
                Ok(Err(e)) => error!("Metrics endpoint failed: {}", e),
                Err(e) => error!("Metrics task join error: {}", e),
                Ok(Ok(())) => {}
            }
        }

        served.map(|_| ())
    }
}

/// Bind a listener with an explicit backlog.
async fn bind_listener(host: &str, port: u16, backlog: u32) -> Result<TcpListener> {
    let addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| ProxyError::config(format!("Cannot resolve {}:{}", host, port)))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}

async fn accept_socks(
    listener: TcpListener,
    distributor: Distributor,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let (socket, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept SOCKS client: {}", e);
                    continue;
                }
            },
        };

        let distributor = distributor.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_socks_client(socket, peer_addr, distributor).await {
                error!("SOCKS5 proxy error from {}: {}", peer_addr, e);
            }
        });
    }
}

async fn handle_socks_client(
    socket: TcpStream,
    peer_addr: SocketAddr,
    distributor: Distributor,
) -> Result<()> {
    if let Err(e) = socket.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
    }

    let request = socks5::negotiate(socket).await?;
    debug!(
        "SOCKS5 {} request from {} to {}",
        request.destination().command,
        peer_addr,
        request.destination()
    );

    let outcome = distributor.dispatch(request).await?;
    debug!(
        "Request from {} via {} ended: {:?}",
        peer_addr,
        outcome.route.label(),
        outcome.resolution
    );
    Ok(())
}

async fn accept_links(
    listener: TcpListener,
    link_config: LinkConfig,
    registry: Arc<WorkerRegistry>,
    metrics: RelayMetrics,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let (socket, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept worker link: {}", e);
                    continue;
                }
            },
        };

        if let Err(e) = socket.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }
        info!("Worker connected from {}", peer_addr);

        let (link, events) = Link::spawn(socket, Some(peer_addr), link_config.clone());
        tokio::spawn(serve_worker_link(link, events, registry.clone(), metrics.clone()));
    }
}

/// Track one worker link from connect to disconnect.
async fn serve_worker_link(
    link: Link,
    mut events: LinkEvents,
    registry: Arc<WorkerRegistry>,
    metrics: RelayMetrics,
) {
    while let Some(event) = events.next().await {
        match event {
            LinkEvent::Message { name, .. } if name == REGISTER_MESSAGE => {
                match registry.add_worker(WorkerLink::new(link.clone())) {
                    Ok(()) => {
                        info!(
                            "Worker {} registered from {:?}, {} available",
                            link.id(),
                            link.remote_addr(),
                            registry.count()
                        );
                        metrics.set_workers(registry.count());
                    }
                    Err(e) => debug!("Ignoring registration: {}", e),
                }
            }
            LinkEvent::Message { name, .. } => {
                debug!("Ignoring message {} from worker {}", name, link.id());
            }
            LinkEvent::Channel(channel) => {
                debug!("Worker {} tried to open channel {}", link.id(), channel.id());
                let _ = channel.reset("dispatcher does not accept sessions").await;
            }
        }
    }

    if registry.remove_worker(&link.id()) {
        metrics.set_workers(registry.count());
    }
    info!(
        "Worker {} disconnected from {:?}, {} available",
        link.id(),
        link.remote_addr(),
        registry.count()
    );
}
