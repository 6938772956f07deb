//! Prometheus metrics for the dispatcher

use crate::error::{ProxyError, Result};
use crate::relay::RelayStats;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Relay metrics, kept in their own registry so several dispatchers can
/// live in one process.
#[derive(Clone)]
pub struct RelayMetrics {
    /// SOCKS requests by route and outcome
    pub requests_total: IntCounterVec,

    /// Registered workers
    pub workers_registered: IntGauge,

    /// Relays currently running, by route
    pub relays_active: IntGaugeVec,

    /// Bytes relayed by route and direction
    pub bytes_relayed_total: IntCounterVec,

    registry: Registry,
}

impl RelayMetrics {
    /// Create new metrics instance
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("elastic_socks_requests_total", "SOCKS requests handled"),
            &["route", "outcome"],
        )?;

        let workers_registered = IntGauge::new(
            "elastic_socks_workers_registered",
            "Number of registered workers",
        )?;

        let relays_active = IntGaugeVec::new(
            Opts::new("elastic_socks_relays_active", "Relays currently running"),
            &["route"],
        )?;

        let bytes_relayed_total = IntCounterVec::new(
            Opts::new("elastic_socks_bytes_relayed_total", "Bytes relayed"),
            &["route", "direction"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(workers_registered.clone()))?;
        registry.register(Box::new(relays_active.clone()))?;
        registry.register(Box::new(bytes_relayed_total.clone()))?;

        Ok(Self {
            requests_total,
            workers_registered,
            relays_active,
            bytes_relayed_total,
            registry,
        })
    }

    pub fn record_request(&self, route: &str, outcome: &str) {
        self.requests_total.with_label_values(&[route, outcome]).inc();
    }

    /// Requests recorded so far for a route and outcome
    pub fn requests(&self, route: &str, outcome: &str) -> u64 {
        self.requests_total.with_label_values(&[route, outcome]).get()
    }

    pub fn set_workers(&self, count: usize) {
        self.workers_registered.set(count as i64);
    }

    pub fn relay_started(&self, route: &str) {
        self.relays_active.with_label_values(&[route]).inc();
    }

    pub fn relay_finished(&self, route: &str) {
        self.relays_active.with_label_values(&[route]).dec();
    }

    pub fn record_bytes(&self, route: &str, stats: &RelayStats) {
        self.bytes_relayed_total
            .with_label_values(&[route, "upload"])
            .inc_by(stats.upload);
        self.bytes_relayed_total
            .with_label_values(&[route, "download"])
            .inc_by(stats.download);
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| ProxyError::Metrics(e.to_string()))
    }
}

/// Serve `metrics` on `listener` under `path` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    path: String,
    metrics: RelayMetrics,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Metrics listening on http://{}{}", addr, path);
    }

    let app = Router::new()
        .route(&path, get(metrics_handler))
        .with_state(metrics);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn metrics_handler(State(metrics): State<RelayMetrics>) -> impl IntoResponse {
    match metrics.export() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_instances_do_not_collide() {
        let first = RelayMetrics::new().unwrap();
        let second = RelayMetrics::new().unwrap();

        first.record_request("direct", "accepted");
        assert_eq!(first.requests("direct", "accepted"), 1);
        assert_eq!(second.requests("direct", "accepted"), 0);
    }

    #[test]
    fn test_export_contains_recorded_values() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.set_workers(3);
        metrics.record_bytes("worker", &RelayStats { upload: 10, download: 32 });

        let text = metrics.export().unwrap();
        assert!(text.contains("elastic_socks_workers_registered 3"));
        assert!(text.contains(
            "elastic_socks_bytes_relayed_total{direction=\"download\",route=\"worker\"} 32"
        ));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.set_workers(2);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(
            listener,
            "/metrics".to_string(),
            metrics,
            shutdown.clone(),
        ));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("elastic_socks_workers_registered 2"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
