//! Prometheus metrics for the netd server.
//!
//! Per-class connection and broadcast counters, gauges mirroring the shared
//! traffic counters, and a small hyper server exposing them.

use crate::stats::Stat;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Prometheus metrics for the netd server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Connections accepted by class.
    pub connections_accepted_total: CounterVec,
    /// Currently registered providers by class.
    pub connections_active: GaugeVec,
    /// Connections turned away by class and reason.
    pub connections_rejected_total: CounterVec,
    /// Failed or timed out TLS handshakes by class.
    pub tls_handshake_failures_total: CounterVec,
    /// Broadcast deliveries by class.
    pub broadcast_messages_total: CounterVec,
    /// Failed broadcast deliveries by class.
    pub broadcast_failures_total: CounterVec,
    /// Mirrors of the traffic counters.
    pub in_msgs: Gauge,
    pub out_msgs: Gauge,
    pub in_bytes: Gauge,
    pub out_bytes: Gauge,
    pub requests: Gauge,
    pub total_clients: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_accepted_total = CounterVec::new(
            Opts::new(
                "netd_connections_accepted_total",
                "Total connections accepted by class",
            ),
            &["class"],
        )?;
        registry.register(Box::new(connections_accepted_total.clone()))?;

        let connections_active = GaugeVec::new(
            Opts::new(
                "netd_connections_active",
                "Number of registered connections by class",
            ),
            &["class"],
        )?;
        registry.register(Box::new(connections_active.clone()))?;

        let connections_rejected_total = CounterVec::new(
            Opts::new(
                "netd_connections_rejected_total",
                "Total connections rejected by class and reason",
            ),
            &["class", "reason"],
        )?;
        registry.register(Box::new(connections_rejected_total.clone()))?;

        // TLS
        let tls_handshake_failures_total = CounterVec::new(
            Opts::new(
                "netd_tls_handshake_failures_total",
                "Total failed or timed out TLS handshakes by class",
            ),
            &["class"],
        )?;
        registry.register(Box::new(tls_handshake_failures_total.clone()))?;

        // Broadcast
        let broadcast_messages_total = CounterVec::new(
            Opts::new(
                "netd_broadcast_messages_total",
                "Total broadcast deliveries by class",
            ),
            &["class"],
        )?;
        registry.register(Box::new(broadcast_messages_total.clone()))?;

        let broadcast_failures_total = CounterVec::new(
            Opts::new(
                "netd_broadcast_failures_total",
                "Total failed broadcast deliveries by class",
            ),
            &["class"],
        )?;
        registry.register(Box::new(broadcast_failures_total.clone()))?;

        // Traffic
        let gauge = |name: &str, help: &str| -> Result<Gauge, prometheus::Error> {
            let g = Gauge::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let in_msgs = gauge("netd_in_msgs", "Messages received from peers")?;
        let out_msgs = gauge("netd_out_msgs", "Messages written to peers")?;
        let in_bytes = gauge("netd_in_bytes", "Bytes received from peers")?;
        let out_bytes = gauge("netd_out_bytes", "Bytes written to peers")?;
        let requests = gauge("netd_requests", "Requests handled")?;
        let total_clients = gauge("netd_total_clients", "Clients admitted since start")?;

        Ok(Self {
            registry,
            connections_accepted_total,
            connections_active,
            connections_rejected_total,
            tls_handshake_failures_total,
            broadcast_messages_total,
            broadcast_failures_total,
            in_msgs,
            out_msgs,
            in_bytes,
            out_bytes,
            requests,
            total_clients,
        })
    }

    /// Copies the current traffic counters into the gauges.
    pub fn observe_stats(&self, stats: &Stat) {
        let snapshot = stats.snapshot();
        self.in_msgs.set(snapshot.in_msgs as f64);
        self.out_msgs.set(snapshot.out_msgs as f64);
        self.in_bytes.set(snapshot.in_bytes as f64);
        self.out_bytes.set(snapshot.out_bytes as f64);
        self.requests.set(snapshot.requests as f64);
        self.total_clients.set(snapshot.total_clients as f64);
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Serves `/metrics`, `/health` and `/healthz` on `addr` until `shutdown`
/// fires. Traffic gauges are refreshed from `stats` on every scrape.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    stats: Arc<Stat>,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.recv() => break,
        };
        match accepted {
            Ok((stream, _)) => {
                tokio::spawn(serve_scraper(stream, metrics.clone(), stats.clone()));
            }
            Err(e) => tracing::error!("Metrics server accept error: {}", e),
        }
    }

    tracing::info!("Metrics server shutting down");
    Ok(())
}

async fn serve_scraper(stream: TcpStream, metrics: Arc<Metrics>, stats: Arc<Stat>) {
    let service = service_fn(move |req| handle_request(req, metrics.clone(), stats.clone()));
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        tracing::debug!("Metrics connection error: {}", e);
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    stats: Arc<Stat>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => {
            metrics.observe_stats(&stats);
            match metrics.encode() {
                Ok(body) => {
                    let mut response = text_response(StatusCode::OK, body);
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
                    );
                    response
                }
                Err(e) => {
                    tracing::error!("Failed to encode metrics: {}", e);
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "encode error")
                }
            }
        }
        "/health" | "/healthz" => text_response(StatusCode::OK, "OK"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}
