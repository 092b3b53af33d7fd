//! Prometheus metrics for the svcwire server.
//!
//! The registry is served as text over a small HTTP endpoint at `/metrics`,
//! alongside `/health`.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Request duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0];

/// Prometheus metrics for the svcwire server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently open sessions.
    pub connections_active: Gauge,
    /// Total inbound requests by message kind.
    pub requests_total: CounterVec,
    /// Total error responses by error code.
    pub errors_total: CounterVec,
    /// Request duration histogram by message kind.
    pub request_duration: HistogramVec,
    /// Registered event listeners.
    pub listeners_active: Gauge,
    /// Event notifications queued for delivery.
    pub events_delivered_total: Counter,
    /// Open resource proxy sessions.
    pub resource_sessions_active: Gauge,
    /// Upload bytes written to storage.
    pub bytes_uploaded_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "svcwire_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "svcwire_connections_active",
            "Number of currently open sessions",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let requests_total = CounterVec::new(
            Opts::new("svcwire_requests_total", "Total requests by message kind"),
            &["kind"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("svcwire_errors_total", "Total error responses by error code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "svcwire_request_duration_seconds",
                "Request duration in seconds by message kind",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["kind"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let listeners_active = Gauge::with_opts(Opts::new(
            "svcwire_listeners_active",
            "Number of registered event listeners",
        ))?;
        registry.register(Box::new(listeners_active.clone()))?;

        let events_delivered_total = Counter::with_opts(Opts::new(
            "svcwire_events_delivered_total",
            "Event notifications queued for delivery",
        ))?;
        registry.register(Box::new(events_delivered_total.clone()))?;

        let resource_sessions_active = Gauge::with_opts(Opts::new(
            "svcwire_resource_sessions_active",
            "Number of open resource proxy sessions",
        ))?;
        registry.register(Box::new(resource_sessions_active.clone()))?;

        let bytes_uploaded_total = Counter::with_opts(Opts::new(
            "svcwire_bytes_uploaded_total",
            "Upload bytes written to storage",
        ))?;
        registry.register(Box::new(bytes_uploaded_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            requests_total,
            errors_total,
            request_duration,
            listeners_active,
            events_delivered_total,
            resource_sessions_active,
            bytes_uploaded_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn reply(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => match metrics.encode() {
            Ok(body) => reply(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                body,
            ),
            Err(e) => {
                tracing::warn!("Failed to encode metrics: {}", e);
                reply(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    "metrics unavailable",
                )
            }
        },
        "/health" | "/healthz" => reply(StatusCode::OK, "text/plain", "OK"),
        "/" => reply(
            StatusCode::OK,
            "text/html",
            r#"<!DOCTYPE html>
<html>
<head><title>svcwire Metrics</title></head>
<body>
<h1>svcwire Metrics</h1>
<p><a href="/metrics">Metrics</a></p>
</body>
</html>"#,
        ),
        _ => reply(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}
