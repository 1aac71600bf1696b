//! Metrics and tracing setup for blocksync.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a blocksync node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Index traffic ──
    pub index_updates: IntCounter,

    // ── Pull activity ──
    pub blocks_copied: IntCounter,
    pub blocks_fetched: IntCounter,
    pub fetched_bytes: IntCounter,
    pub files_published: IntCounter,
    pub files_deleted: IntCounter,
    pub hash_failures: IntCounter,
    pub pull_errors: IntCounter,
    pub requests_in_flight: IntGauge,

    // ── Request latency ──
    pub request_latency_secs: prometheus::Histogram,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for block request latency.
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0];

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let index_updates = IntCounter::with_opts(Opts::new(
            "blocksync_index_updates_total",
            "Peer index messages applied to a file set",
        ))
        .expect("index_updates counter");

        let blocks_copied = IntCounter::with_opts(Opts::new(
            "blocksync_blocks_copied_total",
            "Blocks reused from the local copy",
        ))
        .expect("blocks_copied counter");
        let blocks_fetched = IntCounter::with_opts(Opts::new(
            "blocksync_blocks_fetched_total",
            "Blocks fetched from remote peers",
        ))
        .expect("blocks_fetched counter");
        let fetched_bytes = IntCounter::with_opts(Opts::new(
            "blocksync_fetched_bytes_total",
            "Bytes fetched from remote peers",
        ))
        .expect("fetched_bytes counter");
        let files_published = IntCounter::with_opts(Opts::new(
            "blocksync_files_published_total",
            "Files verified and renamed into place",
        ))
        .expect("files_published counter");
        let files_deleted = IntCounter::with_opts(Opts::new(
            "blocksync_files_deleted_total",
            "Local files removed to apply a peer deletion",
        ))
        .expect("files_deleted counter");
        let hash_failures = IntCounter::with_opts(Opts::new(
            "blocksync_hash_failures_total",
            "Pulled files discarded on block hash mismatch",
        ))
        .expect("hash_failures counter");
        let pull_errors = IntCounter::with_opts(Opts::new(
            "blocksync_pull_errors_total",
            "Pulled files abandoned on I/O or request errors",
        ))
        .expect("pull_errors counter");
        let requests_in_flight = IntGauge::with_opts(Opts::new(
            "blocksync_requests_in_flight",
            "Outstanding remote block requests",
        ))
        .expect("requests_in_flight gauge");

        let request_latency_secs = prometheus::Histogram::with_opts(
            HistogramOpts::new(
                "blocksync_request_latency_seconds",
                "Remote block request latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )
        .expect("request_latency_secs histogram");

        registry
            .register(Box::new(index_updates.clone()))
            .expect("register index_updates");
        registry
            .register(Box::new(blocks_copied.clone()))
            .expect("register blocks_copied");
        registry
            .register(Box::new(blocks_fetched.clone()))
            .expect("register blocks_fetched");
        registry
            .register(Box::new(fetched_bytes.clone()))
            .expect("register fetched_bytes");
        registry
            .register(Box::new(files_published.clone()))
            .expect("register files_published");
        registry
            .register(Box::new(files_deleted.clone()))
            .expect("register files_deleted");
        registry
            .register(Box::new(hash_failures.clone()))
            .expect("register hash_failures");
        registry
            .register(Box::new(pull_errors.clone()))
            .expect("register pull_errors");
        registry
            .register(Box::new(requests_in_flight.clone()))
            .expect("register requests_in_flight");
        registry
            .register(Box::new(request_latency_secs.clone()))
            .expect("register request_latency_secs");

        Self {
            registry,
            index_updates,
            blocks_copied,
            blocks_fetched,
            fetched_bytes,
            files_published,
            files_deleted,
            hash_failures,
            pull_errors,
            requests_in_flight,
            request_latency_secs,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
