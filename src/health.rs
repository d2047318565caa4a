use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for server health and observability.
///
/// All metrics use the "shepherd" namespace. Served on a dedicated listener
/// so probes keep answering even if the API router is saturated.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Agent streams currently registered.
    pub connections_active: Gauge,
    /// Total accepted agent streams.
    pub connects_total: Counter,
    /// Rejected connection attempts by reason.
    pub connect_rejects_total: CounterVec,
    /// Total heartbeat pings issued.
    pub pings_total: Counter,
    /// Pings that errored or timed out.
    pub ping_failures_total: Counter,
    /// Sweep misses (no stream, or ping failure).
    pub heartbeat_misses_total: Counter,
    /// Machines promoted to dead after exhausting retries.
    pub machines_marked_dead_total: Counter,
    /// Machines in the current sweep set.
    pub machines_monitored: Gauge,
    /// Duration of one heartbeat sweep.
    pub sweep_duration: Histogram,
    /// Snapshot rows written.
    pub snapshots_written_total: Counter,
    /// Snapshot insert failures.
    pub snapshot_errors_total: Counter,
    /// Uptime chart queries served, by period.
    pub uptime_queries_total: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let connections_active = Gauge::with_opts(
            Opts::new("connections_active", "Agent streams currently registered.")
                .namespace("shepherd"),
        )?;
        let connects_total = Counter::with_opts(
            Opts::new("connects_total", "Total accepted agent streams.").namespace("shepherd"),
        )?;
        let connect_rejects_total = CounterVec::new(
            Opts::new(
                "connect_rejects_total",
                "Rejected connection attempts by reason.",
            )
            .namespace("shepherd"),
            &["reason"],
        )?;
        let pings_total = Counter::with_opts(
            Opts::new("pings_total", "Total heartbeat pings issued.").namespace("shepherd"),
        )?;
        let ping_failures_total = Counter::with_opts(
            Opts::new(
                "ping_failures_total",
                "Heartbeat pings that errored or timed out.",
            )
            .namespace("shepherd"),
        )?;
        let heartbeat_misses_total = Counter::with_opts(
            Opts::new(
                "heartbeat_misses_total",
                "Sweep misses: no stream, or ping failure.",
            )
            .namespace("shepherd"),
        )?;
        let machines_marked_dead_total = Counter::with_opts(
            Opts::new(
                "machines_marked_dead_total",
                "Machines promoted to dead after exhausting retries.",
            )
            .namespace("shepherd"),
        )?;
        let machines_monitored = Gauge::with_opts(
            Opts::new("machines_monitored", "Machines in the current sweep set.")
                .namespace("shepherd"),
        )?;
        let sweep_duration = Histogram::with_opts(
            HistogramOpts::new("sweep_duration_seconds", "Duration of one heartbeat sweep.")
                .namespace("shepherd")
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;
        let snapshots_written_total = Counter::with_opts(
            Opts::new("snapshots_written_total", "Snapshot rows written.").namespace("shepherd"),
        )?;
        let snapshot_errors_total = Counter::with_opts(
            Opts::new("snapshot_errors_total", "Snapshot insert failures.").namespace("shepherd"),
        )?;
        let uptime_queries_total = CounterVec::new(
            Opts::new(
                "uptime_queries_total",
                "Uptime chart queries served, by period.",
            )
            .namespace("shepherd"),
            &["period"],
        )?;

        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(connects_total.clone()))?;
        registry.register(Box::new(connect_rejects_total.clone()))?;
        registry.register(Box::new(pings_total.clone()))?;
        registry.register(Box::new(ping_failures_total.clone()))?;
        registry.register(Box::new(heartbeat_misses_total.clone()))?;
        registry.register(Box::new(machines_marked_dead_total.clone()))?;
        registry.register(Box::new(machines_monitored.clone()))?;
        registry.register(Box::new(sweep_duration.clone()))?;
        registry.register(Box::new(snapshots_written_total.clone()))?;
        registry.register(Box::new(snapshot_errors_total.clone()))?;
        registry.register(Box::new(uptime_queries_total.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            connections_active,
            connects_total,
            connect_rejects_total,
            pings_total,
            ping_failures_total,
            heartbeat_misses_total,
            machines_marked_dead_total,
            machines_monitored,
            sweep_duration,
            snapshots_written_total,
            snapshot_errors_total,
            uptime_queries_total,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
