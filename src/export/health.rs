use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for collector health and observability.
///
/// All metrics use the "netflowd" namespace. None of them participate in
/// any correctness contract; they exist so an operator can see the
/// pipeline working (or not) without reading logs.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Raw byte chunks received from the agent socket.
    pub chunks_received: Counter,
    /// Decoded lines by classification (flow/purge_stat/ignored/invalid).
    pub records_by_kind: CounterVec,
    /// Agent connection state (0=disconnected, 1=connecting, 2=connected,
    /// 3=reconnect_wait).
    pub connection_state: Gauge,
    /// Total reconnect attempts scheduled.
    pub reconnect_attempts: Counter,
    /// Times the reconnect ceiling was reached (extended cooldown taken).
    pub reconnect_exhaustions: Counter,
    /// Store write failures by store name.
    pub store_write_errors: CounterVec,
    /// Aggregator cycle results by outcome (processed/inserted/skipped/errors).
    pub aggregate_rows: CounterVec,
    /// Purge runs completed.
    pub purge_runs: Counter,
    /// Devices currently held by the enrichment cache.
    pub device_cache_entries: Gauge,
}

impl HealthMetrics {
    /// Creates and registers all collector metrics.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let chunks_received = Counter::with_opts(Opts::new(
            "netflowd_chunks_received_total",
            "Raw byte chunks received from the agent socket",
        ))?;
        let records_by_kind = CounterVec::new(
            Opts::new(
                "netflowd_records_total",
                "Decoded lines by classification",
            ),
            &["kind"],
        )?;
        let connection_state = Gauge::with_opts(Opts::new(
            "netflowd_connection_state",
            "Agent connection state (0=disconnected, 1=connecting, 2=connected, 3=reconnect_wait)",
        ))?;
        let reconnect_attempts = Counter::with_opts(Opts::new(
            "netflowd_reconnect_attempts_total",
            "Reconnect attempts scheduled",
        ))?;
        let reconnect_exhaustions = Counter::with_opts(Opts::new(
            "netflowd_reconnect_exhaustions_total",
            "Times the reconnect ceiling was reached",
        ))?;
        let store_write_errors = CounterVec::new(
            Opts::new(
                "netflowd_store_write_errors_total",
                "Store write failures by store",
            ),
            &["store"],
        )?;
        let aggregate_rows = CounterVec::new(
            Opts::new(
                "netflowd_aggregate_rows_total",
                "Aggregator cycle row outcomes",
            ),
            &["outcome"],
        )?;
        let purge_runs = Counter::with_opts(Opts::new(
            "netflowd_purge_runs_total",
            "Retention purge runs completed",
        ))?;
        let device_cache_entries = Gauge::with_opts(Opts::new(
            "netflowd_device_cache_entries",
            "Devices held by the enrichment cache",
        ))?;

        registry.register(Box::new(chunks_received.clone()))?;
        registry.register(Box::new(records_by_kind.clone()))?;
        registry.register(Box::new(connection_state.clone()))?;
        registry.register(Box::new(reconnect_attempts.clone()))?;
        registry.register(Box::new(reconnect_exhaustions.clone()))?;
        registry.register(Box::new(store_write_errors.clone()))?;
        registry.register(Box::new(aggregate_rows.clone()))?;
        registry.register(Box::new(purge_runs.clone()))?;
        registry.register(Box::new(device_cache_entries.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            chunks_received,
            records_by_kind,
            connection_state,
            reconnect_attempts,
            reconnect_exhaustions,
            store_write_errors,
            aggregate_rows,
            purge_runs,
            device_cache_entries,
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
