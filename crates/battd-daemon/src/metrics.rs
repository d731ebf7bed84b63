//! Prometheus metrics for the authorization boundary.
//!
//! # Metrics Families
//!
//! | Metric | Type | Description | Labels |
//! |--------|------|-------------|--------|
//! | `battd_authorization_decisions_total` | Counter | Gate decisions | `outcome`, `kind` |
//! | `battd_identity_resolution_seconds` | Histogram | Identity resolution latency | - |
//! | `battd_ipc_requests_total` | Counter | Control-socket requests | `command`, `status` |
//! | `battd_connections_active` | Gauge | Open control connections | - |
//!
//! The `kind` label is the local denial classification. It never reaches
//! the peer, which only ever sees `not_authorized`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use battd_daemon::metrics::MetricsRegistry;
//!
//! let registry = MetricsRegistry::new()?;
//! let metrics = registry.daemon_metrics();
//! metrics.ipc_request_completed("charge_to_full", "success");
//! let output = registry.encode_text()?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use battd_core::{AuthorizationDecision, DecisionObserver};
use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use thiserror::Error;
use tracing::{info, warn};

/// Maximum length for label values.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Histogram buckets for identity resolution (in seconds). Resolution hashes
/// the peer image, so the tail reaches well past a millisecond.
pub const RESOLUTION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),

    /// Failed to serve the metrics endpoint.
    #[error("failed to serve metrics: {0}")]
    Serve(#[from] std::io::Error),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Daemon metrics.
///
/// All metrics use interior mutability; the struct is cheap to clone and
/// safe to share across threads.
#[derive(Clone)]
pub struct DaemonMetrics {
    authorization_decisions_total: CounterVec,
    identity_resolution_seconds: Histogram,
    ipc_requests_total: CounterVec,
    connections_active: Gauge,
}

impl DaemonMetrics {
    /// Creates the metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let authorization_decisions_total = CounterVec::new(
            Opts::new(
                "battd_authorization_decisions_total",
                "Authorization gate decisions",
            ),
            &["outcome", "kind"],
        )?;
        registry.register(Box::new(authorization_decisions_total.clone()))?;

        let identity_resolution_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "battd_identity_resolution_seconds",
                "Latency of peer identity resolution",
            )
            .buckets(RESOLUTION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(identity_resolution_seconds.clone()))?;

        let ipc_requests_total = CounterVec::new(
            Opts::new("battd_ipc_requests_total", "Control-socket requests"),
            &["command", "status"],
        )?;
        registry.register(Box::new(ipc_requests_total.clone()))?;

        let connections_active = Gauge::new(
            "battd_connections_active",
            "Currently open control-socket connections",
        )?;
        registry.register(Box::new(connections_active.clone()))?;

        Ok(Self {
            authorization_decisions_total,
            identity_resolution_seconds,
            ipc_requests_total,
            connections_active,
        })
    }

    /// Records a gate decision.
    pub fn authorization_decided(&self, decision: &AuthorizationDecision) {
        let kind = decision.denial_kind().map_or("none", |kind| kind.as_str());
        self.authorization_decisions_total
            .with_label_values(&[decision.outcome(), kind])
            .inc();
    }

    /// Returns the decision count for testing purposes.
    #[must_use]
    pub fn decision_count(&self, outcome: &str, kind: &str) -> f64 {
        self.authorization_decisions_total
            .with_label_values(&[truncate_label(outcome), truncate_label(kind)])
            .get()
    }

    /// Records how long one identity resolution took.
    pub fn record_resolution(&self, elapsed: Duration) {
        self.identity_resolution_seconds
            .observe(elapsed.as_secs_f64());
    }

    /// Number of resolutions observed, for testing purposes.
    #[must_use]
    pub fn resolution_count(&self) -> u64 {
        self.identity_resolution_seconds.get_sample_count()
    }

    /// Records a completed control-socket request.
    pub fn ipc_request_completed(&self, command: &str, status: &str) {
        self.ipc_requests_total
            .with_label_values(&[truncate_label(command), truncate_label(status)])
            .inc();
    }

    /// Returns the request count for testing purposes.
    #[must_use]
    pub fn ipc_request_count(&self, command: &str, status: &str) -> f64 {
        self.ipc_requests_total
            .with_label_values(&[truncate_label(command), truncate_label(status)])
            .get()
    }

    /// Marks a connection as opened.
    pub fn connection_opened(&self) {
        self.connections_active.inc();
    }

    /// Marks a connection as closed.
    pub fn connection_closed(&self) {
        self.connections_active.dec();
    }

    /// Open connections, for testing purposes.
    #[must_use]
    pub fn active_connections(&self) -> f64 {
        self.connections_active.get()
    }
}

impl DecisionObserver for DaemonMetrics {
    fn decision(&self, decision: &AuthorizationDecision) {
        self.authorization_decided(decision);
    }

    fn resolution(&self, elapsed: Duration) {
        self.record_resolution(elapsed);
    }
}

/// Holds the Prometheus registry and the daemon metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    daemon_metrics: DaemonMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with all daemon metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let daemon_metrics = DaemonMetrics::new(&registry)?;
        Ok(Self {
            registry,
            daemon_metrics,
        })
    }

    /// Returns the daemon metrics.
    #[must_use]
    pub const fn daemon_metrics(&self) -> &DaemonMetrics {
        &self.daemon_metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry for use across the daemon.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> MetricsResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

/// Router exposing `GET /metrics`.
pub fn router(registry: SharedMetricsRegistry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}

async fn metrics_handler(State(registry): State<SharedMetricsRegistry>) -> impl IntoResponse {
    match registry.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        },
    }
}

/// Serves the metrics endpoint on `127.0.0.1:port` until `shutdown`
/// resolves.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn serve(
    registry: SharedMetricsRegistry,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> MetricsResult<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Metrics endpoint listening");
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Truncates a label value on a UTF-8 boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        value
    } else {
        let end = value
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
            .last()
            .unwrap_or(0);
        &value[..end]
    }
}
