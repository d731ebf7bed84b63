//! Shared daemon state.
//!
//! One [`DaemonState`] is built at startup and shared by every connection
//! task. Everything in it is either immutable after startup or internally
//! synchronized.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use battd_core::AuthorizationGate;

use crate::metrics::SharedMetricsRegistry;
use crate::power::PowerOperations;
use crate::protocol::HANDSHAKE_TIMEOUT;

/// Shared daemon state.
pub type SharedState<V> = Arc<DaemonState<V>>;

/// State shared by all connections.
pub struct DaemonState<V> {
    gate: AuthorizationGate<V>,
    power: Arc<dyn PowerOperations>,
    metrics: Option<SharedMetricsRegistry>,
    server_info: String,
    daemon_id: Option<String>,
    handshake_timeout: Duration,
    shutdown: AtomicBool,
    started_at: Instant,
}

impl<V> DaemonState<V> {
    /// Create the state.
    #[must_use]
    pub fn new(gate: AuthorizationGate<V>, power: Arc<dyn PowerOperations>) -> Self {
        Self {
            gate,
            power,
            metrics: None,
            server_info: format!("battd/{}", env!("CARGO_PKG_VERSION")),
            daemon_id: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            shutdown: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    /// Record request metrics in `registry`.
    #[must_use]
    pub fn with_metrics(mut self, registry: SharedMetricsRegistry) -> Self {
        self.metrics = Some(registry);
        self
    }

    /// Advertise `daemon_id` during the handshake.
    #[must_use]
    pub fn with_daemon_id(mut self, daemon_id: impl Into<String>) -> Self {
        self.daemon_id = Some(daemon_id.into());
        self
    }

    /// Give peers `timeout` to send their Hello.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// The authorization gate.
    #[must_use]
    pub const fn gate(&self) -> &AuthorizationGate<V> {
        &self.gate
    }

    /// The privileged operation surface.
    #[must_use]
    pub fn power(&self) -> &dyn PowerOperations {
        self.power.as_ref()
    }

    /// Metrics registry, if enabled.
    #[must_use]
    pub const fn metrics(&self) -> Option<&SharedMetricsRegistry> {
        self.metrics.as_ref()
    }

    /// Server identifier sent in the `HelloAck`.
    #[must_use]
    pub fn server_info(&self) -> &str {
        &self.server_info
    }

    /// Daemon image id sent in the `HelloAck`.
    #[must_use]
    pub fn daemon_id(&self) -> Option<&str> {
        self.daemon_id.as_deref()
    }

    /// Time a peer has to send its Hello.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Daemon uptime in seconds.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
