//! battd - privileged battery-management daemon
//!
//! Listens on the control socket, admits peers by code identity and runs
//! privileged power operations for authorized clients.
//!
//! # Startup
//!
//! 1. Parse arguments and initialize logging
//! 2. Load `battd.toml` and freeze the policy
//! 3. Build the trust store, the catalog backed verifier and the gate
//! 4. Bind the control socket and serve until SIGTERM or SIGINT
//!
//! # Metrics
//!
//! With `--metrics-port`, Prometheus metrics are served at
//! `http://127.0.0.1:<port>/metrics`.
//!
//! # Runtime
//!
//! `main` is synchronous and builds the multi-threaded Tokio runtime
//! itself, after argument parsing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use battd_core::AuthorizationGate;
use battd_core::config::BattdConfig;
use battd_daemon::metrics::{self, SharedMetricsRegistry, new_shared_registry};
use battd_daemon::platform::catalog::digest_path;
use battd_daemon::platform::{Catalog, ProcFs, ProcfsVerifier, TrustStore};
use battd_daemon::power::InMemoryPower;
use battd_daemon::protocol::{ProtocolServer, ServerConfig, handle_connection};
use battd_daemon::state::{DaemonState, SharedState};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// battd - privileged battery-management daemon
#[derive(Parser, Debug)]
#[command(name = "battd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/battd/battd.toml")]
    config: PathBuf,

    /// Control socket path (overrides `daemon.socket`)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Port for the Prometheus metrics endpoint
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Disable the Prometheus metrics endpoint
    #[arg(long)]
    no_metrics: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    init_tracing(&args)?;

    let mut config = BattdConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(socket) = &args.socket {
        config.daemon.socket.clone_from(socket);
    }

    let metrics_registry = match args.metrics_port {
        Some(_) if !args.no_metrics => {
            Some(new_shared_registry().context("failed to initialize metrics registry")?)
        },
        _ => None,
    };

    let state = build_state(&config, metrics_registry.clone())?;
    info!(
        common_name = %state.gate().rule().expected_common_name(),
        cache = ?config.cache_policy(),
        daemon_id = state.daemon_id().unwrap_or("unknown"),
        "Policy loaded"
    );

    write_pid_file(&config.daemon.pid_file)?;

    let server = ProtocolServer::bind(
        ServerConfig::new(&config.daemon.socket)
            .with_max_connections(config.daemon.max_connections),
    )
    .context("failed to bind control socket")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_task = match (metrics_registry, args.metrics_port) {
        (Some(registry), Some(port)) => {
            let shutdown = wait_for_shutdown(shutdown_rx.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = metrics::serve(registry, port, shutdown).await {
                    error!("Metrics server error: {e}");
                }
            }))
        },
        _ => {
            info!("Metrics HTTP server disabled");
            None
        },
    };

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    let signal_state = Arc::clone(&state);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        signal_state.request_shutdown();
        let _ = shutdown_tx.send(true);
    });

    info!(socket = %server.socket_path().display(), "battd started");
    serve(&server, &state, shutdown_rx).await;

    info!("Shutting down daemon...");
    drop(server);
    if let Some(task) = metrics_task {
        if let Err(e) = task.await {
            warn!("Metrics task failed: {e}");
        }
    }
    remove_pid_file(&config.daemon.pid_file);
    info!(uptime_secs = state.uptime_secs(), "battd stopped");
    Ok(())
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Builds the verifier, the gate and the shared state from `config`.
fn build_state(
    config: &BattdConfig,
    metrics_registry: Option<SharedMetricsRegistry>,
) -> Result<SharedState<ProcfsVerifier>> {
    let trust = TrustStore::from_config(&config.catalog).context("invalid [catalog] signers")?;
    if trust.signer_count() == 0 {
        warn!("No trusted catalog signers configured; every peer will be denied");
    }
    let verifier = ProcfsVerifier::new(ProcFs::system(), Catalog::new(&config.catalog.dir), trust);

    let mut gate = AuthorizationGate::new(verifier, Arc::new(config.policy_rule()))
        .with_cache_policy(config.cache_policy())
        .with_subsystem_retries(config.gate.subsystem_retries);
    if let Some(registry) = &metrics_registry {
        gate = gate.with_observer(Arc::new(registry.daemon_metrics().clone()));
    }

    let mut state = DaemonState::new(gate, Arc::new(InMemoryPower::new())).with_handshake_timeout(
        Duration::from_millis(config.daemon.handshake_timeout_ms),
    );
    match digest_path(Path::new("/proc/self/exe")) {
        Ok(digest) => state = state.with_daemon_id(hex::encode(digest)),
        Err(e) => warn!("Could not hash daemon image: {e}"),
    }
    if let Some(registry) = metrics_registry {
        state = state.with_metrics(registry);
    }
    Ok(Arc::new(state))
}

/// Accept loop. Returns once shutdown is requested.
async fn serve(
    server: &ProtocolServer,
    state: &SharedState<ProcfsVerifier>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = server.accept() => match accepted {
                Ok((connection, permit)) => {
                    let state = Arc::clone(state);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handle_connection(connection, state).await {
                            debug!("Connection ended with error: {e:#}");
                        }
                    });
                },
                Err(e) => warn!("Accept failed: {e}"),
            },
        }
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    // A dropped sender also means shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Writes the PID file via a temporary file and rename.
fn write_pid_file(pid_path: &Path) -> Result<()> {
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = pid_path.with_extension("pid.tmp");
    std::fs::write(&tmp, std::process::id().to_string()).context("failed to write PID file")?;
    std::fs::rename(&tmp, pid_path).context("failed to write PID file atomically")?;
    info!("PID file written to {}", pid_path.display());
    Ok(())
}

fn remove_pid_file(pid_path: &Path) {
    if pid_path.exists() {
        if let Err(e) = std::fs::remove_file(pid_path) {
            warn!("Failed to remove PID file: {e}");
        }
    }
}
