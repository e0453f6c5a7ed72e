#![forbid(unsafe_code)]

//! `save-orchestrator`: agent lifecycle and heartbeat service binary.
//!
//! Bootstraps configuration, wires the backend client and the container
//! runner, then runs the HTTP API, the crash watchdog and the prune task
//! until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use save_orchestrator::api::handler::AppState;
use save_orchestrator::api::http;
use save_orchestrator::backend::http::HttpBackend;
use save_orchestrator::config::GlobalConfig;
use save_orchestrator::orchestrator::watchdog::spawn_watchdog;
use save_orchestrator::runner::docker::DockerRunner;
use save_orchestrator::runner::prune::spawn_prune_task;
use save_orchestrator::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "save-orchestrator", about = "Agent lifecycle and heartbeat orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the HTTP port from the configuration file.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("save-orchestrator bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    config.apply_env_overrides()?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    info!(
        backend = %config.backend.url,
        port = config.http_port,
        "configuration loaded"
    );

    // ── Build shared application state ──────────────────
    let backend = Arc::new(HttpBackend::new(&config.backend)?);
    let runner = Arc::new(DockerRunner::new(config.docker.clone()));
    let prune_interval = Duration::from_secs(config.docker.prune_interval_seconds);
    let watchdog_interval = config.watchdog_interval();
    let state = Arc::new(AppState::new(config, backend, runner));

    // ── Start background tasks ──────────────────────────
    let ct = CancellationToken::new();
    let watchdog_handle =
        spawn_watchdog(Arc::clone(&state.watchdog), watchdog_interval, ct.clone());
    let prune_state = Arc::clone(&state);
    let prune_handle = spawn_prune_task(
        Arc::clone(&state.runner),
        prune_interval,
        move || prune_state.protected_executions(),
        ct.clone(),
    );
    info!("watchdog and prune tasks started");

    let http_ct = ct.clone();
    let http_state = Arc::clone(&state);
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http::serve(http_state, http_ct).await {
            error!(%err, "http server failed");
        }
    });

    info!("orchestrator ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let _ = tokio::join!(http_handle, watchdog_handle, prune_handle);
    info!("save-orchestrator shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
