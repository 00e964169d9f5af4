#![forbid(unsafe_code)]

//! **via-daemon** – Vector Incident Atlas service binary.
//!
//! Loads environment configuration, starts the detection engine, and serves
//! the HTTP API until a shutdown signal arrives.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (embedded memory engine)
//! via-daemon
//!
//! # Custom bind address and verbose engine logs
//! via-daemon --bind 127.0.0.1:9100 --log-level debug
//!
//! # Load a specific .env file first
//! via-daemon --env-file ./deploy/staging.env
//! ```
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 vector backend
//! unreachable at startup, 3 unrecoverable internal error.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use via_runtime::{Config, Runtime, StartupError};

mod api;

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "via-daemon")]
#[command(about = "Vector Incident Atlas - two-tiered log-intelligence engine")]
#[command(version)]
struct Cli {
    /// Address the HTTP API binds to
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Explicit .env file to load before reading the environment
    #[arg(long)]
    env_file: Option<String>,
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            dotenv::from_filename(path).ok();
        }
        None => {
            dotenv::dotenv().ok();
        }
    }

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    info!("Starting Vector Incident Atlas v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    let runtime = match Runtime::start(config).await {
        Ok(runtime) => Arc::new(runtime),
        Err(e @ StartupError::Config(_)) => {
            error!("{e}");
            return ExitCode::from(1);
        }
        Err(e @ StartupError::BackendUnreachable(_)) => {
            error!("{e}");
            return ExitCode::from(2);
        }
        Err(e) => {
            error!("{e}");
            return ExitCode::from(3);
        }
    };

    match serve(runtime, &cli.bind).await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(3)
        }
    }
}

async fn serve(runtime: Arc<Runtime>, bind: &str) -> Result<()> {
    let app = api::router(runtime);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!("HTTP API listening on {bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP API")?;
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("via={log_level},via_daemon={log_level},via_runtime={log_level},via_tier1={log_level},via_ingest={log_level},via_promotion={log_level},via_federation={log_level},via_control={log_level},via_forensic={log_level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received terminate signal"),
    }
}
