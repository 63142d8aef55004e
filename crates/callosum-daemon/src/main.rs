//! callosum-daemon - the shared gate process.
//!
//! Runs the action gate as a single serializing process over one state
//! directory and exposes the decision procedure over HTTP. Sessions in
//! remote mode delegate every pre-call and post-call event here, which
//! makes cross-process coordination race-free: there is exactly one
//! writer for the journal, the lock table, and the context record.

mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use callosum_core::{Gate, GateConfig};

/// callosum gate daemon - shared coordination for multi-session agents
#[derive(Parser, Debug)]
#[command(name = "callosum-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a gate configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// State directory (overrides the configuration file)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Rule file path (overrides the configuration file)
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Address to bind the HTTP surface to
    #[arg(long, default_value = "127.0.0.1:7878")]
    bind: SocketAddr,

    /// Instance id the daemon journals maintenance actions under
    #[arg(long, default_value = "daemon")]
    instance_id: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => GateConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => GateConfig::new(args.instance_id.clone()),
    };
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }
    if let Some(rules) = args.rules {
        config.rules_file = Some(rules);
    }
    // The daemon is the serializing backend; it never delegates outward.
    config.mode = callosum_core::GateMode::Local;

    let gate = Arc::new(Gate::new(config).context("starting gate")?);

    let pruned = gate.store().prune_stale_locks().unwrap_or(0);
    if pruned > 0 {
        info!(pruned, "dropped expired locks left by earlier sessions");
    }

    let app = routes::router(gate);
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!(addr = %args.bind, "gate daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    info!("gate daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
