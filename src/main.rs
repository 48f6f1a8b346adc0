//! tool-gate daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────────┐
//!                 │                         GATE                              │
//!                 │                                                           │
//!   operation ───▶│  rate limit ─▶ admission ─▶ op gate ─▶ suspicion ─▶      │
//!   caller        │  sanitize ─▶ structure ─▶ monitor ─▶ cache ─▶ tool ──────┼──▶ result
//!   parameters    │                                                           │
//!                 │  ┌────────────────────────────────────────────────────┐  │
//!                 │  │ background: cache TTL sweep, rate window sweep,     │  │
//!                 │  │ audit retention, resource sampler, history sweep    │  │
//!                 │  └────────────────────────────────────────────────────┘  │
//!                 │  admin HTTP (read-only) · Prometheus · config reload      │
//!                 └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use tool_gate::admin::setup_admin_router;
use tool_gate::config::{load_config, ConfigWatcher, GateConfig};
use tool_gate::lifecycle::{wait_for_shutdown_signal, Shutdown};
use tool_gate::observability::{logging, metrics};
use tool_gate::Gate;

#[derive(Parser)]
#[command(name = "tool-gate")]
#[command(about = "Governance layer for tool execution", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "TOOL_GATE_CONFIG")]
    config: Option<PathBuf>,

    /// Reload rate limits when the configuration file changes.
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GateConfig::default(),
    };

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tool-gate starting");
    if args.config.is_none() {
        tracing::warn!("No configuration file given, using defaults");
    }

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let admin = config.admin.clone();
    let gate = Arc::new(Gate::new(config)?);
    gate.start();

    let shutdown = Shutdown::new();

    // The watcher stops when dropped, so keep it for the life of main.
    let _watcher = match (&args.config, args.watch) {
        (Some(path), true) => {
            let (watcher, mut updates) = ConfigWatcher::new(path, &gate.config());
            let watcher = watcher.run()?;
            let gate = gate.clone();
            let mut stop = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        Some(config) = updates.recv() => gate.apply_config(config),
                        _ = stop.recv() => break,
                    }
                }
            });
            Some(watcher)
        }
        _ => None,
    };

    if admin.enabled {
        let listener = TcpListener::bind(&admin.bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Admin API listening");
        let router = setup_admin_router(gate.clone());
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin API server failed");
            }
        });
    }

    wait_for_shutdown_signal().await;
    tracing::info!("Shutting down");
    shutdown.trigger();
    gate.destroy().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
