//! slipwayd — the Slipway daemon.
//!
//! Single binary that assembles the orchestrator for one service:
//! - State store (redb)
//! - Traffic controller over the local scheduler and load balancer
//! - Health probe
//! - Artifact event listener + pipeline
//! - Admission coordinator (runs deployment state machines)
//! - Autoscaler
//! - REST API
//!
//! # Usage
//!
//! ```text
//! slipwayd init --name api --repository registry.example.com/team/api
//! slipwayd serve --config slipway.toml --port 7400 --data-dir /var/lib/slipway
//! ```

mod services;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use slipway_core::SlipwayConfig;
use slipway_state::StateStore;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::services::Services;

const DEFAULT_FILTER: &str = "info,slipway=debug,slipwayd=debug";

#[derive(Parser)]
#[command(name = "slipwayd", about = "Slipway blue-green deployment daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator and its REST API.
    Serve {
        /// Path to slipway.toml.
        #[arg(long, default_value = "slipway.toml")]
        config: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "7400")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/slipway")]
        data_dir: PathBuf,
    },
    /// Write a starter slipway.toml.
    Init {
        #[arg(long)]
        name: String,

        /// Image repository, e.g. registry.example.com/team/api.
        #[arg(long)]
        repository: String,

        #[arg(long, default_value = "slipway.toml")]
        output: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => run_serve(config, port, data_dir).await,
        Command::Init {
            name,
            repository,
            output,
        } => run_init(&name, &repository, output),
    }
}

fn run_init(name: &str, repository: &str, output: PathBuf) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    let config = SlipwayConfig::scaffold(name, repository);
    config.validate()?;
    std::fs::write(&output, config.to_toml_string()?)
        .with_context(|| format!("writing {}", output.display()))?;
    info!(path = %output.display(), service = %name, "configuration written");
    Ok(())
}

async fn run_serve(config_path: PathBuf, port: u16, data_dir: PathBuf) -> anyhow::Result<()> {
    let config = SlipwayConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(
        service = %config.service.name,
        repository = %config.service.repository,
        "Slipway daemon starting"
    );

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("slipway.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let services = Services::assemble(config, store);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let coordinator = services.coordinator();
    let coordinator_handle = tokio::spawn(coordinator.run(shutdown_rx.clone()));

    let autoscale = &services.config.autoscale;
    let autoscale_handle = if autoscale.enabled {
        let mut autoscaler = services.autoscaler();
        let interval = autoscale.interval();
        let shutdown = shutdown_rx.clone();
        info!(interval = ?interval, "autoscaler initialized");
        Some(tokio::spawn(async move { autoscaler.run(interval, shutdown).await }))
    } else {
        info!("autoscaler disabled");
        None
    };

    // ── Start API server ───────────────────────────────────────

    let router = services.router();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    // In-flight deployments stop at their last persisted state and resume
    // on the next start.
    let _ = shutdown_tx.send(true);
    let _ = coordinator_handle.await;
    if let Some(handle) = autoscale_handle {
        let _ = handle.await;
    }

    info!("Slipway daemon stopped");
    Ok(())
}
