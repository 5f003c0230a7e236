use std::time::Duration;

use clap::{Parser, Subcommand};

mod client;
mod commands;

use client::ApiClient;
use commands::follow::Follow;

#[derive(Parser)]
#[command(
    name = "slipway",
    about = "Slipway — blue-green deployments for one service",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Daemon address.
    #[arg(long, global = true, env = "SLIPWAY_SERVER", default_value = "http://127.0.0.1:7400")]
    server: String,

    /// How long to follow a deployment before giving up (e.g. 30m).
    #[arg(long, global = true, default_value = "30m", value_parser = duration)]
    timeout: Duration,

    /// Polling interval while following.
    #[arg(long, global = true, default_value = "2s", value_parser = duration)]
    poll_interval: Duration,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a version for deployment and follow it to completion.
    ///
    /// Exit codes: 0 completed (or skipped), 2 invalid artifact, 3 pipeline
    /// failure, 4 provisioning failure, 5 validation failure, 6 rollback
    /// failure, 7 rolled back for any other reason.
    Deploy {
        /// Artifact version (image tag).
        version: String,
        /// Return as soon as the request is queued.
        #[arg(long)]
        no_wait: bool,
    },
    /// Show pools, listeners, the active deployment and the queue.
    Status,
    /// Roll back the active deployment, or redeploy the previous version.
    Rollback {
        #[arg(long)]
        no_wait: bool,
    },
    /// Cancel the active deployment.
    Cancel {
        #[arg(long)]
        no_wait: bool,
    },
    /// Approve the active deployment's production shift.
    Approve,
    /// Reject the active deployment's production shift.
    Reject {
        #[arg(long)]
        reason: Option<String>,
    },
}

fn duration(s: &str) -> Result<Duration, String> {
    slipway_core::parse_duration(s).ok_or_else(|| format!("invalid duration: {s}"))
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    // Individual calls get a short budget; following uses --timeout.
    let client = ApiClient::new(&cli.server, Duration::from_secs(10))?;
    let follow = Follow {
        interval: cli.poll_interval,
        timeout: cli.timeout,
    };
    let wait = |no_wait: bool| (!no_wait).then_some(follow);

    match cli.command {
        Commands::Deploy { version, no_wait } => commands::deploy(&client, &version, wait(no_wait)).await,
        Commands::Status => commands::status(&client).await,
        Commands::Rollback { no_wait } => commands::rollback(&client, wait(no_wait)).await,
        Commands::Cancel { no_wait } => commands::cancel(&client, wait(no_wait)).await,
        Commands::Approve => commands::approve(&client).await,
        Commands::Reject { reason } => commands::reject(&client, reason).await,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}
