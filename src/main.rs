//! Main entry point for the kline-cache CLI

use clap::Parser;
use kline_cache::cli::{Cli, Commands};
use kline_cache::metrics::init_metrics;
use kline_cache::shutdown::ShutdownCoordinator;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kline_cache=info"));

    // Logs go to stderr so command output on stdout stays machine-readable
    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    if let Some(addr) = cli.metrics_addr {
        match init_metrics(addr) {
            Ok(()) => info!(addr = %addr, "Prometheus metrics endpoint started"),
            Err(e) => {
                error!("Failed to start metrics endpoint: {}", e);
                std::process::exit(1);
            }
        }
    }

    let shutdown = ShutdownCoordinator::shared();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl+C received - finishing in-flight requests, committed data is kept");
                shutdown.request_shutdown();
            }
        }
    });

    let result = match &cli.command {
        Commands::Fetch(args) => args.execute(&cli, shutdown.clone()).await,
        Commands::Pairs(args) => args.execute(&cli).await,
        Commands::Coverage(args) => args.execute(&cli).await,
        Commands::Verify(args) => args.execute(&cli).await,
    }
    .map_err(|e| anyhow::anyhow!(e));

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
}
