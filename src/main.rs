//! Threat blocker CLI.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use threat_blocker::{Config, ThreatBlocker};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "threat-blocker")]
#[command(about = "Block requests from known-malicious IPs, refreshed from threat intelligence feeds")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "threat-blocker.yaml")]
    config: PathBuf,

    /// Listen address, overrides server.listen
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Run a single refresh cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let listen = args.listen.unwrap_or(config.server.listen);
    let blocker = ThreatBlocker::new(config)?;

    if args.once {
        match blocker.admin().trigger_refresh().await {
            Some(outcome) => info!(
                created = outcome.created,
                updated = outcome.updated,
                failed = outcome.failed,
                status = ?outcome.status(),
                "Refresh finished"
            ),
            None => warn!("Refresh already running"),
        }
        return Ok(());
    }

    blocker.start();

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    info!(listen = %listen, "Threat blocker listening");

    axum::serve(
        listener,
        blocker
            .router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    blocker.scheduler().stop();
    info!("Threat blocker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
