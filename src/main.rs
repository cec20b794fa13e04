//! Gatekeeper - operational host for the in-process auth guards.
//!
//! Builds the rate limiters, user cache and OAuth state store from
//! configuration, runs their background maintenance, and serves health,
//! stats and metrics endpoints until SIGINT or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use gatekeeper::config::{self, AppConfig};
use gatekeeper::guard::Guard;
use gatekeeper::metrics::Metrics;
use gatekeeper::server::HealthServer;
use gatekeeper::shutdown::{self, ShutdownHandler};
use gatekeeper::state_store;

/// Gatekeeper - in-process guards for an authentication backend
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.toml", global = true)]
    config: String,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Print a fresh OAuth state token and pending-link token
    GenerateTokens,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::GenerateTokens) = args.command {
        println!("state: {}", state_store::generate_state_token());
        println!("link:  {}", state_store::generate_link_token());
        return Ok(());
    }

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    init_logging(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = %args.config,
        "Starting Gatekeeper"
    );

    let metrics = if config.metrics.enabled {
        let metrics = Metrics::new().context("Failed to register metrics")?;
        metrics.init_server_info(env!("CARGO_PKG_VERSION"));
        Some(metrics)
    } else {
        None
    };

    let guard = Arc::new(
        Guard::build(&config, metrics.clone()).context("Failed to build request guards")?,
    );

    let shutdown = ShutdownHandler::new();

    let health_server = HealthServer::new(config.health.clone(), guard.clone(), metrics);
    let health_shutdown = shutdown.subscribe();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.run(health_shutdown).await {
            error!(error = %e, "Health server error");
        }
    });

    let maintenance_handle =
        guard.spawn_maintenance(config.user_cache.cleanup_interval(), shutdown.subscribe());

    info!("Gatekeeper running");

    shutdown.wait_for_signal().await;

    info!("Initiating graceful shutdown");

    shutdown::graceful_shutdown(
        Duration::from_secs(config.server.shutdown_timeout_secs),
        || async {
            guard.close().await;
            let _ = tokio::join!(health_handle, maintenance_handle);
        },
    )
    .await;

    info!("Gatekeeper stopped");
    Ok(())
}

/// Initialize the tracing subscriber based on configuration.
fn init_logging(config: &config::LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .try_init()?;
        }
        "pretty" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .try_init()?;
        }
        "off" => {}
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .try_init()?;
        }
    }

    Ok(())
}
