//! Discovery Pipeline service
//!
//! Loads configuration, installs logging and the metrics endpoint, then runs
//! the fetch and inference stages until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use discovery_pipeline::telemetry::init_metrics;
use discovery_pipeline::{Config, Pipeline};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.log_level);

    info!(
        topic = %config.kafka_topic,
        brokers = %config.kafka_bootstrap_server,
        batch_size = config.batch_size,
        threshold = config.confidence_threshold,
        "Starting discovery pipeline"
    );

    init_metrics(config.metrics_port)?;

    let pipeline = Pipeline::new(config);
    pipeline.run(shutdown_signal()).await?;

    info!("Discovery pipeline stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Wait for SIGINT or SIGTERM. A handler that cannot be installed is logged
/// and never fires, leaving the other one in charge.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
