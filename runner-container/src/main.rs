use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use notify_core::config::{NotifyConfig, load_config};
use notify_core::consumer::Consumer;
use notify_core::processor::NotifyProcessor;
use notify_core::sink::delta::DeltaArchive;
use notify_core::sink::kafka::KafkaPublisher;
use notify_core::source::kafka::KafkaConnector;
use notify_core::telemetry::init_tracing;

/// Publishes canal change batches as notifications and archives them.
#[derive(Debug, Parser)]
#[command(name = "cdc-notify", version)]
struct Cli {
    /// Configuration file. Without it the YAML document is read from the
    /// NOTIFY_CONFIG environment variable.
    #[arg(short = 'c', long = "config", env = "NOTIFY_CONFIG_PATH")]
    config: Option<String>,
}

/// This is the entry point for running the long-lived notifier on container
/// hosting services like AWS EKS, ECS, etc.
///
/// What it does at a high-level:
///     Load config.
///     Open one connection per destination, the producer and the archive.
///     Main loop runs until a shutdown signal is received:
///         - consume change batches from every destination
///         - publish a notice per batch, archive it, ack or roll back
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let result = run(config, shutdown).await;
    info!("ByeBye!");
    result
}

async fn run(config: NotifyConfig, shutdown: CancellationToken) -> Result<()> {
    // Sinks are opened before any destination so a sink failure leaves no
    // connection behind.
    let publisher =
        KafkaPublisher::new(&config.publisher).context("Failed to create notice producer")?;

    let archive = match config.archive.table_uri.as_deref() {
        Some(table_uri) if config.archive.enabled => {
            deltalake::aws::register_handlers(None);
            Some(
                DeltaArchive::new(table_uri)
                    .await
                    .context("Failed to open archive table")?,
            )
        }
        _ => None,
    };

    let connector = KafkaConnector::new(config.source.clone());
    let consumer = Consumer::connect(
        &config.source.destinations,
        &connector,
        config.consumer_options(),
        shutdown,
    )
    .await
    .context("Failed to connect to destinations")?;

    info!(
        destinations = ?consumer.destinations().collect::<Vec<_>>(),
        bootstrap_servers = %config.source.bootstrap_servers,
        "Ready to consume change batches"
    );

    let mut processor = NotifyProcessor::new(config.table_name.clone(), publisher, archive);
    let report = consumer.run(&mut processor).await?;

    let (publisher, _archive) = processor.into_parts();
    if let Err(err) = publisher.flush(Duration::from_secs(5)) {
        warn!(error = %err, "Failed to flush notice producer");
    }

    for failure in &report.failures {
        warn!(destination = %failure.destination, error = %failure.error, "Destination stopped with an error");
    }
    info!(metrics = ?report.metrics, "Final metrics");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
