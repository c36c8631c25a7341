//! Meterline CLI
//!
//! - `run`: start the ingestion pipeline and the observer API (default)
//! - `print-config`: emit a commented default config file
//! - `publish`: send one control message to the devices

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use meterline::config::{generate_default_config, Config};
use meterline::logging::init_logging;
use meterline::transport::{ConnectionManager, Credentials, MqttConnector};
use meterline::{serve, Pipeline};

#[derive(Parser)]
#[command(name = "meterline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Field-device telemetry ingestion and alerting")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: search standard locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until interrupted
    Run,

    /// Print a default config file
    PrintConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Publish a control message
    Publish {
        /// Topic (default: the configured control topic)
        #[arg(short, long)]
        topic: Option<String>,
        /// JSON payload
        #[arg(short, long)]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(&config.logging);
            run(config).await
        }
        Commands::PrintConfig { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    eprintln!("Config written to {}", path.display());
                }
                None => print!("{}", content),
            }
            Ok(())
        }
        Commands::Publish { topic, payload } => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(&config.logging);
            let topic = topic.unwrap_or_else(|| config.topics.control.clone());
            publish(&config, &topic, &payload).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(Config::load_default()),
    }
}

async fn run(config: Config) -> Result<()> {
    tracing::info!("Meterline v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Event store: {}", config.storage.resolved_path().display());

    let pipeline = Pipeline::build(config.clone()).context("Failed to build pipeline")?;

    let api_shutdown = CancellationToken::new();
    let api_state = pipeline.app_state();
    let api_config = config.api.clone();
    let api_token = api_shutdown.clone();
    let api = tokio::spawn(async move { serve(api_state, &api_config, api_token).await });

    if let Err(e) = pipeline.start().await {
        tracing::error!(error = %e, "Pipeline failed to start");
        pipeline.shutdown().await?;
        api_shutdown.cancel();
        let _ = api.await;
        return Err(e).context("Pipeline failed to start");
    }

    shutdown_signal().await;

    pipeline.shutdown().await.context("Pipeline shutdown failed")?;
    api_shutdown.cancel();
    match api.await {
        Ok(result) => result.context("API server failed")?,
        Err(e) => tracing::error!(error = %e, "API task failed"),
    }

    tracing::info!("Meterline shutdown complete");
    Ok(())
}

async fn publish(config: &Config, topic: &str, payload: &str) -> Result<()> {
    serde_json::from_str::<serde_json::Value>(payload).context("Payload is not valid JSON")?;

    let connector = Arc::new(MqttConnector::new(config.broker.inbound_capacity));
    let (transport, _inbound) = ConnectionManager::new(
        connector,
        config.broker.retry_policy(),
        config.broker.inbound_capacity,
    );

    transport
        .connect(Credentials::from_config(&config.broker))
        .await
        .context("Failed to connect to broker")?;

    let result = transport.publish(topic, payload.as_bytes().to_vec()).await;
    transport.disconnect().await;
    result.with_context(|| format!("Failed to publish to {}", topic))?;

    tracing::info!(topic = %topic, "Control message published");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
