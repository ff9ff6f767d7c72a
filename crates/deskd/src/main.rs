use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use deskd::Config;
use deskd::config::LoggingConfig;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Desktop telemetry agent for MQTT and Home Assistant
#[derive(Parser, Debug)]
#[command(name = "deskd", version)]
struct Args {
    /// Path to the configuration file
    #[arg(default_value = "deskd.toml")]
    config: PathBuf,

    /// Validate the configuration and whitelist, then exit
    #[arg(long)]
    check: bool,
}

fn init_logging(logging: &LoggingConfig) {
    let filter = filter::Targets::new()
        .with_default(LevelFilter::from(logging.level))
        .with_targets(
            logging
                .overrides
                .iter()
                .map(|(target, level)| (target.clone(), LevelFilter::from(*level))),
        );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(filter)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    init_logging(&config.logging);
    tracing::info!("deskd {} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("Loaded config from: {}", args.config.display());

    if args.check {
        let whitelist = deskd::agent::load_whitelist(&config)?;
        tracing::info!("Whitelist OK: {} commands", whitelist.len());
        tracing::info!("Configuration OK");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let agent = deskd::agent::run(config, shutdown.clone());
    tokio::pin!(agent);

    tokio::select! {
        result = &mut agent => return result,
        _ = shutdown_signal() => shutdown.cancel(),
    }

    agent.await
}
