//! Startup and shutdown of the agent's tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::api;
use crate::commands::CommandDispatcher;
use crate::commands::Whitelist;
use crate::commands::WhitelistError;
use crate::config::Config;
use crate::device::Device;
use crate::engine::ModuleScheduler;
use crate::engine::StatusAggregator;
use crate::engine::providers_from_config;
use crate::mqtt::Backoff;
use crate::mqtt::BrokerSession;
use crate::mqtt::RumqttcTransport;
use crate::mqtt::Topics;
use crate::mqtt::relay_commands;
use crate::update::HttpReleaseSource;
use crate::update::UpdateManager;
use crate::update::Version;

/// Queued broker command requests before new ones are rejected
const COMMAND_QUEUE_SIZE: usize = 32;

/// Upper bound on waiting for a task to stop during shutdown
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Load the command whitelist. A missing file leaves the agent without commands.
pub fn load_whitelist(config: &Config) -> anyhow::Result<Whitelist> {
    if !config.commands.enabled {
        info!("Remote commands are disabled");
        return Ok(Whitelist::empty());
    }
    match Whitelist::load(&config.commands.whitelist) {
        Ok(whitelist) => Ok(whitelist),
        Err(WhitelistError::Io(path, e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "Whitelist {} not found; no commands are available",
                path.display()
            );
            Ok(Whitelist::empty())
        }
        Err(e) => Err(e).context("Failed to load command whitelist"),
    }
}

async fn stop(name: &str, cancel: &CancellationToken, task: Option<JoinHandle<()>>) {
    cancel.cancel();
    let Some(task) = task else {
        return;
    };
    match tokio::time::timeout(STOP_TIMEOUT, task).await {
        Ok(Ok(())) => info!("[{}] stopped", name),
        Ok(Err(e)) => warn!("[{}] task ended abnormally: {}", name, e),
        Err(_) => warn!("[{}] did not stop within {:?}", name, STOP_TIMEOUT),
    }
}

/// Run the agent until `shutdown` is cancelled.
///
/// Shutdown order: the broker session (publishing `offline`), the modules, the HTTP API,
/// the updater, and finally the command relay.
pub async fn run(config: Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let whitelist = load_whitelist(&config)?;
    let dispatcher = Arc::new(CommandDispatcher::new(
        whitelist,
        Duration::from_secs(config.commands.timeout),
        shutdown.child_token(),
    ));

    let aggregator = Arc::new(StatusAggregator::new());
    let providers = providers_from_config(&config);

    let mut device = Device::from_config(&config, dispatcher.available_commands());
    // Only modules whose provider was built get entities.
    device.modules = providers.iter().map(|p| p.kind()).collect();
    let device = Arc::new(device);
    info!(
        "Device '{}' ({}) with modules {:?} and {} commands",
        device.name,
        device.id,
        device.modules,
        device.commands.len()
    );

    let topics = Topics::new(
        &config.mqtt.base_topic,
        &device.id,
        &config.mqtt.discovery_prefix,
    );
    let client_id = config
        .mqtt
        .client_id
        .clone()
        .unwrap_or_else(|| format!("deskd-{}", device.id));
    let transport = RumqttcTransport::new(&config.mqtt, &client_id, &topics.availability());
    let backoff = Backoff::new(
        Duration::from_secs(config.mqtt.min_reconnect_delay),
        Duration::from_secs(config.mqtt.max_reconnect_delay),
    );
    let (mut session, session_handle) = BrokerSession::new(
        transport,
        topics.clone(),
        device.clone(),
        aggregator.clone(),
        backoff,
    );

    let relay_cancel = CancellationToken::new();
    let relay_task = if config.commands.enabled {
        let (requests_tx, requests_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        session = session.with_commands(requests_tx);
        Some(tokio::spawn(relay_commands(
            dispatcher.clone(),
            requests_rx,
            session_handle.outbound.clone(),
            topics.run_result(),
            relay_cancel.clone(),
        )))
    } else {
        None
    };

    let update_cancel = CancellationToken::new();
    let update_task = if config.updates.enabled {
        let url = config
            .updates
            .release_url
            .clone()
            .context("updates.release_url is required")?;
        let source = Arc::new(HttpReleaseSource::new(url)?);
        let installed: Version = env!("CARGO_PKG_VERSION").parse()?;
        let install_path = match &config.updates.install_path {
            Some(path) => path.clone(),
            None => std::env::current_exe().context("Failed to locate the running binary")?,
        };
        let (manager, handle) = UpdateManager::new(
            source,
            config.updates.channel,
            Duration::from_secs(config.updates.interval),
            installed,
            install_path,
        );
        session = session.with_updates(handle.status, handle.install);
        Some(tokio::spawn(
            manager
                .with_auto_install(config.updates.auto_install)
                .run(update_cancel.clone()),
        ))
    } else {
        None
    };

    let session_cancel = CancellationToken::new();
    let session_task = tokio::spawn(session.run(session_cancel.clone()));

    let mut scheduler = ModuleScheduler::new(aggregator.clone(), CancellationToken::new());
    for provider in providers {
        let interval = config.modules.interval(provider.kind());
        scheduler.start(provider, interval);
    }

    let api_cancel = CancellationToken::new();
    let api_task = if config.api.enabled {
        let state = Arc::new(api::AppState {
            aggregator: aggregator.clone(),
            dispatcher: dispatcher.clone(),
            auth_token: config.api.auth_token.clone(),
        });
        let listen = config.api.listen.clone();
        let port = config.api.port;
        let cancel = api_cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(&listen, port, state, cancel).await {
                error!("HTTP API server failed: {:#}", e);
            }
        }))
    } else {
        None
    };

    info!("deskd running");
    shutdown.cancelled().await;
    info!("Shutting down");

    stop("mqtt", &session_cancel, Some(session_task)).await;
    scheduler.shutdown().await;
    stop("api", &api_cancel, api_task).await;
    stop("updates", &update_cancel, update_task).await;
    stop("commands", &relay_cancel, relay_task).await;

    info!("deskd shutdown complete");
    Ok(())
}
