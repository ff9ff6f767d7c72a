use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::install;
use super::source::Release;
use super::source::ReleaseSource;
use super::version::Channel;
use super::version::Version;

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("update check failed: {0}")]
    CheckFailure(String),

    #[error("failed to apply update: {0}")]
    ApplyFailure(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Retained state document of the update entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateStatus {
    pub installed_version: String,
    pub latest_version: String,
    pub title: Option<String>,
    pub release_summary: Option<String>,
    pub release_url: Option<String>,
    pub in_progress: bool,
}

impl UpdateStatus {
    /// Status before any check: the installed version is also the latest known.
    pub fn idle(installed: &str) -> Self {
        Self {
            installed_version: installed.to_string(),
            latest_version: installed.to_string(),
            title: None,
            release_summary: None,
            release_url: None,
            in_progress: false,
        }
    }
}

/// Kept by the agent to observe the manager and trigger installs.
pub struct UpdateHandle {
    pub status: watch::Receiver<UpdateStatus>,
    pub install: mpsc::Sender<()>,
}

/// Periodically checks a release channel and installs newer releases.
///
/// Check and download failures are logged and retried on the next interval.
pub struct UpdateManager {
    source: Arc<dyn ReleaseSource>,
    channel: Channel,
    interval: Duration,
    auto_install: bool,
    install_path: PathBuf,
    installed: Version,
    pending: Option<Release>,
    status: watch::Sender<UpdateStatus>,
    install: mpsc::Receiver<()>,
}

impl UpdateManager {
    pub fn new(
        source: Arc<dyn ReleaseSource>,
        channel: Channel,
        interval: Duration,
        installed: Version,
        install_path: PathBuf,
    ) -> (Self, UpdateHandle) {
        let (status_tx, status_rx) = watch::channel(UpdateStatus::idle(&installed.to_string()));
        let (install_tx, install_rx) = mpsc::channel(1);
        let manager = Self {
            source,
            channel,
            interval,
            auto_install: false,
            install_path,
            installed,
            pending: None,
            status: status_tx,
            install: install_rx,
        };
        let handle = UpdateHandle {
            status: status_rx,
            install: install_tx,
        };
        (manager, handle)
    }

    pub fn with_auto_install(mut self, auto_install: bool) -> Self {
        self.auto_install = auto_install;
        self
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Checking the {} channel for updates every {:?}",
            self.channel, self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check().await;
                    if self.auto_install && self.pending.is_some() {
                        self.apply(&cancel).await;
                    }
                }
                Some(()) = self.install.recv() => self.apply(&cancel).await,
            }
        }
        debug!("Update manager stopped");
    }

    async fn check(&mut self) {
        let release = match self.source.latest(self.channel).await {
            Ok(release) => release,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };

        match release {
            Some(release) if release.version > self.installed => {
                if self.pending.as_ref().map(|p| &p.version) != Some(&release.version) {
                    info!("Update available: {} -> {}", self.installed, release.version);
                }
                self.status.send_modify(|s| {
                    s.latest_version = release.version.to_string();
                    s.title = Some(release.title.clone());
                    s.release_summary = release.summary.clone();
                    s.release_url = release.url.clone();
                });
                self.pending = Some(release);
            }
            _ => {
                debug!("No update available for {}", self.installed);
                self.pending = None;
                let installed = self.installed.to_string();
                self.status.send_if_modified(|s| {
                    let changed = s.latest_version != installed;
                    s.latest_version = installed;
                    changed
                });
            }
        }
    }

    async fn apply(&mut self, cancel: &CancellationToken) {
        let Some(release) = self.pending.clone() else {
            info!("Install requested but no update is available");
            return;
        };

        info!("Installing update {}", release.version);
        self.status.send_modify(|s| s.in_progress = true);

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(UpdateError::ApplyFailure("cancelled by shutdown".to_string())),
            result = self.download_and_install(&release) => result,
        };

        match result {
            Ok(()) => {
                info!(
                    "Installed {} to {}; it takes effect after a restart",
                    release.version,
                    self.install_path.display()
                );
                self.installed = release.version.clone();
                self.pending = None;
                self.status.send_modify(|s| {
                    s.installed_version = release.version.to_string();
                    s.in_progress = false;
                });
            }
            Err(e) => {
                warn!("Update to {} failed: {}", release.version, e);
                self.status.send_modify(|s| s.in_progress = false);
            }
        }
    }

    async fn download_and_install(&self, release: &Release) -> Result<(), UpdateError> {
        let artifact = self.source.fetch(release).await?;
        let target = self.install_path.clone();
        tokio::task::spawn_blocking(move || install::install(&target, &artifact))
            .await
            .map_err(|e| UpdateError::ApplyFailure(e.to_string()))?
    }
}
