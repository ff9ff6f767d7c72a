use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::aggregator::StatusAggregator;
use super::provider::MetricProvider;
use super::state::ModuleKind;
use super::state::ModuleState;
use super::state::Phase;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("module {0} is not running")]
    NotRunning(ModuleKind),

    #[error("module {0} task failed: {1}")]
    TaskFailed(ModuleKind, String),
}

struct ModuleHandle {
    cancel: CancellationToken,
    task: JoinHandle<Box<dyn MetricProvider>>,
    state: watch::Receiver<ModuleState>,
}

/// Runs one independent sampling task per module.
///
/// Each task owns its provider and the sender half of its [`ModuleState`] watch channel;
/// a failing provider only affects its own task.
pub struct ModuleScheduler {
    aggregator: Arc<StatusAggregator>,
    cancel: CancellationToken,
    modules: BTreeMap<ModuleKind, ModuleHandle>,
}

impl ModuleScheduler {
    pub fn new(aggregator: Arc<StatusAggregator>, cancel: CancellationToken) -> Self {
        Self {
            aggregator,
            cancel,
            modules: BTreeMap::new(),
        }
    }

    /// Spawn the task for `provider`. A module that is already running is replaced.
    pub fn start(&mut self, provider: Box<dyn MetricProvider>, interval: Duration) {
        let kind = provider.kind();
        if let Some(old) = self.modules.remove(&kind) {
            warn!("Module {} started twice, stopping the previous task", kind);
            old.cancel.cancel();
        }

        let cancel = self.cancel.child_token();
        let (state_tx, state_rx) = watch::channel(ModuleState::new(kind, interval));
        let task = tokio::spawn(run_module(
            provider,
            interval,
            self.aggregator.clone(),
            cancel.clone(),
            state_tx,
        ));

        info!("[{}] module started (interval {:?})", kind, interval);
        self.modules.insert(
            kind,
            ModuleHandle {
                cancel,
                task,
                state: state_rx,
            },
        );
    }

    /// Restart a single module with a new interval, leaving the others untouched.
    pub async fn restart(
        &mut self,
        kind: ModuleKind,
        interval: Duration,
    ) -> Result<(), SchedulerError> {
        let handle = self
            .modules
            .remove(&kind)
            .ok_or(SchedulerError::NotRunning(kind))?;
        handle.cancel.cancel();
        let provider = handle
            .task
            .await
            .map_err(|e| SchedulerError::TaskFailed(kind, e.to_string()))?;
        self.start(provider, interval);
        Ok(())
    }

    /// Current state of every module.
    pub fn states(&self) -> Vec<ModuleState> {
        self.modules
            .values()
            .map(|handle| handle.state.borrow().clone())
            .collect()
    }

    pub fn watch(&self, kind: ModuleKind) -> Option<watch::Receiver<ModuleState>> {
        self.modules.get(&kind).map(|handle| handle.state.clone())
    }

    /// Cancel every module, wait for the tasks to exit and drop their entries from the
    /// status snapshot.
    pub async fn shutdown(self) {
        for handle in self.modules.values() {
            handle.cancel.cancel();
        }
        for (kind, handle) in self.modules {
            if let Err(e) = handle.task.await {
                warn!("[{}] module task ended abnormally: {}", kind, e);
            }
            self.aggregator.retire(kind);
        }
        info!("All modules stopped");
    }
}

async fn run_module(
    mut provider: Box<dyn MetricProvider>,
    interval: Duration,
    aggregator: Arc<StatusAggregator>,
    cancel: CancellationToken,
    state: watch::Sender<ModuleState>,
) -> Box<dyn MetricProvider> {
    let kind = provider.kind();
    state.send_modify(|s| s.phase = Phase::Running);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = AssertUnwindSafe(provider.sample()).catch_unwind() => result,
        };

        let error = match result {
            Ok(Ok(sample)) => {
                debug!("[{}] sampled {} fields", kind, sample.fields.len());
                aggregator.update(kind, sample);
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("provider panicked".to_string()),
        };

        if let Some(error) = &error {
            warn!("[{}] sample failed: {}", kind, error);
        }
        state.send_modify(|s| {
            s.last_run = Some(SystemTime::now());
            s.phase = if error.is_some() {
                Phase::Backoff
            } else {
                Phase::Running
            };
            s.last_error = error;
        });
    }

    state.send_modify(|s| s.phase = Phase::Stopped);
    debug!("[{}] module stopped", kind);
    provider
}
