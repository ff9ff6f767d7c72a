use std::time::Duration;
use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;

/// A monitoring module the scheduler can run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModuleKind {
    System,
    Media,
    Game,
}

impl ModuleKind {
    /// Whether the module publishes its own `state`/`attrs` topics in addition to the
    /// merged status document.
    pub fn has_namespace(self) -> bool {
        matches!(self, ModuleKind::Media | ModuleKind::Game)
    }
}

/// Lifecycle phase of a module task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    #[default]
    Stopped,
    Running,
    /// The last sample failed; the next attempt happens on the normal tick.
    Backoff,
}

/// Bookkeeping for one module, written only by that module's task.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleState {
    pub kind: ModuleKind,
    pub interval: Duration,
    pub last_run: Option<SystemTime>,
    pub last_error: Option<String>,
    pub enabled: bool,
    pub phase: Phase,
}

impl ModuleState {
    pub fn new(kind: ModuleKind, interval: Duration) -> Self {
        Self {
            kind,
            interval,
            last_run: None,
            last_error: None,
            enabled: true,
            phase: Phase::Stopped,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            ModuleKind::System => "system",
            ModuleKind::Media => "media",
            ModuleKind::Game => "game",
        }
    }
}
