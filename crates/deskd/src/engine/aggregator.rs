use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::broadcast;

use super::provider::Sample;
use super::state::ModuleKind;

/// Capacity of the change-notification channel. Slow receivers see `Lagged` and
/// must fall back to reading the full snapshot.
const CHANGE_CHANNEL_SIZE: usize = 64;

/// Latest reading for one module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleReport {
    pub state: Option<String>,
    pub fields: Map<String, Value>,
    pub updated_at: SystemTime,
}

/// Merged view of every live module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    modules: BTreeMap<ModuleKind, ModuleReport>,
}

impl Snapshot {
    pub fn get(&self, kind: ModuleKind) -> Option<&ModuleReport> {
        self.modules.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = ModuleKind> + '_ {
        self.modules.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// The status document: `{ "<module>": { fields... } }`.
    pub fn to_json(&self) -> Value {
        let mut doc = Map::new();
        for (kind, report) in &self.modules {
            doc.insert(kind.to_string(), Value::Object(report.fields.clone()));
        }
        Value::Object(doc)
    }
}

/// Holds the merged status snapshot.
///
/// Writers replace the whole snapshot with read-copy-update, so readers always load a
/// consistent `Arc<Snapshot>` without taking a lock.
pub struct StatusAggregator {
    snapshot: ArcSwap<Snapshot>,
    changes: broadcast::Sender<ModuleKind>,
}

impl Default for StatusAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusAggregator {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_SIZE);
        Self {
            snapshot: ArcSwap::new(Arc::default()),
            changes,
        }
    }

    /// Clones the `Arc`, essentially free.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Record a new sample for `kind` and notify subscribers.
    pub fn update(&self, kind: ModuleKind, sample: Sample) {
        let report = ModuleReport {
            state: sample.state,
            fields: sample.fields,
            updated_at: SystemTime::now(),
        };
        self.snapshot.rcu(|current| {
            let mut next = Snapshot::clone(current);
            next.modules.insert(kind, report.clone());
            next
        });
        let _ = self.changes.send(kind);
    }

    /// Drop a module's key, e.g. when its task stops.
    pub fn retire(&self, kind: ModuleKind) {
        if self.snapshot.load().get(kind).is_none() {
            return;
        }
        self.snapshot.rcu(|current| {
            let mut next = Snapshot::clone(current);
            next.modules.remove(&kind);
            next
        });
        let _ = self.changes.send(kind);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModuleKind> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_update_merges_modules() {
        let aggregator = StatusAggregator::new();
        aggregator.update(ModuleKind::System, Sample::new().field("cpu_usage", 12.5));
        aggregator.update(
            ModuleKind::Media,
            Sample::new().with_state("Song").field("title", "Song"),
        );

        let snapshot = aggregator.snapshot();
        assert_eq!(
            snapshot.to_json(),
            json!({"media": {"title": "Song"}, "system": {"cpu_usage": 12.5}})
        );
        assert_eq!(
            snapshot.get(ModuleKind::Media).unwrap().state.as_deref(),
            Some("Song")
        );
    }

    #[test]
    fn test_old_snapshot_is_not_mutated() {
        let aggregator = StatusAggregator::new();
        aggregator.update(ModuleKind::System, Sample::new().field("cpu_usage", 1));
        let before = aggregator.snapshot();

        aggregator.update(ModuleKind::System, Sample::new().field("cpu_usage", 2));

        assert_eq!(before.to_json(), json!({"system": {"cpu_usage": 1}}));
        assert_eq!(aggregator.snapshot().to_json(), json!({"system": {"cpu_usage": 2}}));
    }

    #[test]
    fn test_retire_removes_key() {
        let aggregator = StatusAggregator::new();
        aggregator.update(ModuleKind::Game, Sample::new().field("playing", false));
        aggregator.retire(ModuleKind::Game);
        assert!(aggregator.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_see_changed_kind() {
        let aggregator = StatusAggregator::new();
        let mut rx = aggregator.subscribe();

        aggregator.update(ModuleKind::Media, Sample::new());
        assert_eq!(rx.recv().await.unwrap(), ModuleKind::Media);

        // Retiring an absent module is silent.
        aggregator.retire(ModuleKind::System);
        assert!(rx.try_recv().is_err());
    }
}
