mod aggregator;
mod provider;
mod scheduler;
pub mod state;

pub use aggregator::ModuleReport;
pub use aggregator::Snapshot;
pub use aggregator::StatusAggregator;
pub use provider::MetricProvider;
pub use provider::ProviderContext;
pub use provider::ProviderError;
pub use provider::ProviderFactoryResult;
pub use provider::REGISTRY as PROVIDER_REGISTRY;
pub use provider::Sample;
pub use provider::providers_from_config;
pub use scheduler::ModuleScheduler;
pub use scheduler::SchedulerError;
pub use state::ModuleKind;
pub use state::ModuleState;
pub use state::Phase;
