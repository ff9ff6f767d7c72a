use async_trait::async_trait;
use linkme::distributed_slice;
use serde_json::Map;
use serde_json::Value;
use tracing::error;
use tracing::info;

use super::state::ModuleKind;
use crate::config::Config;

/// Result type for provider factory functions
///
/// `Ok(None)` means the module is disabled in the configuration.
pub type ProviderFactoryResult = anyhow::Result<Option<Box<dyn MetricProvider>>>;

pub struct ProviderContext<'a> {
    pub config: &'a Config,
}

#[distributed_slice]
pub static REGISTRY: [fn(&ProviderContext) -> ProviderFactoryResult];

/// One point-in-time reading from a provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    /// Short state string for modules with their own namespace (e.g. the track title).
    pub state: Option<String>,

    /// Fields merged into the status document under the module's key.
    pub fields: Map<String, Value>,
}

impl Sample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("probe unavailable: {0}")]
    Unavailable(String),

    #[error("probe failed: {0}")]
    Probe(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Source of telemetry for one module
#[async_trait]
pub trait MetricProvider: Send {
    fn kind(&self) -> ModuleKind;

    /// Take a reading. Dropping the returned future must abandon the probe.
    async fn sample(&mut self) -> Result<Sample, ProviderError>;
}

/// Build every provider the configuration enables.
pub fn providers_from_config(config: &Config) -> Vec<Box<dyn MetricProvider>> {
    let ctx = ProviderContext { config };
    let mut providers = Vec::new();
    for constr in REGISTRY {
        match constr(&ctx) {
            Ok(Some(provider)) => {
                info!("Module {} enabled", provider.kind());
                providers.push(provider);
            }
            Ok(None) => continue,
            Err(e) => error!("failed to set up provider: {:#}", e),
        }
    }
    providers.sort_by_key(|p| p.kind());
    providers
}
