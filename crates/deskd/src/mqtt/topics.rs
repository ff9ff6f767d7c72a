use crate::engine::ModuleKind;

/// Topic layout for one device.
///
/// Everything lives under `{base_topic}/{device_id}`; discovery configs go to
/// `{discovery_prefix}/{component}/{device_id}/{object_id}/config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    root: String,
    device_id: String,
    discovery_prefix: String,
}

impl Topics {
    pub fn new(base_topic: &str, device_id: &str, discovery_prefix: &str) -> Self {
        Self {
            root: format!("{}/{}", base_topic, device_id),
            device_id: device_id.to_string(),
            discovery_prefix: discovery_prefix.to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.root)
    }

    pub fn availability(&self) -> String {
        format!("{}/availability", self.root)
    }

    pub fn run(&self) -> String {
        format!("{}/run", self.root)
    }

    pub fn run_result(&self) -> String {
        format!("{}/run_result", self.root)
    }

    pub fn module_state(&self, kind: ModuleKind) -> String {
        format!("{}/{}/state", self.root, kind)
    }

    pub fn module_attrs(&self, kind: ModuleKind) -> String {
        format!("{}/{}/attrs", self.root, kind)
    }

    pub fn update_state(&self) -> String {
        format!("{}/update/state", self.root)
    }

    pub fn update_install(&self) -> String {
        format!("{}/update/install", self.root)
    }

    pub fn discovery(&self, component: &str, object_id: &str) -> String {
        format!(
            "{}/{}/{}/{}/config",
            self.discovery_prefix, component, self.device_id, object_id
        )
    }
}
