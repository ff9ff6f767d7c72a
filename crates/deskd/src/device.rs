use std::collections::BTreeSet;

use strum::IntoEnumIterator;

use crate::config::Config;
use crate::config::is_valid_device_id;
use crate::engine::ModuleKind;

/// The host as announced to the broker.
///
/// Built once at startup from the configuration and the loaded whitelist; never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
    /// Modules enabled in the configuration
    pub modules: BTreeSet<ModuleKind>,
    /// Whitelisted commands runnable on this platform, sorted
    pub commands: Vec<String>,
    /// Whether the update entity is exposed
    pub updates: bool,
}

impl Device {
    pub fn from_config(config: &Config, commands: Vec<String>) -> Self {
        let name = config
            .device
            .name
            .clone()
            .unwrap_or_else(local_hostname);
        let id = config
            .device
            .id
            .clone()
            .unwrap_or_else(|| derive_id(&name));

        let mut commands = commands;
        commands.sort();
        commands.dedup();

        Self {
            id,
            name,
            manufacturer: config
                .device
                .manufacturer
                .clone()
                .unwrap_or_else(|| "deskd".to_string()),
            model: config
                .device
                .model
                .clone()
                .unwrap_or_else(|| format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)),
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
            modules: ModuleKind::iter()
                .filter(|kind| config.modules.is_enabled(*kind))
                .collect(),
            commands,
            updates: config.updates.enabled,
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "desktop".to_string())
}

/// Lowercase the name and map anything that is not topic-safe to `_`.
pub fn derive_id(name: &str) -> String {
    let id: String = name
        .trim()
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-' | '_') => c,
            _ => '_',
        })
        .collect();
    if is_valid_device_id(&id) {
        id
    } else {
        "desktop".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_id() {
        assert_eq!(derive_id("Office Desktop"), "office_desktop");
        assert_eq!(derive_id("gaming-rig"), "gaming-rig");
        assert_eq!(derive_id("Jürgen's PC"), "j_rgen_s_pc");
        assert_eq!(derive_id("   "), "desktop");
    }

    #[test]
    fn test_from_config() {
        let config = Config::parse(
            r#"
            [device]
            name = "Office Desktop"

            [mqtt]
            broker = "localhost"

            [modules.media]
            interval = 10
        "#,
        )
        .unwrap();

        let device = Device::from_config(
            &config,
            vec!["sleep".to_string(), "lock".to_string(), "lock".to_string()],
        );
        assert_eq!(device.id, "office_desktop");
        assert_eq!(device.name, "Office Desktop");
        assert_eq!(device.manufacturer, "deskd");
        assert_eq!(
            device.modules,
            BTreeSet::from([ModuleKind::System, ModuleKind::Media])
        );
        assert_eq!(device.commands, vec!["lock", "sleep"]);
        assert!(!device.updates);
    }

    #[test]
    fn test_explicit_id_wins() {
        let config = Config::parse(
            r#"
            [device]
            name = "Office Desktop"
            id = "desk1"

            [mqtt]
            broker = "localhost"
        "#,
        )
        .unwrap();

        assert_eq!(Device::from_config(&config, Vec::new()).id, "desk1");
    }
}
