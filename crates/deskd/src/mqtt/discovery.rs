//! Home Assistant MQTT discovery payloads.
//!
//! [`descriptors`] is a pure function of the [`Device`] and its [`Topics`]: the same input
//! always serializes to the same bytes, so republishing on every reconnect is harmless.

use serde::Serialize;
use serde_json::json;

use super::topics::Topics;
use crate::device::Device;
use crate::engine::ModuleKind;

/// Device block shared by every entity of this host
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
}

/// Discovery payload for one entity
///
/// Optional attributes are omitted rather than sent as `null`.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryMessage {
    pub name: String,
    pub unique_id: String,
    pub object_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_attributes_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_press: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_install: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,

    pub availability_topic: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<&'static str>,

    pub device: DeviceInfo,
}

/// A ready-to-publish discovery config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Where an entity reads its state from
#[derive(Clone, Copy)]
enum Source {
    /// A field of the module's object in the status document
    Status(&'static str),
    /// The module's own `state` topic
    ModuleState,
}

struct EntitySpec {
    object_id: &'static str,
    name: &'static str,
    component: &'static str,
    source: Source,
    unit: Option<&'static str>,
    device_class: Option<&'static str>,
    state_class: Option<&'static str>,
    entity_category: Option<&'static str>,
    icon: Option<&'static str>,
}

const fn sensor(object_id: &'static str, name: &'static str, source: Source) -> EntitySpec {
    EntitySpec {
        object_id,
        name,
        component: "sensor",
        source,
        unit: None,
        device_class: None,
        state_class: None,
        entity_category: None,
        icon: None,
    }
}

const SYSTEM_ENTITIES: &[EntitySpec] = &[
    EntitySpec {
        unit: Some("%"),
        state_class: Some("measurement"),
        icon: Some("mdi:cpu-64-bit"),
        ..sensor("cpu_usage", "CPU Usage", Source::Status("cpu_usage"))
    },
    EntitySpec {
        unit: Some("%"),
        state_class: Some("measurement"),
        icon: Some("mdi:memory"),
        ..sensor("memory_usage", "Memory Usage", Source::Status("memory_usage"))
    },
    EntitySpec {
        unit: Some("%"),
        state_class: Some("measurement"),
        icon: Some("mdi:harddisk"),
        ..sensor("disk_usage", "Disk Usage", Source::Status("disk_usage"))
    },
    EntitySpec {
        unit: Some("°C"),
        device_class: Some("temperature"),
        state_class: Some("measurement"),
        ..sensor("cpu_temperature", "CPU Temperature", Source::Status("cpu_temperature"))
    },
    EntitySpec {
        unit: Some("s"),
        device_class: Some("duration"),
        entity_category: Some("diagnostic"),
        icon: Some("mdi:timer-outline"),
        ..sensor("uptime", "Uptime", Source::Status("uptime"))
    },
];

const MEDIA_ENTITIES: &[EntitySpec] = &[EntitySpec {
    icon: Some("mdi:music"),
    ..sensor("now_playing", "Now Playing", Source::ModuleState)
}];

const GAME_ENTITIES: &[EntitySpec] = &[
    EntitySpec {
        icon: Some("mdi:gamepad-variant"),
        ..sensor("current_game", "Current Game", Source::ModuleState)
    },
    EntitySpec {
        component: "binary_sensor",
        icon: Some("mdi:controller"),
        ..sensor("gaming", "Gaming", Source::Status("playing"))
    },
];

fn entities_for(kind: ModuleKind) -> &'static [EntitySpec] {
    match kind {
        ModuleKind::System => SYSTEM_ENTITIES,
        ModuleKind::Media => MEDIA_ENTITIES,
        ModuleKind::Game => GAME_ENTITIES,
    }
}

fn device_info(device: &Device) -> DeviceInfo {
    DeviceInfo {
        identifiers: vec![format!("deskd_{}", device.id)],
        name: device.name.clone(),
        manufacturer: device.manufacturer.clone(),
        model: device.model.clone(),
        sw_version: device.sw_version.clone(),
    }
}

fn base_message(device: &Device, topics: &Topics, object_id: &str, name: &str) -> DiscoveryMessage {
    DiscoveryMessage {
        name: name.to_string(),
        unique_id: format!("{}_{}", device.id, object_id),
        object_id: format!("{}_{}", device.id, object_id),
        state_topic: None,
        value_template: None,
        json_attributes_topic: None,
        command_topic: None,
        payload_press: None,
        payload_install: None,
        payload_on: None,
        payload_off: None,
        availability_topic: topics.availability(),
        unit_of_measurement: None,
        device_class: None,
        state_class: None,
        entity_category: None,
        icon: None,
        device: device_info(device),
    }
}

fn module_message(
    device: &Device,
    topics: &Topics,
    kind: ModuleKind,
    spec: &EntitySpec,
) -> DiscoveryMessage {
    let mut msg = base_message(device, topics, spec.object_id, spec.name);
    match spec.source {
        Source::Status(field) => {
            msg.state_topic = Some(topics.status());
            if spec.component == "binary_sensor" {
                msg.value_template = Some(format!(
                    "{{{{ 'ON' if value_json.{}.{} else 'OFF' }}}}",
                    kind, field
                ));
                msg.payload_on = Some("ON".to_string());
                msg.payload_off = Some("OFF".to_string());
            } else {
                msg.value_template = Some(format!("{{{{ value_json.{}.{} }}}}", kind, field));
            }
        }
        Source::ModuleState => {
            msg.state_topic = Some(topics.module_state(kind));
            msg.json_attributes_topic = Some(topics.module_attrs(kind));
        }
    }
    msg.unit_of_measurement = spec.unit;
    msg.device_class = spec.device_class;
    msg.state_class = spec.state_class;
    msg.entity_category = spec.entity_category;
    msg.icon = spec.icon;
    msg
}

fn command_message(device: &Device, topics: &Topics, command: &str) -> DiscoveryMessage {
    let object_id = format!("run_{}", command);
    let mut msg = base_message(device, topics, &object_id, command);
    msg.command_topic = Some(topics.run());
    msg.payload_press = Some(json!({ "command": command }).to_string());
    msg.icon = Some("mdi:console");
    msg
}

fn update_message(device: &Device, topics: &Topics) -> DiscoveryMessage {
    let mut msg = base_message(device, topics, "update", "Agent Update");
    msg.state_topic = Some(topics.update_state());
    msg.command_topic = Some(topics.update_install());
    msg.payload_install = Some("INSTALL".to_string());
    msg.device_class = Some("firmware");
    msg.entity_category = Some("config");
    msg
}

fn descriptor(topics: &Topics, component: &str, object_id: &str, msg: &DiscoveryMessage) -> Descriptor {
    Descriptor {
        topic: topics.discovery(component, object_id),
        // Serializing a struct of strings cannot fail.
        payload: serde_json::to_vec(msg).unwrap_or_default(),
    }
}

/// Build every discovery descriptor for `device`, in a stable order: module entities
/// (system, media, game), then one button per command, then the update entity.
///
/// Disabled modules contribute nothing.
pub fn descriptors(device: &Device, topics: &Topics) -> Vec<Descriptor> {
    let mut out = Vec::new();

    for kind in &device.modules {
        for spec in entities_for(*kind) {
            let msg = module_message(device, topics, *kind, spec);
            out.push(descriptor(topics, spec.component, spec.object_id, &msg));
        }
    }

    for command in &device.commands {
        let msg = command_message(device, topics, command);
        out.push(descriptor(topics, "button", &format!("run_{}", command), &msg));
    }

    if device.updates {
        let msg = update_message(device, topics);
        out.push(descriptor(topics, "update", "update", &msg));
    }

    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::Value;
    use strum::IntoEnumIterator;

    use super::*;

    fn device(modules: &[ModuleKind], commands: &[&str], updates: bool) -> Device {
        Device {
            id: "office".to_string(),
            name: "Office".to_string(),
            manufacturer: "deskd".to_string(),
            model: "linux x86_64".to_string(),
            sw_version: "0.1.0".to_string(),
            modules: modules.iter().copied().collect(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            updates,
        }
    }

    fn topics() -> Topics {
        Topics::new("desktop", "office", "homeassistant")
    }

    fn all_subsets() -> Vec<Vec<ModuleKind>> {
        let kinds: Vec<_> = ModuleKind::iter().collect();
        (0..1u8 << kinds.len())
            .map(|mask| {
                kinds
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, k)| *k)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_descriptors_are_idempotent_for_every_module_subset() {
        for subset in all_subsets() {
            let device = device(&subset, &["lock"], true);
            let first = descriptors(&device, &topics());
            let second = descriptors(&device, &topics());
            assert_eq!(first, second, "subset {:?}", subset);
        }
    }

    #[test]
    fn test_disabled_modules_emit_nothing() {
        for subset in all_subsets() {
            let device = device(&subset, &[], false);
            let enabled: BTreeSet<_> = subset.iter().map(|k| k.to_string()).collect();
            for d in descriptors(&device, &topics()) {
                let payload: Value = serde_json::from_slice(&d.payload).unwrap();
                let state_topic = payload["state_topic"].as_str().unwrap();
                let template = payload["value_template"].as_str().unwrap_or("");
                let mentioned: Vec<_> = ModuleKind::iter()
                    .map(|k| k.to_string())
                    .filter(|k| {
                        state_topic.contains(&format!("/{}/", k))
                            || template.contains(&format!("value_json.{}.", k))
                    })
                    .collect();
                assert_eq!(mentioned.len(), 1, "{}", d.topic);
                assert!(enabled.contains(&mentioned[0]), "{}", d.topic);
            }
        }
    }

    #[test]
    fn test_entity_counts() {
        let device = device(
            &[ModuleKind::System, ModuleKind::Media, ModuleKind::Game],
            &["lock", "sleep"],
            true,
        );
        let topics: Vec<_> = descriptors(&device, &topics())
            .into_iter()
            .map(|d| d.topic)
            .collect();
        assert_eq!(topics.len(), 5 + 1 + 2 + 2 + 1);
        assert_eq!(topics[0], "homeassistant/sensor/office/cpu_usage/config");
        assert_eq!(topics[5], "homeassistant/sensor/office/now_playing/config");
        assert_eq!(topics[7], "homeassistant/binary_sensor/office/gaming/config");
        assert_eq!(topics[8], "homeassistant/button/office/run_lock/config");
        assert_eq!(topics[10], "homeassistant/update/office/update/config");
    }

    #[test]
    fn test_optional_attributes_are_omitted() {
        let device = device(&[ModuleKind::Media], &[], false);
        let payload: Value =
            serde_json::from_slice(&descriptors(&device, &topics())[0].payload).unwrap();
        let object = payload.as_object().unwrap();
        assert!(!object.contains_key("unit_of_measurement"));
        assert!(!object.contains_key("value_template"));
        assert!(!object.values().any(Value::is_null));
        assert_eq!(payload["state_topic"], "desktop/office/media/state");
        assert_eq!(payload["json_attributes_topic"], "desktop/office/media/attrs");
    }

    #[test]
    fn test_system_sensor_template() {
        let device = device(&[ModuleKind::System], &[], false);
        let payload: Value =
            serde_json::from_slice(&descriptors(&device, &topics())[0].payload).unwrap();
        assert_eq!(payload["value_template"], "{{ value_json.system.cpu_usage }}");
        assert_eq!(payload["unique_id"], "office_cpu_usage");
        assert_eq!(payload["unit_of_measurement"], "%");
        assert_eq!(payload["device"]["identifiers"][0], "deskd_office");
    }

    #[test]
    fn test_button_payload_bytes() {
        let device = device(&[], &["lock"], false);
        let descriptors = descriptors(&device, &topics());
        assert_eq!(descriptors.len(), 1);
        let payload = String::from_utf8(descriptors[0].payload.clone()).unwrap();
        insta::assert_snapshot!(payload, @r#"{"name":"lock","unique_id":"office_run_lock","object_id":"office_run_lock","command_topic":"desktop/office/run","payload_press":"{\"command\":\"lock\"}","availability_topic":"desktop/office/availability","icon":"mdi:console","device":{"identifiers":["deskd_office"],"name":"Office","manufacturer":"deskd","model":"linux x86_64","sw_version":"0.1.0"}}"#);
    }
}
