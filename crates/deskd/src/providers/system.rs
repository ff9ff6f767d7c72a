use std::path::Path;

use async_trait::async_trait;
use linkme::distributed_slice;
use sysinfo::Components;
use sysinfo::Disks;
use sysinfo::System;

use crate::engine;
use crate::engine::MetricProvider;
use crate::engine::ModuleKind;
use crate::engine::ProviderError;
use crate::engine::Sample;

/// Labels that identify a CPU package sensor across hwmon drivers
const CPU_SENSOR_LABELS: &[&str] = &["package", "tctl", "tdie", "cpu", "core"];

/// Host metrics read through sysinfo
pub struct SystemProvider {
    probe: Option<Probe>,
}

struct Probe {
    system: System,
    disks: Disks,
    components: Components,
}

#[derive(Debug, Clone, PartialEq)]
struct Reading {
    cpu_usage: f32,
    memory_usage: f64,
    disk_usage: Option<f64>,
    cpu_temperature: Option<f32>,
    uptime: u64,
}

impl SystemProvider {
    pub fn new() -> Self {
        Self { probe: None }
    }
}

impl Default for SystemProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe {
    fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; prime the first one.
        system.refresh_cpu_usage();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            components: Components::new_with_refreshed_list(),
        }
    }

    fn read(&mut self) -> Reading {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh(true);
        self.components.refresh(true);

        let memory_usage = percent(self.system.used_memory(), self.system.total_memory());

        let disks = self.disks.list();
        let root = disks
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .or_else(|| disks.first());
        let disk_usage = root.map(|d| {
            let used = d.total_space().saturating_sub(d.available_space());
            percent(used, d.total_space())
        });

        let cpu_temperature = self
            .components
            .iter()
            .filter(|c| {
                let label = c.label().to_lowercase();
                CPU_SENSOR_LABELS.iter().any(|l| label.contains(l))
            })
            .filter_map(|c| c.temperature())
            .filter(|t| t.is_finite())
            .reduce(f32::max);

        Reading {
            cpu_usage: self.system.global_cpu_usage(),
            memory_usage,
            disk_usage,
            cpu_temperature,
            uptime: System::uptime(),
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

impl Reading {
    fn into_sample(self) -> Sample {
        let mut sample = Sample::new()
            .field("cpu_usage", round1(self.cpu_usage as f64))
            .field("memory_usage", round1(self.memory_usage))
            .field("uptime", self.uptime);
        if let Some(disk) = self.disk_usage {
            sample = sample.field("disk_usage", round1(disk));
        }
        // Hosts without a readable sensor omit the field rather than report 0.
        if let Some(temp) = self.cpu_temperature {
            sample = sample.field("cpu_temperature", round1(temp as f64));
        }
        sample
    }
}

#[async_trait]
impl MetricProvider for SystemProvider {
    fn kind(&self) -> ModuleKind {
        ModuleKind::System
    }

    async fn sample(&mut self) -> Result<Sample, ProviderError> {
        // A probe abandoned mid-read is rebuilt on the next tick.
        let mut probe = self.probe.take().unwrap_or_else(Probe::new);
        let (probe, reading) = tokio::task::spawn_blocking(move || {
            let reading = probe.read();
            (probe, reading)
        })
        .await
        .map_err(|e| ProviderError::Probe(format!("system probe task failed: {}", e)))?;
        self.probe = Some(probe);
        Ok(reading.into_sample())
    }
}

#[distributed_slice(engine::PROVIDER_REGISTRY)]
fn init_system(ctx: &engine::ProviderContext) -> engine::ProviderFactoryResult {
    if !ctx.config.modules.system.enabled {
        return Ok(None);
    }
    Ok(Some(Box::new(SystemProvider::new())))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_reading_fields() {
        let sample = Reading {
            cpu_usage: 12.345,
            memory_usage: 50.0,
            disk_usage: Some(73.26),
            cpu_temperature: None,
            uptime: 3600,
        }
        .into_sample();

        assert_eq!(sample.state, None);
        assert_eq!(sample.fields.get("cpu_usage"), Some(&json!(12.3)));
        assert_eq!(sample.fields.get("memory_usage"), Some(&json!(50.0)));
        assert_eq!(sample.fields.get("disk_usage"), Some(&json!(73.3)));
        assert_eq!(sample.fields.get("uptime"), Some(&json!(3600)));
        assert!(!sample.fields.contains_key("cpu_temperature"));
    }

    #[test]
    fn test_percent_of_empty_total() {
        assert_eq!(percent(10, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }

    #[tokio::test]
    async fn test_sample_reports_memory() {
        let mut provider = SystemProvider::new();
        let sample = provider.sample().await.unwrap();
        let memory = sample.fields.get("memory_usage").and_then(|v| v.as_f64()).unwrap();
        assert!((0.0..=100.0).contains(&memory));
        assert!(provider.probe.is_some());
    }
}
