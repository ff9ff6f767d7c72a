//! Configuration file parsing and structures.
//!
//! deskd reads a single TOML file at startup. The parsed [`Config`] is validated once
//! and then handed to [`crate::agent::run`], which passes each component the settings
//! it needs.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;

use crate::engine::ModuleKind;
use crate::update::Channel;

/// Top-level configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub modules: ModulesConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub updates: UpdatesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"rumqttc" = "warn"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

/// Identity announced to the broker
#[derive(Debug, Default, Deserialize)]
pub struct DeviceConfig {
    /// Display name; defaults to the hostname
    pub name: Option<String>,

    /// Stable identifier used in topics; derived from the name when absent
    pub id: Option<String>,

    pub manufacturer: Option<String>,

    pub model: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_base_topic() -> String {
    "desktop".to_string()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_min_reconnect_delay() -> u64 {
    1
}

fn default_max_reconnect_delay() -> u64 {
    60
}

fn default_keep_alive() -> u64 {
    30
}

/// Broker connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// MQTT broker hostname or IP address
    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// MQTT client ID; defaults to `deskd-<device id>`
    pub client_id: Option<String>,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Root of the per-device topic namespace
    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    /// Home Assistant discovery prefix
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,

    /// First reconnect delay in seconds
    #[serde(default = "default_min_reconnect_delay")]
    pub min_reconnect_delay: u64,

    /// Reconnect delay ceiling in seconds
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay: u64,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
}

fn default_true() -> bool {
    true
}

/// Settings shared by every module
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sampling interval in seconds; each module has its own default
    pub interval: Option<u64>,
}

impl ModuleConfig {
    fn disabled() -> Self {
        Self {
            enabled: false,
            interval: None,
        }
    }

    fn enabled() -> Self {
        Self {
            enabled: true,
            interval: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub interval: Option<u64>,

    /// File holding the name of the running game; `unknown` or empty means idle
    pub game_file: Option<PathBuf>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: None,
            game_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModulesConfig {
    #[serde(default = "ModuleConfig::enabled")]
    pub system: ModuleConfig,

    #[serde(default = "ModuleConfig::disabled")]
    pub media: ModuleConfig,

    #[serde(default)]
    pub game: GameConfig,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            system: ModuleConfig::enabled(),
            media: ModuleConfig::disabled(),
            game: GameConfig::default(),
        }
    }
}

impl ModulesConfig {
    pub fn is_enabled(&self, kind: ModuleKind) -> bool {
        match kind {
            ModuleKind::System => self.system.enabled,
            ModuleKind::Media => self.media.enabled,
            ModuleKind::Game => self.game.enabled,
        }
    }

    /// Sampling interval for `kind`, falling back to the module default.
    pub fn interval(&self, kind: ModuleKind) -> Duration {
        let (configured, default) = match kind {
            ModuleKind::System => (self.system.interval, 30),
            ModuleKind::Media => (self.media.interval, 5),
            ModuleKind::Game => (self.game.interval, 10),
        };
        Duration::from_secs(configured.unwrap_or(default))
    }
}

fn default_whitelist() -> PathBuf {
    PathBuf::from("commands.toml")
}

fn default_command_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct CommandsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whitelist document, TOML or JSON by extension
    #[serde(default = "default_whitelist")]
    pub whitelist: PathBuf,

    /// Default timeout in seconds for commands that wait for completion
    #[serde(default = "default_command_timeout")]
    pub timeout: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            whitelist: default_whitelist(),
            timeout: default_command_timeout(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    5555
}

/// HTTP API configuration
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token required on every request when set
    pub auth_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_listen(),
            port: default_api_port(),
            auth_token: None,
        }
    }
}

fn default_update_interval() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
pub struct UpdatesConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub channel: Channel,

    /// Check interval in seconds
    #[serde(default = "default_update_interval")]
    pub interval: u64,

    /// Install newer releases without waiting for the install trigger
    #[serde(default)]
    pub auto_install: bool,

    /// Releases endpoint (GitHub-style JSON list)
    pub release_url: Option<String>,

    /// Binary to replace; defaults to the running executable
    pub install_path: Option<PathBuf>,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: Channel::default(),
            interval: default_update_interval(),
            auto_install: false,
            release_url: None,
            install_path: None,
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        Self::parse(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker.trim().is_empty() {
            return Err(invalid("mqtt.broker", "must not be empty"));
        }
        if self.mqtt.port == 0 {
            return Err(invalid("mqtt.port", "must be non-zero"));
        }
        if self.mqtt.min_reconnect_delay == 0 {
            return Err(invalid("mqtt.min_reconnect_delay", "must be at least 1"));
        }
        if self.mqtt.min_reconnect_delay > self.mqtt.max_reconnect_delay {
            return Err(invalid(
                "mqtt.max_reconnect_delay",
                "must not be smaller than min_reconnect_delay",
            ));
        }
        for (field, topic) in [
            ("mqtt.base_topic", &self.mqtt.base_topic),
            ("mqtt.discovery_prefix", &self.mqtt.discovery_prefix),
        ] {
            if topic.is_empty() || topic.contains(['+', '#']) || topic.ends_with('/') {
                return Err(invalid(field, "must be a plain topic prefix"));
            }
        }
        if let Some(id) = &self.device.id {
            if !is_valid_device_id(id) {
                return Err(invalid(
                    "device.id",
                    "may only contain lowercase letters, digits, '_' and '-'",
                ));
            }
        }
        for (field, interval) in [
            ("modules.system.interval", self.modules.system.interval),
            ("modules.media.interval", self.modules.media.interval),
            ("modules.game.interval", self.modules.game.interval),
        ] {
            if interval == Some(0) {
                return Err(invalid(field, "must be at least 1 second"));
            }
        }
        if self.modules.game.enabled && self.modules.game.game_file.is_none() {
            return Err(invalid(
                "modules.game.game_file",
                "required when the game module is enabled",
            ));
        }
        if self.commands.timeout == 0 {
            return Err(invalid("commands.timeout", "must be at least 1 second"));
        }
        if self.api.enabled && self.api.port == 0 {
            return Err(invalid("api.port", "must be non-zero"));
        }
        if self.updates.interval == 0 {
            return Err(invalid("updates.interval", "must be at least 1 second"));
        }
        if self.updates.enabled && self.updates.release_url.is_none() {
            return Err(invalid("updates.release_url", "required when updates are enabled"));
        }
        Ok(())
    }
}

pub(crate) fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [mqtt]
            broker = "localhost"
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.base_topic, "desktop");
        assert_eq!(config.mqtt.discovery_prefix, "homeassistant");
        assert_eq!(config.mqtt.min_reconnect_delay, 1);
        assert_eq!(config.mqtt.max_reconnect_delay, 60);
        assert!(config.modules.is_enabled(ModuleKind::System));
        assert!(!config.modules.is_enabled(ModuleKind::Media));
        assert!(!config.modules.is_enabled(ModuleKind::Game));
        assert_eq!(config.modules.interval(ModuleKind::System), Duration::from_secs(30));
        assert!(!config.api.enabled);
        assert_eq!(config.api.port, 5555);
        assert_eq!(config.commands.timeout, 30);
        assert!(!config.updates.enabled);
        assert_eq!(config.updates.channel, Channel::Stable);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [device]
            name = "Office Desktop"
            model = "Workstation"

            [mqtt]
            broker = "broker.lan"
            port = 8883
            username = "deskd"
            password = "secret"
            min_reconnect_delay = 2
            max_reconnect_delay = 30

            [modules.system]
            interval = 5

            [modules.media]
            interval = 10

            [modules.game]
            game_file = "/tmp/game.txt"

            [commands]
            whitelist = "/etc/deskd/commands.json"
            timeout = 10

            [api]
            enabled = true
            port = 6000
            auth_token = "hunter2"

            [updates]
            enabled = true
            channel = "beta"
            auto_install = true
            release_url = "https://example.invalid/releases"

            [logging]
            level = "debug"
            overrides.rumqttc = "warn"
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.device.name.as_deref(), Some("Office Desktop"));
        assert_eq!(config.mqtt.port, 8883);
        assert!(config.modules.is_enabled(ModuleKind::Media));
        assert!(config.modules.is_enabled(ModuleKind::Game));
        assert_eq!(config.modules.interval(ModuleKind::System), Duration::from_secs(5));
        assert_eq!(config.modules.interval(ModuleKind::Media), Duration::from_secs(10));
        assert_eq!(config.modules.interval(ModuleKind::Game), Duration::from_secs(10));
        assert_eq!(
            config.modules.game.game_file.as_deref(),
            Some(Path::new("/tmp/game.txt"))
        );
        assert_eq!(config.api.auth_token.as_deref(), Some("hunter2"));
        assert_eq!(config.updates.channel, Channel::Beta);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.overrides.get("rumqttc"), Some(&LogLevel::Warn));
    }

    #[test]
    fn test_section_without_enabled_is_enabled() {
        let toml = r#"
            [mqtt]
            broker = "localhost"

            [modules.system]
            enabled = false
        "#;

        let config = Config::parse(toml).unwrap();
        assert!(!config.modules.is_enabled(ModuleKind::System));
    }

    #[test]
    fn test_reject_inverted_backoff() {
        let toml = r#"
            [mqtt]
            broker = "localhost"
            min_reconnect_delay = 10
            max_reconnect_delay = 5
        "#;

        let err = Config::parse(toml).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "mqtt.max_reconnect_delay",
                ..
            }
        ));
    }

    #[test]
    fn test_reject_zero_interval() {
        let toml = r#"
            [mqtt]
            broker = "localhost"

            [modules.media]
            interval = 0
        "#;

        let err = Config::parse(toml).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value for modules.media.interval: must be at least 1 second"
        );
    }

    #[test]
    fn test_reject_wildcard_topic() {
        let toml = r#"
            [mqtt]
            broker = "localhost"
            base_topic = "desktop/#"
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_reject_bad_device_id() {
        let toml = r#"
            [device]
            id = "My Desktop"

            [mqtt]
            broker = "localhost"
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_updates_need_release_url() {
        let toml = r#"
            [mqtt]
            broker = "localhost"

            [updates]
            enabled = true
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_game_module_needs_file() {
        let toml = r#"
            [mqtt]
            broker = "localhost"

            [modules.game]
            interval = 3
        "#;

        let err = Config::parse(toml).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "modules.game.game_file",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_broker_is_parse_error() {
        let err = Config::parse("[device]\nname = \"x\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file_missing() {
        let err = Config::from_file("/nonexistent/deskd.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
    }
}
