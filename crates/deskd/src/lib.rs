pub mod agent;
pub mod api;
pub mod commands;
pub mod config;
pub mod device;
pub mod engine;
pub mod mqtt;
pub mod providers;
pub mod update;

pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use device::Device;
