//! ---
//! hm_section: "01-core-functionality"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Shared primitives and utilities for the bridge runtime."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Shared primitives for the hm2mqtt workspace.
//! This crate exposes configuration loading, logging setup and clock
//! helpers consumed by the bridge and the daemon.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, BrokerEndpoint, DeviceConfig, DiscoveryConfig, LoadedAppConfig, LoggingConfig,
    MetricsConfig, MqttConfig, PollingConfig,
};
pub use logging::{init_tracing, LogFormat};
