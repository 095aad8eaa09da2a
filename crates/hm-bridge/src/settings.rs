//! ---
//! hm_section: "06-bridge-runtime"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Bridge runtime and lifecycle management."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
use std::time::Duration;

use hm_common::AppConfig;
use hm_protocol::{Device, PollIntervals, SchedulerSettings};
use hm_transport::DeviceTopics;

const DEFAULT_TICK: Duration = Duration::from_secs(1);
const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";

/// Runtime parameters of a [`crate::Bridge`].
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Topic scheme.
    pub topics: DeviceTopics,
    /// Devices to poll and accept traffic from.
    pub devices: Vec<Device>,
    /// Poll intervals baked into the built-in definitions.
    pub intervals: PollIntervals,
    /// Response timeout and stagger.
    pub scheduler: SchedulerSettings,
    /// How often due-ness is evaluated. Independent of the poll intervals.
    pub tick: Duration,
    /// Discovery topic root; `None` disables discovery announcements.
    pub discovery_prefix: Option<String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            topics: DeviceTopics::default(),
            devices: Vec::new(),
            intervals: PollIntervals::default(),
            scheduler: SchedulerSettings::default(),
            tick: DEFAULT_TICK,
            discovery_prefix: Some(DEFAULT_DISCOVERY_PREFIX.to_owned()),
        }
    }
}

impl BridgeSettings {
    /// Derive runtime settings from a validated configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            topics: DeviceTopics::new(config.mqtt.topic_prefix.as_str()),
            devices: config
                .devices
                .iter()
                .map(|device| Device::new(device.family.as_str(), device.id.as_str()))
                .collect(),
            intervals: PollIntervals {
                regular: config.polling.interval,
                slow: config.polling.slow_interval,
            },
            scheduler: SchedulerSettings {
                response_timeout: config.polling.response_timeout,
                stagger: config.polling.stagger,
            },
            tick: DEFAULT_TICK,
            discovery_prefix: config
                .discovery
                .enabled
                .then(|| config.discovery.prefix.clone()),
        }
    }

    /// Add a device.
    pub fn with_device(mut self, device: Device) -> Self {
        self.devices.push(device);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_common::DeviceConfig;

    #[test]
    fn maps_polling_and_devices() {
        let mut config = AppConfig::default();
        config.mqtt.topic_prefix = "bridge".into();
        config.polling.interval = Duration::from_secs(30);
        config.polling.response_timeout = Duration::from_secs(5);
        config.devices.push(DeviceConfig {
            family: "HMA-1".into(),
            id: "testdevice".into(),
        });

        let settings = BridgeSettings::from_config(&config);
        assert_eq!(settings.topics.prefix(), "bridge");
        assert_eq!(settings.devices, vec![Device::new("HMA-1", "testdevice")]);
        assert_eq!(settings.intervals.regular, Duration::from_secs(30));
        assert_eq!(settings.scheduler.response_timeout, Duration::from_secs(5));
        assert_eq!(settings.tick, Duration::from_secs(1));
        assert_eq!(settings.discovery_prefix.as_deref(), Some("homeassistant"));

        config.discovery.enabled = false;
        assert_eq!(BridgeSettings::from_config(&config).discovery_prefix, None);
    }
}
