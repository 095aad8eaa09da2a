//! ---
//! hm_section: "04-transport"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Transport abstraction and adapters."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Topic scheme shared by devices, the bridge and automation consumers.
//!
//! Devices talk on the vendor namespace `hame_energy/<family>/...`; the
//! bridge publishes decoded state below a configurable prefix.

use hm_protocol::Device;

const VENDOR_ROOT: &str = "hame_energy";

/// Classification of an inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRoute {
    /// Telemetry published by a device.
    DeviceMessage {
        /// Family segment of the topic.
        family: String,
        /// Instance id segment of the topic.
        instance_id: String,
    },
    /// Control request from an automation consumer.
    Control {
        /// Instance id segment of the topic.
        instance_id: String,
        /// Remaining topic levels after `control/`.
        suffix: String,
    },
}

/// Builds and classifies topics for one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    prefix: String,
}

impl Default for DeviceTopics {
    fn default() -> Self {
        Self::new("hm2mqtt")
    }
}

impl DeviceTopics {
    /// Topic scheme below `prefix`; surrounding slashes are ignored.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_matches('/').to_owned(),
        }
    }

    /// Bridge topic prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Topic the device publishes its telemetry on.
    pub fn device_inbound(&self, device: &Device) -> String {
        format!(
            "{}/{}/device/{}/ctrl",
            VENDOR_ROOT,
            device.family(),
            device.instance_id()
        )
    }

    /// Topic the device listens on for commands.
    pub fn device_outbound(&self, device: &Device) -> String {
        format!(
            "{}/{}/App/{}/ctrl",
            VENDOR_ROOT,
            device.family(),
            device.instance_id()
        )
    }

    /// Retained per-slot state topic, e.g. `hm2mqtt/<id>/data`.
    pub fn state(&self, device: &Device, slot: &str) -> String {
        format!("{}/{}/{}", self.prefix, device.instance_id(), slot)
    }

    /// Control topic for `suffix`.
    pub fn control(&self, device: &Device, suffix: &str) -> String {
        format!("{}/{}/control/{}", self.prefix, device.instance_id(), suffix)
    }

    /// Subscription filter covering every control suffix of the device.
    pub fn control_filter(&self, device: &Device) -> String {
        format!("{}/{}/control/#", self.prefix, device.instance_id())
    }

    /// Per-device availability topic.
    pub fn availability(&self, device: &Device) -> String {
        format!("{}/{}/availability", self.prefix, device.instance_id())
    }

    /// Bridge-wide availability topic, also used as the MQTT last will.
    pub fn bridge_availability(&self) -> String {
        format!("{}/availability", self.prefix)
    }

    /// Classify an inbound topic; unrelated topics yield `None`.
    pub fn route(&self, topic: &str) -> Option<TopicRoute> {
        if let Some(rest) = topic.strip_prefix(VENDOR_ROOT).and_then(|r| r.strip_prefix('/')) {
            let parts: Vec<&str> = rest.split('/').collect();
            return match parts.as_slice() {
                [family, "device", instance_id, "ctrl"]
                    if !family.is_empty() && !instance_id.is_empty() =>
                {
                    Some(TopicRoute::DeviceMessage {
                        family: (*family).to_owned(),
                        instance_id: (*instance_id).to_owned(),
                    })
                }
                _ => None,
            };
        }

        let rest = topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix('/'))?;
        let (instance_id, rest) = rest.split_once('/')?;
        let suffix = rest.strip_prefix("control/")?;
        if instance_id.is_empty() || suffix.is_empty() {
            return None;
        }
        Some(TopicRoute::Control {
            instance_id: instance_id.to_owned(),
            suffix: suffix.to_owned(),
        })
    }
}
