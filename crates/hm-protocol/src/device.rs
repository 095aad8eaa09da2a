//! ---
//! hm_section: "02-protocol-engine"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Device protocol translation engine."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identity of a physical controller: its family and instance id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    family: String,
    instance_id: String,
}

impl Device {
    /// Construct a device identity.
    pub fn new(family: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Family identifier (e.g. `HMG`, `HMA-1`).
    pub fn family(&self) -> &str {
        &self.family
    }

    /// Instance identifier, usually the MAC-derived id printed on the unit.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Store/scheduler key in the form `family:instance_id`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.instance_id)
    }
}

impl FromStr for Device {
    type Err = String;

    /// Parse the `family:instance_id` notation used by `DEVICE_<n>` variables.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((family, instance_id)) = s.trim().split_once(':') else {
            return Err(format!("device '{}' must use the form family:id", s));
        };
        let (family, instance_id) = (family.trim(), instance_id.trim());
        if family.is_empty() || instance_id.is_empty() {
            return Err(format!("device '{}' has an empty family or id", s));
        }
        Ok(Self::new(family, instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joins_family_and_id() {
        let device = Device::new("HMA-1", "testdevice");
        assert_eq!(device.key(), "HMA-1:testdevice");
    }

    #[test]
    fn from_str_splits_on_first_colon() {
        let device: Device = "HMG:venus:001".parse().expect("parse device");
        assert_eq!(device.family(), "HMG");
        assert_eq!(device.instance_id(), "venus:001");
        assert!("HMG".parse::<Device>().is_err());
        assert!(":abc".parse::<Device>().is_err());
    }
}
