//! ---
//! hm_section: "02-protocol-engine"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Device protocol translation engine."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Entity descriptors consumed by an external discovery renderer.
//!
//! The engine only describes entities and exposes the state they read; the
//! serialized discovery payload shape belongs to the renderer.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::control::ControlCommand;
use crate::definition::{AuxiliaryInfo, Registry};
use crate::device::Device;
use crate::store::DeviceStateStore;
use crate::EngineCondition;

/// Entity category understood by automation platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Read-only measurement.
    Sensor,
    /// Read-only on/off state.
    BinarySensor,
    /// Stateless trigger bound to a control suffix.
    Button,
    /// Numeric setting bound to a control suffix.
    Number,
}

/// Description of one entity exposed for a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityDescriptor {
    /// Stable object id, e.g. `battery_soc`.
    pub object_id: String,
    /// Human readable name.
    pub name: String,
    /// Entity category.
    pub kind: EntityKind,
    /// Key into the flattened state (`slot.path`) the entity reads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// Platform device class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    /// Unit of measurement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Control suffix commanded by the entity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_suffix: Option<String>,
    /// Inclusive bounds for [`EntityKind::Number`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<(i64, i64)>,
}

impl EntityDescriptor {
    fn bare(object_id: &str, name: &str, kind: EntityKind) -> Self {
        Self {
            object_id: object_id.to_owned(),
            name: name.to_owned(),
            kind,
            state_key: None,
            device_class: None,
            unit: None,
            command_suffix: None,
            range: None,
        }
    }

    /// Sensor reading `state_key`.
    pub fn sensor(object_id: &str, name: &str, state_key: &str) -> Self {
        Self {
            state_key: Some(state_key.to_owned()),
            ..Self::bare(object_id, name, EntityKind::Sensor)
        }
    }

    /// Binary sensor reading `state_key`.
    pub fn binary_sensor(object_id: &str, name: &str, state_key: &str) -> Self {
        Self {
            state_key: Some(state_key.to_owned()),
            ..Self::bare(object_id, name, EntityKind::BinarySensor)
        }
    }

    /// Button publishing to control `suffix`.
    pub fn button(object_id: &str, name: &str, suffix: &str) -> Self {
        Self {
            command_suffix: Some(suffix.to_owned()),
            ..Self::bare(object_id, name, EntityKind::Button)
        }
    }

    /// Set the device class.
    pub fn with_class(mut self, device_class: &str) -> Self {
        self.device_class = Some(device_class.to_owned());
        self
    }

    /// Set the unit of measurement.
    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_owned());
        self
    }
}

fn humanize(suffix: &str) -> String {
    let mut name = String::with_capacity(suffix.len());
    for (pos, word) in suffix.split('-').enumerate() {
        if pos > 0 {
            name.push(' ');
        }
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            name.extend(first.to_uppercase());
            name.push_str(chars.as_str());
        }
    }
    name
}

/// Declared entities of `family` plus one button or number per control
/// suffix no declared entity commands.
pub fn entities(
    registry: &Registry,
    family: &str,
) -> Result<Vec<EntityDescriptor>, EngineCondition> {
    let definition = registry.require(family)?;
    let mut entities = definition.entities().to_vec();
    for (suffix, command) in definition.controls().iter() {
        if entities
            .iter()
            .any(|entity| entity.command_suffix.as_deref() == Some(suffix))
        {
            continue;
        }
        let object_id = suffix.replace('-', "_");
        let name = humanize(suffix);
        let entity = match command {
            ControlCommand::Fixed(_) | ControlCommand::SyncTime { .. } => {
                EntityDescriptor::button(&object_id, &name, suffix)
            }
            ControlCommand::Value { min, max, .. } => EntityDescriptor {
                command_suffix: Some(suffix.to_owned()),
                range: Some((*min, *max)),
                ..EntityDescriptor::bare(&object_id, &name, EntityKind::Number)
            },
        };
        entities.push(entity);
    }
    Ok(entities)
}

/// Everything a renderer needs for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoverySnapshot {
    /// Device identity.
    pub device: Device,
    /// Entities to expose.
    pub entities: Vec<EntityDescriptor>,
    /// Derived model and firmware information.
    pub auxiliary: AuxiliaryInfo,
    /// Flattened state; empty before the first message.
    pub state: BTreeMap<String, Value>,
}

/// Collect the discovery view of `device`.
pub fn snapshot(
    registry: &Registry,
    store: &DeviceStateStore,
    device: &Device,
) -> Result<DiscoverySnapshot, EngineCondition> {
    let entities = entities(registry, device.family())?;
    let state = store.state(device).unwrap_or_default();
    let auxiliary = registry.derive_auxiliary_info(device.family(), &state)?;
    Ok(DiscoverySnapshot {
        device: device.clone(),
        entities,
        auxiliary,
        state: state.flatten(),
    })
}
