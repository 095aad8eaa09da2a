//! ---
//! hm_section: "06-bridge-runtime"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Bridge runtime and lifecycle management."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Home Assistant style discovery configs rendered from a
//! [`DiscoverySnapshot`].

use hm_protocol::{DiscoverySnapshot, EntityDescriptor, EntityKind};
use hm_transport::{DeviceTopics, Publication};
use serde_json::{json, Map, Value};

const MANUFACTURER: &str = "Hame";

fn component(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Sensor => "sensor",
        EntityKind::BinarySensor => "binary_sensor",
        EntityKind::Button => "button",
        EntityKind::Number => "number",
    }
}

/// Node id shared by every entity of the device, e.g. `hm2mqtt_venus-001`.
fn node_id(topics: &DeviceTopics, view: &DiscoverySnapshot) -> String {
    format!("{}_{}", topics.prefix(), view.device.instance_id())
}

/// Config topic of one entity.
pub fn config_topic(
    discovery_prefix: &str,
    topics: &DeviceTopics,
    view: &DiscoverySnapshot,
    entity: &EntityDescriptor,
) -> String {
    format!(
        "{}/{}/{}/{}/config",
        discovery_prefix.trim_matches('/'),
        component(entity.kind),
        node_id(topics, view),
        entity.object_id
    )
}

fn device_block(topics: &DeviceTopics, view: &DiscoverySnapshot) -> Value {
    let model = view
        .auxiliary
        .get("model")
        .cloned()
        .unwrap_or_else(|| view.device.family().to_owned());
    let mut device = Map::new();
    device.insert("identifiers".into(), json!([node_id(topics, view)]));
    device.insert(
        "name".into(),
        json!(format!("{} {}", model, view.device.instance_id())),
    );
    device.insert("model".into(), json!(model));
    device.insert("manufacturer".into(), json!(MANUFACTURER));
    if let Some(firmware) = view.auxiliary.get("firmwareVersion") {
        device.insert("sw_version".into(), json!(firmware));
    }
    Value::Object(device)
}

/// Render the config body of one entity.
pub fn entity_config(
    topics: &DeviceTopics,
    view: &DiscoverySnapshot,
    entity: &EntityDescriptor,
) -> Value {
    let device = &view.device;
    let mut config = Map::new();
    config.insert("name".into(), json!(entity.name));
    config.insert(
        "unique_id".into(),
        json!(format!("{}_{}", node_id(topics, view), entity.object_id)),
    );
    config.insert(
        "availability".into(),
        json!([
            { "topic": topics.availability(device) },
            { "topic": topics.bridge_availability() },
        ]),
    );
    config.insert("availability_mode".into(), json!("all"));
    config.insert("device".into(), device_block(topics, view));

    if let Some((slot, key)) = entity.state_key.as_deref().and_then(|k| k.split_once('.')) {
        config.insert("state_topic".into(), json!(topics.state(device, slot)));
        let template = match entity.kind {
            EntityKind::BinarySensor => {
                format!("{{{{ 'ON' if value_json['{}'] else 'OFF' }}}}", key)
            }
            _ => format!("{{{{ value_json['{}'] }}}}", key),
        };
        config.insert("value_template".into(), json!(template));
    }
    if let Some(suffix) = &entity.command_suffix {
        config.insert("command_topic".into(), json!(topics.control(device, suffix)));
    }
    if let Some(class) = &entity.device_class {
        config.insert("device_class".into(), json!(class));
    }
    if let Some(unit) = &entity.unit {
        config.insert("unit_of_measurement".into(), json!(unit));
    }
    if let Some((min, max)) = entity.range {
        config.insert("min".into(), json!(min));
        config.insert("max".into(), json!(max));
    }
    Value::Object(config)
}

/// One retained publication per entity of `view`.
pub fn publications(
    discovery_prefix: &str,
    topics: &DeviceTopics,
    view: &DiscoverySnapshot,
) -> Vec<Publication> {
    view.entities
        .iter()
        .map(|entity| {
            Publication::new(
                config_topic(discovery_prefix, topics, view, entity),
                entity_config(topics, view, entity).to_string(),
            )
            .retained()
        })
        .collect()
}
