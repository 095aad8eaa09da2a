//! ---
//! hm_section: "02-protocol-engine"
//! hm_subsection: "devices"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Reference device family definitions."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! B2500 balcony storage (`HMA-1`).
//!
//! The device answers `cd=1` with one status payload carrying short keys
//! (`pe`, `kn`, `w1` ...) and up to five `tim_<n>` schedule windows.

use serde_json::Value;

use crate::address::FieldAddress;
use crate::control::ControlTable;
use crate::definition::{has_keys, AuxiliaryInfo, DeviceDefinition, MessageDefinition};
use crate::devices::PollIntervals;
use crate::discovery::EntityDescriptor;
use crate::field::{self, FieldDefinition, TimeWindowField};
use crate::store::DeviceState;
use crate::DefinitionError;

/// Family identifier.
pub const FAMILY: &str = "HMA-1";

/// Schedule windows supported by the firmware.
pub const TIME_WINDOWS: usize = 5;

fn status(intervals: PollIntervals) -> Result<MessageDefinition, DefinitionError> {
    let message = MessageDefinition::new("data", has_keys(&["pe"]), intervals.regular, "cd=1")
        .with_fields([
            FieldDefinition::single("pe", "batteryPercentage")?,
            FieldDefinition::single("kn", "batteryCapacity")?,
            FieldDefinition::single("w1", "solarPower.input1")?,
            FieldDefinition::single("w2", "solarPower.input2")?,
            FieldDefinition::compound(&["w1", "w2"], "solarPower.total", field::sum)?,
            FieldDefinition::single("g1", "gridPower.input1")?,
            FieldDefinition::single("g2", "gridPower.input2")?,
            FieldDefinition::compound(&["g1", "g2"], "gridPower.total", field::sum)?,
            FieldDefinition::single("tl", "temperature.low")?,
            FieldDefinition::single("th", "temperature.high")?,
            FieldDefinition::single("do", "depthOfDischarge")?,
            FieldDefinition::single("lv", "outputThreshold")?,
            FieldDefinition::mapped("vv", "deviceInfo.firmwareVersion", field::text)?,
            FieldDefinition::mapped("p1", "solarPower.input1Active", field::flag)?,
            FieldDefinition::mapped("p2", "solarPower.input2Active", field::flag)?,
        ])
        .with_time_windows(TimeWindowField::new("tim_", "timePeriods", TIME_WINDOWS)?);
    Ok(message)
}

fn controls() -> ControlTable {
    ControlTable::new()
        .fixed("refresh", "cd=1")
        .value("discharge-depth", "cd=5", "md", 0..=100)
        .sync_time("sync-time", 8)
        .fixed("restart", "cd=10")
        .fixed("factory-reset", "cd=11")
}

fn entities() -> Vec<EntityDescriptor> {
    vec![
        EntityDescriptor::sensor(
            "battery_percentage",
            "Battery Percentage",
            "data.batteryPercentage",
        )
        .with_class("battery")
            .with_unit("%"),
        EntityDescriptor::sensor("battery_capacity", "Battery Capacity", "data.batteryCapacity")
            .with_class("energy_storage")
            .with_unit("Wh"),
        EntityDescriptor::sensor("solar_power_total", "Solar Power", "data.solarPower.total")
            .with_class("power")
            .with_unit("W"),
        EntityDescriptor::sensor("grid_power_total", "Output Power", "data.gridPower.total")
            .with_class("power")
            .with_unit("W"),
        EntityDescriptor::sensor("temperature_high", "Temperature", "data.temperature.high")
            .with_class("temperature")
            .with_unit("°C"),
        EntityDescriptor::binary_sensor(
            "input1_active",
            "Solar Input 1",
            "data.solarPower.input1Active",
        ),
        EntityDescriptor::binary_sensor(
            "input2_active",
            "Solar Input 2",
            "data.solarPower.input2Active",
        ),
    ]
}

fn auxiliary(state: &DeviceState) -> AuxiliaryInfo {
    let mut info = AuxiliaryInfo::new();
    info.insert("model".to_owned(), "B2500".to_owned());
    let firmware = FieldAddress::parse("deviceInfo.firmwareVersion")
        .ok()
        .and_then(|address| state.slot("data")?.read(&address).cloned());
    if let Some(Value::String(version)) = firmware {
        info.insert("firmwareVersion".to_owned(), version);
    }
    info
}

/// B2500 family definition.
pub fn definition(intervals: PollIntervals) -> Result<DeviceDefinition, DefinitionError> {
    Ok(DeviceDefinition::new(FAMILY)
        .with_message(status(intervals)?)
        .with_controls(controls())
        .with_entities(entities())
        .with_auxiliary(auxiliary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use crate::definition::Registry;
    use crate::parser::parse_at;
    use crate::EngineCondition;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(definition(PollIntervals::default()).expect("definition"))
            .expect("register");
        registry
    }

    #[test]
    fn status_payload_uses_alias_addresses() {
        let outcome = parse_at(
            &registry(),
            "pe=85,kn=300,w1=120,w2=80,g1=60,g2=40,tl=18,th=24,do=90,vv=224",
            FAMILY,
            "testdevice",
            Utc::now(),
        );
        let data = &outcome.records.get("data").expect("data slot").fields;
        assert_eq!(data["batteryPercentage"], json!(85));
        assert_eq!(data["batteryCapacity"], json!(300));
        assert_eq!(data["solarPower"], json!({ "input1": 120, "input2": 80, "total": 200 }));
        assert_eq!(data["gridPower"]["total"], json!(100));
        assert_eq!(data["temperature"], json!({ "low": 18, "high": 24 }));
        assert_eq!(data["depthOfDischarge"], json!(90));
        assert_eq!(data["deviceInfo"]["firmwareVersion"], json!("224"));
        assert!(outcome.conditions.is_empty());
    }

    #[test]
    fn time_windows_decode_into_periods() {
        let outcome = parse_at(
            &registry(),
            "pe=85,kn=300,tim_0=06|30|22|00|0123456|400|1",
            FAMILY,
            "testdevice",
            Utc::now(),
        );
        let data = &outcome.records.get("data").expect("data slot").fields;
        assert_eq!(
            data["timePeriods"][0],
            json!({
                "startTime": "6:30",
                "endTime": "22:00",
                "weekday": "0123456",
                "power": 400,
                "enabled": true
            })
        );
    }

    #[test]
    fn partial_solar_inputs_skip_total() {
        let outcome = parse_at(&registry(), "pe=50,w1=120", FAMILY, "testdevice", Utc::now());
        let data = &outcome.records.get("data").expect("data slot").fields;
        assert_eq!(data["solarPower"], json!({ "input1": 120 }));
        assert!(matches!(
            outcome.conditions.as_slice(),
            [
                EngineCondition::IncompleteCompoundField { .. },
                EngineCondition::IncompleteCompoundField { .. }
            ]
        ));
    }

    #[test]
    fn payload_without_percentage_is_ignored() {
        let outcome = parse_at(&registry(), "kn=300,w1=5", FAMILY, "testdevice", Utc::now());
        assert!(!outcome.matched());
    }
}
