//! ---
//! hm_section: "02-protocol-engine"
//! hm_subsection: "devices"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Reference device family definitions."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Venus home battery (`HMG`).
//!
//! Runtime telemetry arrives as `cd=1`, BMS details as `cd=14`.

use serde_json::Value;

use crate::address::FieldAddress;
use crate::control::ControlTable;
use crate::definition::{discriminator, AuxiliaryInfo, DeviceDefinition, MessageDefinition};
use crate::devices::PollIntervals;
use crate::discovery::EntityDescriptor;
use crate::field::{self, FieldDefinition};
use crate::store::DeviceState;
use crate::DefinitionError;

/// Family identifier.
pub const FAMILY: &str = "HMG";

/// Number of BMS temperature sensors reported as `b_tp1..`.
pub const TEMPERATURE_SENSORS: usize = 4;

/// Number of cell voltages reported as `b_vo1..`.
pub const CELLS: usize = 16;

const WORKING_STATUS: &[(&str, &str)] = &[
    ("0", "sleep"),
    ("1", "standby"),
    ("2", "charging"),
    ("3", "discharging"),
    ("4", "backup"),
    ("5", "upgrading"),
    ("6", "bypass"),
];

const WORKING_MODE: &[(&str, &str)] = &[("0", "automatic"), ("1", "manual"), ("2", "trading")];

fn runtime(intervals: PollIntervals) -> Result<MessageDefinition, DefinitionError> {
    let hundredths = || field::divide_by(100.0);
    let is_runtime = discriminator("cd", "1");
    let message = MessageDefinition::new("data", is_runtime, intervals.regular, "cd=1")
        .with_fields([
            FieldDefinition::mapped("cel_p", "batteryCapacity", field::multiply_by(10.0))?,
            FieldDefinition::single("cel_c", "batterySoc")?,
            FieldDefinition::single("grd_o", "combinedPower")?,
            FieldDefinition::mapped("tot_i", "totalChargingCapacity", hundredths())?,
            FieldDefinition::mapped("tot_o", "totalDischargeCapacity", hundredths())?,
            FieldDefinition::mapped("ele_d", "dailyChargingCapacity", hundredths())?,
            FieldDefinition::mapped("ele_m", "monthlyChargingCapacity", hundredths())?,
            FieldDefinition::mapped("grd_d", "dailyDischargeCapacity", hundredths())?,
            FieldDefinition::mapped("grd_m", "monthlyDischargeCapacity", hundredths())?,
            FieldDefinition::mapped("grd_t", "workingStatus", field::lookup(WORKING_STATUS))?,
            FieldDefinition::mapped("wor_m", "workingMode", field::lookup(WORKING_MODE))?,
            FieldDefinition::mapped("ver", "firmwareVersion", field::text)?,
        ]);
    Ok(message)
}

fn bms(intervals: PollIntervals) -> Result<MessageDefinition, DefinitionError> {
    let is_bms = discriminator("cd", "14");
    let mut message = MessageDefinition::new("bms", is_bms, intervals.slow, "cd=14")
        .with_fields([
            FieldDefinition::single("b_soc", "soc")?,
            FieldDefinition::single("b_soh", "soh")?,
            FieldDefinition::single("b_vol", "voltage")?,
            FieldDefinition::single("b_cur", "current")?,
        ]);
    for sensor in 0..TEMPERATURE_SENSORS {
        let address = format!("temperatures[{}]", sensor);
        let key = format!("b_tp{}", sensor + 1);
        message = message.with_field(FieldDefinition::single(key, &address)?);
    }
    for cell in 0..CELLS {
        let address = format!("cellVoltages[{}]", cell);
        let key = format!("b_vo{}", cell + 1);
        message = message.with_field(FieldDefinition::single(key, &address)?);
    }
    Ok(message)
}

fn controls() -> ControlTable {
    ControlTable::new()
        .fixed("refresh", "cd=1")
        .sync_time("sync-time", 4)
        .fixed("factory-reset", "cd=5")
        .fixed("upgrade", "cd=9")
        .fixed("bms-refresh", "cd=14")
}

fn entities() -> Vec<EntityDescriptor> {
    vec![
        EntityDescriptor::sensor("battery_soc", "Battery SoC", "data.batterySoc")
            .with_class("battery")
            .with_unit("%"),
        EntityDescriptor::sensor("battery_capacity", "Battery Capacity", "data.batteryCapacity")
            .with_class("energy_storage")
            .with_unit("Wh"),
        EntityDescriptor::sensor("combined_power", "Combined Power", "data.combinedPower")
            .with_class("power")
            .with_unit("W"),
        EntityDescriptor::sensor("working_status", "Working Status", "data.workingStatus"),
        EntityDescriptor::sensor(
            "daily_charging_capacity",
            "Daily Charging",
            "data.dailyChargingCapacity",
        )
        .with_class("energy")
            .with_unit("kWh"),
        EntityDescriptor::sensor("bms_soh", "Battery Health", "bms.soh").with_unit("%"),
        EntityDescriptor::sensor("bms_voltage", "Battery Voltage", "bms.voltage")
            .with_class("voltage")
            .with_unit("mV"),
        EntityDescriptor::sensor("bms_current", "Battery Current", "bms.current")
            .with_class("current")
            .with_unit("mA"),
    ]
}

fn auxiliary(state: &DeviceState) -> AuxiliaryInfo {
    let mut info = AuxiliaryInfo::new();
    info.insert("model".to_owned(), "Venus".to_owned());
    let firmware = FieldAddress::parse("firmwareVersion")
        .ok()
        .and_then(|address| state.slot("data")?.read(&address).cloned());
    if let Some(Value::String(version)) = firmware {
        info.insert("firmwareVersion".to_owned(), version);
    }
    info
}

/// Venus family definition.
pub fn definition(intervals: PollIntervals) -> Result<DeviceDefinition, DefinitionError> {
    Ok(DeviceDefinition::new(FAMILY)
        .with_message(runtime(intervals)?)
        .with_message(bms(intervals)?)
        .with_controls(controls())
        .with_entities(entities())
        .with_auxiliary(auxiliary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use crate::definition::Registry;
    use crate::parser::parse_at;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(definition(PollIntervals::default()).expect("definition"))
            .expect("register");
        registry
    }

    fn parse(raw: &str) -> crate::parser::ParseOutcome {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).single().expect("timestamp");
        parse_at(&registry(), raw, FAMILY, "venus-001", at)
    }

    #[test]
    fn runtime_message_applies_unit_conversions() {
        let outcome =
            parse("cd=1,cel_p=300,cel_c=60,tot_i=1200,tot_o=800,grd_t=3,grd_m=5400,ele_d=123");
        let data = &outcome.records.get("data").expect("data slot").fields;
        assert_eq!(data["batteryCapacity"], json!(3000));
        assert_eq!(data["batterySoc"], json!(60));
        assert_eq!(data["totalChargingCapacity"], json!(12));
        assert_eq!(data["totalDischargeCapacity"], json!(8));
        assert_eq!(data["workingStatus"], json!("discharging"));
        assert_eq!(data["monthlyDischargeCapacity"], json!(54));
        assert_eq!(data["dailyChargingCapacity"], json!(1.23));
        assert!(!outcome.records.contains_key("bms"));
    }

    #[test]
    fn bms_message_fills_indexed_sensors() {
        let outcome = parse("cd=14,b_soc=65,b_soh=100,b_vol=5223,b_cur=-94,b_tp1=25,b_vo1=3265");
        let bms = &outcome.records.get("bms").expect("bms slot").fields;
        assert_eq!(bms["soc"], json!(65));
        assert_eq!(bms["soh"], json!(100));
        assert_eq!(bms["voltage"], json!(5223));
        assert_eq!(bms["current"], json!(-94));
        assert_eq!(bms["temperatures"], json!([25]));
        assert_eq!(bms["cellVoltages"], json!([3265]));
    }

    #[test]
    fn unknown_working_status_maps_to_unknown() {
        let outcome = parse("cd=1,grd_t=42");
        let data = &outcome.records.get("data").expect("data slot").fields;
        assert_eq!(data["workingStatus"], json!("unknown"));
    }

    #[test]
    fn auxiliary_info_reports_firmware_once_seen() {
        let registry = registry();
        let mut state = DeviceState::default();
        let info = registry.derive_auxiliary_info(FAMILY, &state).expect("aux");
        assert_eq!(info.get("model").map(String::as_str), Some("Venus"));
        assert!(!info.contains_key("firmwareVersion"));

        let outcome = parse("cd=1,ver=153");
        let record = outcome.records.get("data").cloned().expect("data slot");
        state.merge("data", record);
        let info = registry.derive_auxiliary_info(FAMILY, &state).expect("aux");
        assert_eq!(info.get("firmwareVersion").map(String::as_str), Some("153"));
    }
}
