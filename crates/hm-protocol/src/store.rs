//! ---
//! hm_section: "02-protocol-engine"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Device protocol translation engine."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Accumulated per-device state.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde_json::Value;

use crate::device::Device;
use crate::record::DeviceRecord;

/// Whether a merge created a new device entry or updated an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First record seen for the device.
    Created,
    /// Existing state was updated.
    Updated,
}

/// Latest merged record per publish slot of one device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    slots: BTreeMap<String, DeviceRecord>,
}

impl DeviceState {
    /// Record stored under `slot`.
    pub fn slot(&self, slot: &str) -> Option<&DeviceRecord> {
        self.slots.get(slot)
    }

    /// All slots in key order.
    pub fn slots(&self) -> impl Iterator<Item = (&str, &DeviceRecord)> {
        self.slots.iter().map(|(slot, record)| (slot.as_str(), record))
    }

    /// Whether nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Merge `record` into `slot`.
    pub fn merge(&mut self, slot: &str, record: DeviceRecord) {
        match self.slots.get_mut(slot) {
            Some(existing) => existing.merge_from(record),
            None => {
                self.slots.insert(slot.to_owned(), record);
            }
        }
    }

    /// Flat `slot.path` view of all leaves, plus `slot.timestamp` per slot.
    ///
    /// Array elements render as `path[i]`. Holes and raw token values are
    /// excluded.
    pub fn flatten(&self) -> BTreeMap<String, Value> {
        let mut flat = BTreeMap::new();
        for (slot, record) in &self.slots {
            flatten_into(&mut flat, slot.clone(), &record.fields);
            flat.insert(
                format!("{}.timestamp", slot),
                Value::String(record.timestamp.to_rfc3339()),
            );
        }
        flat
    }

    /// Flat view of one slot with keys relative to the slot, including
    /// `timestamp`.
    pub fn flatten_slot(&self, slot: &str) -> Option<BTreeMap<String, Value>> {
        let record = self.slots.get(slot)?;
        let mut flat = BTreeMap::new();
        if let Value::Object(map) = &record.fields {
            for (key, child) in map {
                flatten_into(&mut flat, key.clone(), child);
            }
        }
        flat.insert(
            "timestamp".to_owned(),
            Value::String(record.timestamp.to_rfc3339()),
        );
        Some(flat)
    }
}

fn flatten_into(flat: &mut BTreeMap<String, Value>, prefix: String, value: &Value) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(flat, format!("{}.{}", prefix, key), child);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(flat, format!("{}[{}]", prefix, index), child);
            }
        }
        leaf => {
            flat.insert(prefix, leaf.clone());
        }
    }
}

/// Thread-safe map from device to its accumulated state.
#[derive(Debug, Default)]
pub struct DeviceStateStore {
    inner: Mutex<HashMap<Device, DeviceState>>,
}

impl DeviceStateStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a record into the device's slot.
    pub fn merge(&self, device: &Device, slot: &str, record: DeviceRecord) -> MergeOutcome {
        let mut guard = self.inner.lock();
        let outcome = if guard.contains_key(device) {
            MergeOutcome::Updated
        } else {
            MergeOutcome::Created
        };
        guard.entry(device.clone()).or_default().merge(slot, record);
        outcome
    }

    /// Snapshot of one slot.
    pub fn get(&self, device: &Device, slot: &str) -> Option<DeviceRecord> {
        self.inner
            .lock()
            .get(device)
            .and_then(|state| state.slot(slot).cloned())
    }

    /// Snapshot of the full device state.
    pub fn state(&self, device: &Device) -> Option<DeviceState> {
        self.inner.lock().get(device).cloned()
    }

    /// Whether any record has been stored for the device.
    pub fn exists(&self, device: &Device) -> bool {
        self.inner.lock().contains_key(device)
    }

    /// Flattened view of the device state.
    pub fn flatten(&self, device: &Device) -> Option<BTreeMap<String, Value>> {
        self.inner.lock().get(device).map(DeviceState::flatten)
    }

    /// Flattened view of one slot, keys relative to the slot.
    pub fn flatten_slot(&self, device: &Device, slot: &str) -> Option<BTreeMap<String, Value>> {
        self.inner
            .lock()
            .get(device)
            .and_then(|state| state.flatten_slot(slot))
    }

    /// Known devices, sorted.
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.inner.lock().keys().cloned().collect();
        devices.sort();
        devices
    }

    /// Drop a device's state.
    pub fn remove(&self, device: &Device) -> Option<DeviceState> {
        self.inner.lock().remove(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record(device: &Device, fields: Value) -> DeviceRecord {
        let mut record = DeviceRecord::new(
            device.clone(),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("timestamp"),
        );
        record.fields = fields;
        record
    }

    #[test]
    fn merge_reports_created_then_updated() {
        let store = DeviceStateStore::new();
        let device = Device::new("HMG", "abc");
        assert!(!store.exists(&device));
        assert_eq!(
            store.merge(&device, "data", record(&device, json!({ "batterySoc": 50 }))),
            MergeOutcome::Created
        );
        assert_eq!(
            store.merge(&device, "bms", record(&device, json!({ "soh": 99 }))),
            MergeOutcome::Updated
        );
        let state = store.state(&device).expect("state");
        assert_eq!(state.slots().count(), 2);
    }

    #[test]
    fn slots_are_independent() {
        let store = DeviceStateStore::new();
        let device = Device::new("HMG", "abc");
        store.merge(&device, "data", record(&device, json!({ "batterySoc": 50 })));
        store.merge(&device, "bms", record(&device, json!({ "batterySoc": 10 })));
        let data = store.get(&device, "data").expect("data");
        assert_eq!(data.fields, json!({ "batterySoc": 50 }));
    }

    #[test]
    fn flatten_renders_paths_and_skips_holes() {
        let store = DeviceStateStore::new();
        let device = Device::new("HMG", "abc");
        store.merge(
            &device,
            "bms",
            record(
                &device,
                json!({ "soc": 80, "cellVoltages": [null, 3300], "temps": { "low": 18 } }),
            ),
        );
        let flat = store.flatten(&device).expect("flattened");
        assert_eq!(flat.get("bms.soc"), Some(&json!(80)));
        assert_eq!(flat.get("bms.cellVoltages[1]"), Some(&json!(3300)));
        assert_eq!(flat.get("bms.temps.low"), Some(&json!(18)));
        assert!(!flat.contains_key("bms.cellVoltages[0]"));
        assert_eq!(
            flat.get("bms.timestamp"),
            Some(&json!("2024-05-01T12:00:00+00:00"))
        );
        assert_eq!(flat.len(), 4);

        let slot = store.flatten_slot(&device, "bms").expect("bms slot");
        assert_eq!(slot.get("soc"), Some(&json!(80)));
        assert_eq!(slot.get("cellVoltages[1]"), Some(&json!(3300)));
        assert!(slot.contains_key("timestamp"));
        assert_eq!(store.flatten_slot(&device, "data"), None);
    }

    #[test]
    fn remove_forgets_device() {
        let store = DeviceStateStore::new();
        let device = Device::new("HMG", "abc");
        store.merge(&device, "data", record(&device, json!({ "a": 1 })));
        assert!(store.remove(&device).is_some());
        assert!(store.devices().is_empty());
        assert_eq!(store.flatten(&device), None);
    }
}
