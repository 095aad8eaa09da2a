//! ---
//! hm_section: "02-protocol-engine"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Device protocol translation engine."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::address::{self, FieldAddress};
use crate::device::Device;
use crate::field::TokenMap;

/// Structured data decoded from one payload for one message slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    /// Originating device.
    pub device: Device,
    /// Capture time of the payload; after merging, the newest capture.
    pub timestamp: DateTime<Utc>,
    /// Raw tokens the record was decoded from.
    pub values: TokenMap,
    /// Decoded field tree. Always a JSON object.
    pub fields: Value,
}

impl DeviceRecord {
    /// Empty record for `device` captured at `timestamp`.
    pub fn new(device: Device, timestamp: DateTime<Utc>) -> Self {
        Self {
            device,
            timestamp,
            values: TokenMap::new(),
            fields: Value::Object(Map::new()),
        }
    }

    /// Value at `address`, ignoring holes.
    pub fn read(&self, address: &FieldAddress) -> Option<&Value> {
        address::read(&self.fields, address)
    }

    /// Write `value` at `address`.
    pub fn write(&mut self, address: &FieldAddress, value: Value) {
        address::write(&mut self.fields, address, value);
    }

    /// Whether no field was decoded.
    pub fn is_empty(&self) -> bool {
        self.fields.as_object().map_or(true, Map::is_empty)
    }

    /// Deep-merge a newer partial record into this one.
    ///
    /// Fields present in `partial` overwrite, fields it lacks are retained.
    /// Holes in the partial never erase stored values.
    pub fn merge_from(&mut self, partial: DeviceRecord) {
        merge_value(&mut self.fields, partial.fields);
        self.values.extend(partial.values);
        if partial.timestamp > self.timestamp {
            self.timestamp = partial.timestamp;
        }
    }
}

fn merge_value(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (_, Value::Null) => {}
        (Value::Object(stored), Value::Object(fresh)) => {
            for (key, value) in fresh {
                match stored.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None if !value.is_null() => {
                        stored.insert(key, value);
                    }
                    None => {}
                }
            }
        }
        (Value::Array(stored), Value::Array(fresh)) => {
            for (index, value) in fresh.into_iter().enumerate() {
                if index < stored.len() {
                    merge_value(&mut stored[index], value);
                } else {
                    stored.push(value);
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
