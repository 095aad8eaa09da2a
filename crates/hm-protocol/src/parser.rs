//! ---
//! hm_section: "02-protocol-engine"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Device protocol translation engine."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Wire payload decoding.
//!
//! A payload is a comma-separated list of `key=value` tokens. Tokens
//! without `=` or with an empty key are dropped; when a key repeats the
//! last occurrence wins.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::definition::Registry;
use crate::device::Device;
use crate::field::TokenMap;
use crate::record::DeviceRecord;
use crate::EngineCondition;

/// Result of decoding one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome {
    /// Device the payload was addressed from.
    pub device: Device,
    /// One record per matched message, keyed by publish slot.
    pub records: IndexMap<String, DeviceRecord>,
    /// Non-fatal conditions raised while decoding.
    pub conditions: Vec<EngineCondition>,
    /// Tokens dropped by the tokenizer.
    pub dropped_tokens: Vec<String>,
}

impl ParseOutcome {
    fn empty(device: Device) -> Self {
        Self {
            device,
            records: IndexMap::new(),
            conditions: Vec::new(),
            dropped_tokens: Vec::new(),
        }
    }

    /// Whether at least one message definition matched.
    pub fn matched(&self) -> bool {
        !self.records.is_empty()
    }

    /// Publish slots that received a record.
    pub fn slots(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }
}

/// Split a raw payload into tokens, returning the dropped fragments too.
pub fn tokenize(raw: &str) -> (TokenMap, Vec<String>) {
    let mut tokens = TokenMap::new();
    let mut dropped = Vec::new();
    for fragment in raw.split(',') {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            continue;
        }
        match fragment.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                tokens.insert(key.trim().to_owned(), value.trim().to_owned());
            }
            _ => dropped.push(fragment.to_owned()),
        }
    }
    (tokens, dropped)
}

/// Decode `raw` from device `instance_id` of `family`, stamped with the current time.
pub fn parse(registry: &Registry, raw: &str, family: &str, instance_id: &str) -> ParseOutcome {
    parse_at(registry, raw, family, instance_id, Utc::now())
}

/// Decode `raw` with an explicit capture time.
///
/// Every message definition whose predicate matches contributes one record.
/// Unknown families and unmatched payloads yield an outcome without records.
pub fn parse_at(
    registry: &Registry,
    raw: &str,
    family: &str,
    instance_id: &str,
    captured_at: DateTime<Utc>,
) -> ParseOutcome {
    let device = Device::new(family, instance_id);
    let mut outcome = ParseOutcome::empty(device.clone());

    let definition = match registry.require(family) {
        Ok(definition) => definition,
        Err(condition) => {
            warn!(family, device = instance_id, "payload for unknown device family");
            outcome.conditions.push(condition);
            return outcome;
        }
    };

    let (tokens, dropped) = tokenize(raw);
    if !dropped.is_empty() {
        debug!(device = %device, dropped = ?dropped, "dropped malformed tokens");
    }
    outcome.dropped_tokens = dropped;

    for message in definition.messages() {
        if !message.matches(&tokens) {
            continue;
        }
        let mut record = DeviceRecord::new(device.clone(), captured_at);
        record.values = tokens.clone();
        for field in message.fields() {
            if let Err(condition) = field.apply(&tokens, &mut record.fields) {
                warn!(device = %device, message = message.name(), %condition, "skipping field");
                outcome.conditions.push(condition);
            }
        }
        for windows in message.time_windows() {
            for condition in windows.apply(&tokens, &mut record.fields) {
                warn!(
                    device = %device,
                    message = message.name(),
                    %condition,
                    "skipping time window"
                );
                outcome.conditions.push(condition);
            }
        }
        match outcome.records.get_mut(message.publish_slot()) {
            Some(existing) => existing.merge_from(record),
            None => {
                outcome
                    .records
                    .insert(message.publish_slot().to_owned(), record);
            }
        }
    }

    if !outcome.matched() {
        debug!(device = %device, "payload matched no message definition");
    }
    outcome
}
