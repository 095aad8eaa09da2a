//! ---
//! hm_section: "02-protocol-engine"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Device protocol translation engine."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Field definition tables: which wire keys land at which address.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::{self, FieldAddress};
use crate::{DefinitionError, EngineCondition};

/// Decoded `key=value` tokens of one wire payload.
pub type TokenMap = BTreeMap<String, String>;

/// Transform applied to one raw token value.
pub type SingleTransform = Arc<dyn Fn(&str) -> Value + Send + Sync>;

/// Transform applied to the constituent tokens of a compound field.
pub type CompoundTransform = Arc<dyn Fn(&TokenMap) -> Value + Send + Sync>;

#[derive(Clone)]
enum FieldKey {
    Single {
        key: String,
        transform: Option<SingleTransform>,
    },
    Compound {
        keys: Vec<String>,
        transform: CompoundTransform,
    },
}

/// Maps one or more wire keys to a [`FieldAddress`].
#[derive(Clone)]
pub struct FieldDefinition {
    key: FieldKey,
    address: FieldAddress,
}

impl FieldDefinition {
    /// Single key using the default numeric-or-passthrough transform.
    pub fn single(key: impl Into<String>, address: &str) -> Result<Self, DefinitionError> {
        Ok(Self {
            key: FieldKey::Single {
                key: key.into(),
                transform: None,
            },
            address: FieldAddress::parse(address)?,
        })
    }

    /// Single key with an explicit transform.
    pub fn mapped<F>(
        key: impl Into<String>,
        address: &str,
        transform: F,
    ) -> Result<Self, DefinitionError>
    where
        F: Fn(&str) -> Value + Send + Sync + 'static,
    {
        Ok(Self {
            key: FieldKey::Single {
                key: key.into(),
                transform: Some(Arc::new(transform)),
            },
            address: FieldAddress::parse(address)?,
        })
    }

    /// Field assembled from several wire keys. Applied only when every key
    /// is present in the payload.
    pub fn compound<F>(keys: &[&str], address: &str, transform: F) -> Result<Self, DefinitionError>
    where
        F: Fn(&TokenMap) -> Value + Send + Sync + 'static,
    {
        if keys.is_empty() {
            return Err(DefinitionError::EmptyCompoundKey(address.to_owned()));
        }
        Ok(Self {
            key: FieldKey::Compound {
                keys: keys.iter().map(|key| (*key).to_owned()).collect(),
                transform: Arc::new(transform),
            },
            address: FieldAddress::parse(address)?,
        })
    }

    /// Target address.
    pub fn address(&self) -> &FieldAddress {
        &self.address
    }

    /// Wire keys consumed by this definition.
    pub fn keys(&self) -> Vec<&str> {
        match &self.key {
            FieldKey::Single { key, .. } => vec![key.as_str()],
            FieldKey::Compound { keys, .. } => keys.iter().map(String::as_str).collect(),
        }
    }

    /// Apply the definition to `record`.
    ///
    /// Returns `Ok(true)` when a value was written and `Ok(false)` when a
    /// single key is absent. A compound field with missing constituents is
    /// left untouched and reported as [`EngineCondition::IncompleteCompoundField`].
    pub fn apply(&self, tokens: &TokenMap, record: &mut Value) -> Result<bool, EngineCondition> {
        match &self.key {
            FieldKey::Single { key, transform } => {
                let Some(raw) = tokens.get(key) else {
                    return Ok(false);
                };
                let value = match transform {
                    Some(transform) => transform(raw),
                    None => number(raw),
                };
                address::write(record, &self.address, value);
                Ok(true)
            }
            FieldKey::Compound { keys, transform } => {
                let missing: Vec<&str> = keys
                    .iter()
                    .filter(|key| !tokens.contains_key(key.as_str()))
                    .map(String::as_str)
                    .collect();
                if !missing.is_empty() {
                    return Err(EngineCondition::IncompleteCompoundField {
                        address: self.address.to_string(),
                        detail: format!("missing {}", missing.join(", ")),
                    });
                }
                let parts: TokenMap = keys
                    .iter()
                    .filter_map(|key| tokens.get(key).map(|value| (key.clone(), value.clone())))
                    .collect();
                address::write(record, &self.address, transform(&parts));
                Ok(true)
            }
        }
    }
}

impl fmt::Debug for FieldDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDefinition")
            .field("keys", &self.keys())
            .field("address", &self.address.to_string())
            .finish()
    }
}

/// Default transform: integers and finite floats become numbers, anything
/// else passes through as a string.
pub fn number(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::from(int);
    }
    match trimmed.parse::<f64>() {
        Ok(float) if float.is_finite() => numeric(float),
        _ => Value::String(raw.to_owned()),
    }
}

/// Render a float as an integer JSON number when it has no fractional part.
pub fn numeric(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn parse_f64(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Transform multiplying the raw number; non-numeric input passes through.
pub fn multiply_by(factor: f64) -> impl Fn(&str) -> Value + Send + Sync + 'static {
    move |raw| match parse_f64(raw) {
        Some(value) => numeric(value * factor),
        None => Value::String(raw.to_owned()),
    }
}

/// Transform dividing the raw number; non-numeric input passes through.
pub fn divide_by(divisor: f64) -> impl Fn(&str) -> Value + Send + Sync + 'static {
    move |raw| match parse_f64(raw) {
        Some(value) => numeric(value / divisor),
        None => Value::String(raw.to_owned()),
    }
}

/// `"1"` is true, everything else false.
pub fn flag(raw: &str) -> Value {
    Value::Bool(raw.trim() == "1")
}

/// Raw value kept as a string.
pub fn text(raw: &str) -> Value {
    Value::String(raw.to_owned())
}

/// Transform mapping discrete codes to labels; unknown codes yield `"unknown"`.
pub fn lookup(
    table: &'static [(&'static str, &'static str)],
) -> impl Fn(&str) -> Value + Send + Sync + 'static {
    move |raw| {
        let code = raw.trim();
        let label = table
            .iter()
            .find(|(candidate, _)| *candidate == code)
            .map(|(_, label)| *label)
            .unwrap_or("unknown");
        Value::String(label.to_owned())
    }
}

/// Compound transform summing numeric constituents; non-numeric parts count as zero.
pub fn sum(parts: &TokenMap) -> Value {
    numeric(parts.values().filter_map(|raw| parse_f64(raw)).sum())
}

/// Schedule window decoded from an indexed pipe-delimited token such as
/// `tim_0=06|30|22|00|0123456|400|1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    /// Start time as `H:MM`.
    pub start_time: String,
    /// End time as `H:MM`.
    pub end_time: String,
    /// Weekday mask digits, `0` = Sunday.
    pub weekday: String,
    /// Output power in watts.
    pub power: i64,
    /// Whether the window is active.
    pub enabled: bool,
}

impl TimeWindow {
    const PARTS: usize = 7;

    /// Decode the pipe-delimited wire value. Returns `None` for malformed input.
    pub fn decode(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split('|').map(str::trim).collect();
        if parts.len() != Self::PARTS {
            return None;
        }
        let start_time = clock(parts[0], parts[1])?;
        let end_time = clock(parts[2], parts[3])?;
        let power = parts[5].parse::<i64>().ok()?;
        Some(Self {
            start_time,
            end_time,
            weekday: parts[4].to_owned(),
            power,
            enabled: parts[6] == "1",
        })
    }

    /// Encode into the wire value, the inverse of [`TimeWindow::decode`].
    pub fn encode(&self) -> Option<String> {
        let (start_hour, start_minute) = split_clock(&self.start_time)?;
        let (end_hour, end_minute) = split_clock(&self.end_time)?;
        Some(format!(
            "{}|{}|{}|{}|{}|{}|{}",
            start_hour,
            start_minute,
            end_hour,
            end_minute,
            self.weekday,
            self.power,
            if self.enabled { "1" } else { "0" }
        ))
    }

    fn write_into(&self, record: &mut Value, base: &FieldAddress) {
        address::write(record, &base.field("startTime"), Value::from(self.start_time.clone()));
        address::write(record, &base.field("endTime"), Value::from(self.end_time.clone()));
        address::write(record, &base.field("weekday"), Value::from(self.weekday.clone()));
        address::write(record, &base.field("power"), Value::from(self.power));
        address::write(record, &base.field("enabled"), Value::Bool(self.enabled));
    }
}

fn clock(hour: &str, minute: &str) -> Option<String> {
    let hour = hour.parse::<u32>().ok().filter(|h| *h <= 24)?;
    let minute = minute.parse::<u32>().ok().filter(|m| *m < 60)?;
    Some(format!("{}:{:02}", hour, minute))
}

fn split_clock(text: &str) -> Option<(u32, u32)> {
    let (hour, minute) = text.split_once(':')?;
    let hour = hour.trim().parse::<u32>().ok().filter(|h| *h <= 24)?;
    let minute = minute.trim().parse::<u32>().ok().filter(|m| *m < 60)?;
    Some((hour, minute))
}

/// Indexed time-window tokens (`<prefix><n>`) written below `address[n]`.
#[derive(Debug, Clone)]
pub struct TimeWindowField {
    prefix: String,
    address: FieldAddress,
    max_windows: usize,
}

impl TimeWindowField {
    /// Declare windows `prefix0 .. prefix{max_windows-1}` stored under `address`.
    pub fn new(
        prefix: impl Into<String>,
        address: &str,
        max_windows: usize,
    ) -> Result<Self, DefinitionError> {
        Ok(Self {
            prefix: prefix.into(),
            address: FieldAddress::parse(address)?,
            max_windows,
        })
    }

    /// Wire key prefix, e.g. `tim_`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Decode every matching token into `record`, returning one condition per
    /// malformed window.
    pub fn apply(&self, tokens: &TokenMap, record: &mut Value) -> Vec<EngineCondition> {
        let mut conditions = Vec::new();
        for (key, raw) in tokens {
            let Some(index) = key
                .strip_prefix(self.prefix.as_str())
                .and_then(|suffix| suffix.parse::<usize>().ok())
            else {
                continue;
            };
            if index >= self.max_windows {
                continue;
            }
            let base = self.address.index(index);
            match TimeWindow::decode(raw) {
                Some(window) => window.write_into(record, &base),
                None => conditions.push(EngineCondition::IncompleteCompoundField {
                    address: base.to_string(),
                    detail: format!("malformed time window {}={}", key, raw),
                }),
            }
        }
        conditions
    }
}
