//! ---
//! hm_section: "02-protocol-engine"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Device protocol translation engine."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Field addresses and navigation inside decoded device records.
//!
//! Arrays grown by [`write`] are padded with `Null` holes. Holes are treated as
//! absent: [`read`] returns `None` for them, flattening skips them and merging
//! never lets a hole overwrite a stored value.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::DefinitionError;

/// One step of a [`FieldAddress`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Object member.
    Field(String),
    /// Array element.
    Index(usize),
}

/// Static path to a leaf inside a device record, e.g. `timePeriods[0].startTime`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldAddress {
    segments: Vec<Segment>,
}

impl FieldAddress {
    /// Parse the textual address notation.
    ///
    /// The first segment must be a field name; indices are written in
    /// brackets directly after a name.
    pub fn parse(text: &str) -> Result<Self, DefinitionError> {
        let malformed = |reason| DefinitionError::MalformedAddress {
            address: text.to_owned(),
            reason,
        };
        if text.trim().is_empty() {
            return Err(malformed("address is empty"));
        }

        let mut segments = Vec::new();
        for part in text.split('.') {
            let (name, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };
            if name.is_empty() {
                return Err(malformed("empty field name"));
            }
            if name.contains(']') {
                return Err(malformed("unbalanced bracket"));
            }
            segments.push(Segment::Field(name.to_owned()));
            while !rest.is_empty() {
                let Some(close) = rest.find(']') else {
                    return Err(malformed("unbalanced bracket"));
                };
                if !rest.starts_with('[') {
                    return Err(malformed("unexpected characters after index"));
                }
                let index = rest[1..close]
                    .parse::<usize>()
                    .map_err(|_| malformed("index is not a non-negative integer"))?;
                segments.push(Segment::Index(index));
                rest = &rest[close + 1..];
            }
        }
        Ok(Self { segments })
    }

    /// Segments in navigation order. Never empty.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Address of a named member below this address.
    pub fn field(&self, name: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment::Field(name.into()));
        Self { segments }
    }

    /// Address of an array element below this address.
    pub fn index(&self, index: usize) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment::Index(index));
        Self { segments }
    }
}

impl fmt::Display for FieldAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pos, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Field(name) if pos == 0 => write!(f, "{}", name)?,
                Segment::Field(name) => write!(f, ".{}", name)?,
                Segment::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

impl FromStr for FieldAddress {
    type Err = DefinitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Write `value` at `address`, creating intermediate objects or arrays.
///
/// A missing intermediate becomes an array when the following segment is an
/// index and an object otherwise. A scalar sitting where a container is
/// required is replaced.
pub fn write(record: &mut Value, address: &FieldAddress, value: Value) {
    let mut current = record;
    for segment in address.segments() {
        current = child_slot(current, segment);
    }
    *current = value;
}

/// Read the value at `address`; holes and missing paths yield `None`.
pub fn read<'a>(record: &'a Value, address: &FieldAddress) -> Option<&'a Value> {
    let mut current = record;
    for segment in address.segments() {
        current = match (segment, current) {
            (Segment::Field(name), Value::Object(map)) => map.get(name)?,
            (Segment::Index(index), Value::Array(items)) => items.get(*index)?,
            _ => return None,
        };
    }
    (!current.is_null()).then_some(current)
}

fn child_slot<'a>(current: &'a mut Value, segment: &Segment) -> &'a mut Value {
    match segment {
        Segment::Field(name) => ensure_object(current)
            .entry(name.clone())
            .or_insert(Value::Null),
        Segment::Index(index) => {
            let items = ensure_array(current);
            if items.len() <= *index {
                items.resize(*index + 1, Value::Null);
            }
            &mut items[*index]
        }
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            *other = Value::Object(Map::new());
            ensure_object(other)
        }
    }
}

fn ensure_array(value: &mut Value) -> &mut Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => {
            *other = Value::Array(Vec::new());
            ensure_array(other)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(text: &str) -> FieldAddress {
        FieldAddress::parse(text).expect("valid address")
    }

    #[test]
    fn parse_and_display_are_symmetric() {
        let address = addr("timePeriods[2].startTime");
        assert_eq!(
            address.segments(),
            &[
                Segment::Field("timePeriods".into()),
                Segment::Index(2),
                Segment::Field("startTime".into()),
            ]
        );
        assert_eq!(address.to_string(), "timePeriods[2].startTime");
        assert_eq!(addr("cells[1][3]").segments().len(), 3);
    }

    #[test]
    fn parse_rejects_malformed_addresses() {
        for text in ["", "a..b", "[0].a", "a[x]", "a[1", "a[1]b", "a]"] {
            assert!(
                FieldAddress::parse(text).is_err(),
                "expected '{}' to be rejected",
                text
            );
        }
    }

    #[test]
    fn write_creates_objects_and_arrays_from_next_segment() {
        let mut record = json!({});
        write(&mut record, &addr("solarPower.input1"), json!(120));
        write(&mut record, &addr("timePeriods[0].enabled"), json!(true));
        assert_eq!(
            record,
            json!({
                "solarPower": { "input1": 120 },
                "timePeriods": [ { "enabled": true } ]
            })
        );
    }

    #[test]
    fn sparse_index_leaves_holes_that_read_as_absent() {
        let mut record = json!({});
        write(&mut record, &addr("cells[5]"), json!(3265));
        assert_eq!(record["cells"].as_array().map(Vec::len), Some(6));
        assert_eq!(read(&record, &addr("cells[5]")), Some(&json!(3265)));
        assert_eq!(read(&record, &addr("cells[2]")), None);
        assert_eq!(read(&record, &addr("cells[9]")), None);
    }

    #[test]
    fn write_replaces_scalar_in_container_position() {
        let mut record = json!({ "temperature": 21 });
        write(&mut record, &addr("temperature.low"), json!(18));
        assert_eq!(record, json!({ "temperature": { "low": 18 } }));
    }
}
