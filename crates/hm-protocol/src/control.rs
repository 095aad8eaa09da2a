//! ---
//! hm_section: "02-protocol-engine"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Device protocol translation engine."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Control topic suffix to wire command mapping.

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use indexmap::IndexMap;

use crate::definition::Registry;
use crate::EngineCondition;

/// Wire command bound to a control suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Constant payload; the message body is ignored.
    Fixed(String),
    /// Clock synchronisation: `cd=<code>` followed by the local time fields.
    SyncTime {
        /// Command code.
        code: u8,
    },
    /// Parameterised command: `<prefix>,<param>=<value>` with `value` an
    /// integer in `min..=max`.
    Value {
        /// Leading fragment, e.g. `cd=5`.
        prefix: String,
        /// Parameter key.
        param: String,
        /// Inclusive lower bound.
        min: i64,
        /// Inclusive upper bound.
        max: i64,
    },
}

impl ControlCommand {
    /// Render the wire payload for `suffix` given the control message body.
    pub fn render(
        &self,
        suffix: &str,
        message: &str,
        now: DateTime<FixedOffset>,
    ) -> Result<String, EngineCondition> {
        match self {
            ControlCommand::Fixed(payload) => Ok(payload.clone()),
            ControlCommand::SyncTime { code } => Ok(format!(
                "cd={},wy={},yy={},mm={},rr={},hh={},mn={},ss={}",
                code,
                now.offset().local_minus_utc() / 60,
                now.year() - 1900,
                now.month0(),
                now.day(),
                now.hour(),
                now.minute(),
                now.second()
            )),
            ControlCommand::Value {
                prefix,
                param,
                min,
                max,
            } => {
                let value = message
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite() && value.fract() == 0.0)
                    .map(|value| value as i64)
                    .filter(|value| (*min..=*max).contains(value))
                    .ok_or_else(|| EngineCondition::InvalidControlValue {
                        suffix: suffix.to_owned(),
                        value: message.to_owned(),
                    })?;
                Ok(format!("{},{}={}", prefix, param, value))
            }
        }
    }
}

/// Per-family map from control suffix to command, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlTable {
    commands: IndexMap<String, ControlCommand>,
}

impl ControlTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `suffix` to a constant payload.
    pub fn fixed(mut self, suffix: impl Into<String>, payload: impl Into<String>) -> Self {
        self.commands
            .insert(suffix.into(), ControlCommand::Fixed(payload.into()));
        self
    }

    /// Bind `suffix` to a clock synchronisation command.
    pub fn sync_time(mut self, suffix: impl Into<String>, code: u8) -> Self {
        self.commands
            .insert(suffix.into(), ControlCommand::SyncTime { code });
        self
    }

    /// Bind `suffix` to a range-checked parameter command.
    pub fn value(
        mut self,
        suffix: impl Into<String>,
        prefix: impl Into<String>,
        param: impl Into<String>,
        range: std::ops::RangeInclusive<i64>,
    ) -> Self {
        self.commands.insert(
            suffix.into(),
            ControlCommand::Value {
                prefix: prefix.into(),
                param: param.into(),
                min: *range.start(),
                max: *range.end(),
            },
        );
        self
    }

    /// Command bound to `suffix`; lookup is exact and case sensitive.
    pub fn get(&self, suffix: &str) -> Option<&ControlCommand> {
        self.commands.get(suffix)
    }

    /// Suffixes in declaration order.
    pub fn suffixes(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ControlCommand)> {
        self.commands.iter().map(|(suffix, command)| (suffix.as_str(), command))
    }
}

/// Resolve a control suffix for a device family.
pub fn resolve(
    registry: &Registry,
    family: &str,
    suffix: &str,
) -> Result<ControlCommand, EngineCondition> {
    let definition = registry.require(family)?;
    definition
        .controls()
        .get(suffix)
        .cloned()
        .ok_or_else(|| EngineCondition::UnrecognizedControlSuffix {
            family: family.to_owned(),
            suffix: suffix.to_owned(),
        })
}
