//! ---
//! hm_section: "02-protocol-engine"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Device protocol translation engine."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Translation engine between the Hame `key=value` wire dialect and
//! structured per-device state.
//!
//! The engine is transport agnostic: callers feed raw payloads into
//! [`parser::parse`], merge the resulting records into a
//! [`store::DeviceStateStore`], drive a [`scheduler::PollScheduler`] from
//! their own timers and resolve control topics through [`control::resolve`].
#![warn(missing_docs)]

pub mod address;
pub mod control;
pub mod definition;
pub mod device;
pub mod devices;
pub mod discovery;
pub mod field;
pub mod parser;
pub mod record;
pub mod scheduler;
pub mod store;

/// Non-fatal conditions reported by the engine.
///
/// None of these abort processing; they are surfaced to the caller which
/// decides whether to log, count or ignore them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineCondition {
    /// The payload or command named a family absent from the registry.
    #[error("unknown device family '{family}'")]
    UnknownFamily {
        /// Family identifier as received.
        family: String,
    },
    /// A control topic suffix has no entry in the family's control table.
    #[error("unrecognized control suffix '{suffix}' for family '{family}'")]
    UnrecognizedControlSuffix {
        /// Family identifier of the addressed device.
        family: String,
        /// Suffix as received, without normalization.
        suffix: String,
    },
    /// A compound field could not be assembled from the current payload.
    #[error("incomplete compound field '{address}': {detail}")]
    IncompleteCompoundField {
        /// Target address of the skipped field.
        address: String,
        /// Missing keys or malformed value description.
        detail: String,
    },
    /// A parameterised control command received an unusable value.
    #[error("invalid value '{value}' for control '{suffix}'")]
    InvalidControlValue {
        /// Control suffix.
        suffix: String,
        /// Value as received.
        value: String,
    },
}

impl EngineCondition {
    /// Stable label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineCondition::UnknownFamily { .. } => "unknown_family",
            EngineCondition::UnrecognizedControlSuffix { .. } => "unrecognized_control_suffix",
            EngineCondition::IncompleteCompoundField { .. } => "incomplete_compound_field",
            EngineCondition::InvalidControlValue { .. } => "invalid_control_value",
        }
    }
}

/// Hard failures raised while building device definitions.
///
/// These only occur at registration time; a registry that was built
/// successfully never produces them while parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    /// A field address could not be parsed.
    #[error("malformed field address '{address}': {reason}")]
    MalformedAddress {
        /// Address text as written in the definition.
        address: String,
        /// Explanation of the problem.
        reason: &'static str,
    },
    /// A compound field was declared without constituent keys.
    #[error("compound field '{0}' declares no wire keys")]
    EmptyCompoundKey(String),
    /// The same family identifier was registered twice.
    #[error("device family '{0}' registered twice")]
    DuplicateFamily(String),
    /// A family was registered without any message definitions.
    #[error("device family '{0}' declares no message definitions")]
    EmptyFamily(String),
}

pub use address::{FieldAddress, Segment};
pub use control::{resolve, ControlCommand, ControlTable};
pub use definition::{AuxiliaryInfo, DeviceDefinition, MessageDefinition, Registry};
pub use device::Device;
pub use devices::{builtin_registry, PollIntervals};
pub use discovery::{DiscoverySnapshot, EntityDescriptor, EntityKind};
pub use field::{FieldDefinition, TimeWindow, TimeWindowField, TokenMap};
pub use parser::{parse, parse_at, tokenize, ParseOutcome};
pub use record::DeviceRecord;
pub use scheduler::{
    ArmedTimer, Availability, DeviceUnreachable, PollRequest, PollScheduler, ResponseOutcome,
    SchedulerSettings, SlotPhase, TickPlan, TimerToken,
};
pub use store::{DeviceState, DeviceStateStore, MergeOutcome};
