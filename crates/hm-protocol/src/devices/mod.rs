//! ---
//! hm_section: "02-protocol-engine"
//! hm_subsection: "devices"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Reference device family definitions."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Built-in device families.

use std::time::Duration;

use crate::definition::Registry;
use crate::DefinitionError;

pub mod b2500;
pub mod venus;

/// Poll intervals applied to the built-in message definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    /// Runtime telemetry.
    pub regular: Duration,
    /// Slow-changing data such as BMS details.
    pub slow: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            regular: Duration::from_secs(60),
            slow: Duration::from_secs(300),
        }
    }
}

/// Registry holding every built-in family.
pub fn builtin_registry(intervals: PollIntervals) -> Result<Registry, DefinitionError> {
    let mut registry = Registry::new();
    registry.register(venus::definition(intervals)?)?;
    registry.register(b2500::definition(intervals)?)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_lists_families_in_order() {
        let registry = builtin_registry(PollIntervals::default()).expect("builtin registry");
        assert_eq!(
            registry.families().collect::<Vec<_>>(),
            vec![venus::FAMILY, b2500::FAMILY]
        );
    }
}
