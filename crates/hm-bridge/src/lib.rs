//! ---
//! hm_section: "06-bridge-runtime"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Bridge runtime and lifecycle management."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Bridge runtime: routes device and control traffic through the protocol
//! engine and drives polling.
#![warn(missing_docs)]

pub mod bridge;
pub mod discovery;
pub mod settings;

pub use bridge::{Bridge, InboundOutcome};
pub use settings::BridgeSettings;
