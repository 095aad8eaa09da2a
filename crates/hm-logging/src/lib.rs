//! ---
//! hm_section: "03-logging"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Structured logging adapters."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Device-scoped logging helpers for the bridge runtime.
#![warn(missing_docs)]

use tracing::Level;

pub mod macros;

#[doc(hidden)]
pub use tracing;

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogContext<'a> {
    /// Device family (`HMG`, `HMA-1`, ...).
    pub family: Option<&'a str>,
    /// Device instance id.
    pub device: Option<&'a str>,
    /// Publish slot the event concerns.
    pub slot: Option<&'a str>,
    /// Poll tick sequence number.
    pub tick: Option<u64>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for one device.
    pub fn for_device(family: &'a str, device: &'a str) -> Self {
        Self {
            family: Some(family),
            device: Some(device),
            ..Self::default()
        }
    }

    /// Attach a publish slot.
    pub fn with_slot(mut self, slot: &'a str) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Attach a tick value.
    pub fn with_tick(mut self, tick: u64) -> Self {
        self.tick = Some(tick);
        self
    }
}

/// Outcome attached to device lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventOutcome {
    /// The operation completed.
    Success,
    /// The operation was skipped or degraded but processing continues.
    Degraded,
    /// The operation failed.
    Fault,
}

impl DeviceEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            DeviceEventOutcome::Success => "success",
            DeviceEventOutcome::Degraded => "degraded",
            DeviceEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized device event such as `device.online` or `device.unreachable`.
pub fn log_device_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: DeviceEventOutcome,
) {
    let ctx = context.copied().unwrap_or_default();
    macro_rules! emit {
        ($level:expr) => {
            tracing::event!(
                $level,
                event,
                outcome = outcome.as_str(),
                family = ctx.family.unwrap_or(""),
                device = ctx.device.unwrap_or(""),
                slot = ctx.slot.unwrap_or(""),
                tick = ctx.tick.unwrap_or_default(),
                message = %message
            )
        };
    }
    // Levels must be constant at the callsite.
    match outcome {
        DeviceEventOutcome::Success => emit!(Level::INFO),
        DeviceEventOutcome::Degraded => emit!(Level::WARN),
        DeviceEventOutcome::Fault => emit!(Level::ERROR),
    }
}
