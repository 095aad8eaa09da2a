//! ---
//! hm_section: "03-logging"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Structured logging adapters."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
#[doc(hidden)]
#[macro_export]
macro_rules! __hm_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = $ctx;
        $crate::tracing::event!(
            $level,
            family = ctx.family.unwrap_or(""),
            device = ctx.device.unwrap_or(""),
            slot = ctx.slot.unwrap_or(""),
            tick = ctx.tick.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with device context.
#[macro_export]
macro_rules! hm_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__hm_event!($crate::tracing::Level::INFO, &$ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__hm_event!($crate::tracing::Level::INFO, &$crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with device context.
#[macro_export]
macro_rules! hm_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__hm_event!($crate::tracing::Level::DEBUG, &$ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__hm_event!($crate::tracing::Level::DEBUG, &$crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with device context.
#[macro_export]
macro_rules! hm_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__hm_event!($crate::tracing::Level::WARN, &$ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__hm_event!($crate::tracing::Level::WARN, &$crate::LogContext::default(), $($arg)+)
    };
}
