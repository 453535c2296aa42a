//! ---
//! rl_section: "01-core-functionality"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Bus-aware structured logging helpers."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
#[doc(hidden)]
#[macro_export]
macro_rules! __rl_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx: &$crate::BusContext = &$ctx;
        tracing::event!(
            $level,
            unit = %ctx.unit_field(),
            purpose = ctx.purpose.unwrap_or(""),
            tick = ctx.tick.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with bus context.
#[macro_export]
macro_rules! rl_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__rl_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__rl_event!(tracing::Level::INFO, $crate::BusContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with bus context.
#[macro_export]
macro_rules! rl_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__rl_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__rl_event!(tracing::Level::DEBUG, $crate::BusContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with bus context.
#[macro_export]
macro_rules! rl_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__rl_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__rl_event!(tracing::Level::WARN, $crate::BusContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with bus context.
#[macro_export]
macro_rules! rl_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__rl_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__rl_event!(tracing::Level::ERROR, $crate::BusContext::default(), $($arg)+)
    };
}
