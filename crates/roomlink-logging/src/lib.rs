//! ---
//! rl_section: "01-core-functionality"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Bus-aware structured logging helpers."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Logging helpers that tag events with the unit and exchange they concern.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber for tools and tests.
///
/// Output goes to stderr so command output on stdout stays machine-readable.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Bus context carried by the convenience macros.
#[derive(Debug, Default, Clone, Copy)]
pub struct BusContext<'a> {
    /// Unit address the event concerns.
    pub unit: Option<u16>,
    /// Exchange purpose (status poll, log pull, transfer, ...).
    pub purpose: Option<&'a str>,
    /// Controller tick counter.
    pub tick: Option<u64>,
}

impl<'a> BusContext<'a> {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a unit address.
    pub fn with_unit(mut self, unit: u16) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Attach an exchange purpose.
    pub fn with_purpose(mut self, purpose: &'a str) -> Self {
        self.purpose = Some(purpose);
        self
    }

    /// Attach a tick value.
    pub fn with_tick(mut self, tick: u64) -> Self {
        self.tick = Some(tick);
        self
    }

    /// Unit rendered for log fields; empty when unset.
    pub fn unit_field(&self) -> String {
        self.unit.map(|unit| format!("{unit:#06x}")).unwrap_or_default()
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation failed or was aborted.
    Fault,
}

impl SystemEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SystemEventOutcome::Success => "success",
            SystemEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized system event with a success/fault outcome.
pub fn log_system_event(
    context: Option<&BusContext>,
    event: &str,
    message: &str,
    outcome: SystemEventOutcome,
) {
    let ctx = context.copied().unwrap_or_default();
    let unit = ctx.unit_field();
    match outcome {
        SystemEventOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            unit = %unit,
            purpose = ctx.purpose.unwrap_or(""),
            tick = ctx.tick.unwrap_or_default(),
            message = %message
        ),
        SystemEventOutcome::Fault => tracing::error!(
            event,
            outcome = outcome.as_str(),
            unit = %unit,
            purpose = ctx.purpose.unwrap_or(""),
            tick = ctx.tick.unwrap_or_default(),
            message = %message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = BusContext::new().with_unit(0x0101).with_purpose("status-poll");
        rl_info!(context = ctx, "unit online");
        rl_debug!("debug message");
        rl_warn!(context = ctx.with_tick(7), "retrying, {} attempts left", 3);
        rl_error!(context = ctx, "error code: {}", 42);
    }

    #[test]
    fn unit_field_is_hex() {
        assert_eq!(BusContext::new().with_unit(0x0107).unit_field(), "0x0107");
        assert_eq!(BusContext::new().unit_field(), "");
    }

    #[test]
    fn system_event_helper_emits() {
        init();
        let ctx = BusContext::new().with_unit(0x0201);
        log_system_event(
            Some(&ctx),
            "transfer.finished",
            "firmware delivered",
            SystemEventOutcome::Success,
        );
        log_system_event(None, "bus.open", "serial port missing", SystemEventOutcome::Fault);
    }
}
