//! ---
//! rl_section: "01-core-functionality"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Runtime helpers supporting the bus poll loop."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Timing helpers for the roomlink master.

pub mod scheduling;
pub mod timer;

pub use scheduling::RateLimiter;
pub use timer::{Clock, Countdown, ManualClock, MonotonicClock};
