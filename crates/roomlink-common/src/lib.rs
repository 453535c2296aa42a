//! ---
//! rl_section: "01-core-functionality"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Shared primitives and utilities for the bus controller."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Shared primitives for the roomlink workspace.
//! This crate exposes configuration loading, tracing setup and the calendar
//! helpers consumed by the daemon, the CLI and the protocol core.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    parse_address, AddressingConfig, AppConfig, BusConfig, LoadedAppConfig, LogRegionConfig, LoggingConfig,
    MetricsConfig, ProtocolConfig, TransferConfig,
};
pub use logging::{init_tracing, LogFormat};
