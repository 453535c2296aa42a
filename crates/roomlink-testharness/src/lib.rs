//! ---
//! rl_section: "06-simulation"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Simulated room controllers and bus fault injection."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Slave-side simulation of the roomlink bus.
//!
//! [`SimulatedRoom`] answers requests the way a room controller does, including log
//! storage and transfer reassembly. [`SimulatedBus`] routes the master's frames to rooms
//! and can inject NAKs, silence and corrupted replies.

pub mod bus;
pub mod room;

pub use bus::{Fault, SimulatedBus};
pub use room::{RoomReply, RoomSnapshot, SimulatedRoom, SYSTEM_INFO};
