//! ---
//! rl_section: "05-protocol-core"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Master orchestration of the room controller bus."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Master-side protocol core: who to talk to next, what to send, and what to do with
//! the answer.

pub mod attempt;
pub mod command;
pub mod context;
pub mod enumerator;
pub mod events;
pub mod orchestrator;
pub mod reply;
pub mod scan;

use roomlink_msg::Opcode;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the protocol core to its callers.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("an exchange is in flight")]
    Busy,
    #[error("address table error: {0}")]
    Address(String),
    #[error("command rejected: {0}")]
    Command(#[from] CommandError),
    #[error("log error: {0}")]
    Log(#[from] roomlink_persistence::LogError),
    #[error("transfer error: {0}")]
    Transfer(#[from] roomlink_transfer::TransferError),
    #[error("bus error: {0}")]
    Messaging(#[from] roomlink_msg::MessagingError),
    #[error("frame error: {0}")]
    Frame(#[from] roomlink_msg::FrameError),
}

/// Parameter errors returned synchronously to a command submitter; nothing was sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("{0} cannot be submitted as an ad-hoc command")]
    NotAdHoc(Opcode),
    #[error("{opcode} takes {expected} characters, got {actual}")]
    WrongLength {
        opcode: Opcode,
        expected: usize,
        actual: usize,
    },
    #[error("{opcode} argument {arg:?} is not all {radix} digits")]
    NotDigits {
        opcode: Opcode,
        arg: String,
        radix: &'static str,
    },
    #[error("{opcode} value {value} outside {min}..={max}")]
    OutOfRange {
        opcode: Opcode,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("{0:?} is not a valid YYMMDDhhmmss clock value")]
    InvalidClock(String),
    #[error("{0} cannot be sent to a group or broadcast address")]
    NotBroadcastable(Opcode),
    #[error("address {0:#06x} is reserved")]
    ReservedAddress(u16),
    #[error("address {0:#06x} is already assigned to a unit")]
    AddressInUse(u16),
    #[error("a command is already queued")]
    Busy,
}

pub use attempt::{AttemptOutcome, ExchangeAttempt};
pub use command::{AdHocCommand, CommandOutcome, CommandResult, CommandSlot};
pub use context::{
    Calendar, CycleEnd, FixedCalendar, ProtocolContext, ProtocolSettings, StatusFlags, StatusReply,
    SystemCalendar, UnitStatus, UnitStatusTable,
};
pub use enumerator::{AddressEnumerator, AddressTable, Destination};
pub use events::MasterEvent;
pub use orchestrator::{ExchangePurpose, MasterController, ProtocolState};
pub use reply::{classify_reply, ReplyStatus};
pub use scan::{BusScan, ScanMode, ScanReport, ScanSettings, ScanState};
