//! ---
//! rl_section: "02-bus-protocol"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Wire codec, opcode table and bus transport primitives."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Opcode space and the command table describing each opcode's argument and reply shape.
//!
//! Wire values are fixed by deployed room units and must not be renumbered.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Single-byte operation selector carried in payload byte 0 of every request.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[repr(u8)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Opcode {
    /// Identify the unit; also used as the bus scan probe.
    GetSystemInfo = 0xA0,
    /// Set the unit clock (`YYMMDDhhmmss`).
    SetClock = 0xA1,
    /// Read the unit clock.
    GetClock = 0xA2,
    /// Read the unit's configured bus address.
    GetBusAddress = 0xA3,
    /// Provision a new bus address.
    SetBusAddress = 0xA4,
    /// Read digital inputs/outputs.
    GetDigitalIo = 0xA5,
    /// Drive digital outputs.
    SetDigitalIo = 0xA6,
    /// Read the room status code.
    GetRoomStatus = 0xA7,
    /// Set the room status code.
    SetRoomStatus = 0xA8,
    /// Read the room temperature setpoint.
    GetRoomTemperature = 0xA9,
    /// Set the room temperature setpoint (tenths of a degree).
    SetRoomTemperature = 0xAA,
    /// Clear a latched SOS alarm.
    ResetSosAlarm = 0xAB,
    /// Fetch a page of the unit's log records.
    GetLogList = 0xAC,
    /// Delete the unit's oldest log records.
    DeleteLogList = 0xAD,
    /// Start a display image download into an asset slot.
    DownloadImage = 0xAE,
    /// Start an application firmware download.
    DownloadFirmware = 0xAF,
    /// Reboot the unit into its bootloader.
    StartBootloader = 0xB0,
    /// Leave the bootloader and run the application.
    ExecuteApplication = 0xB1,
    /// Status poll: flags, room status and temperature.
    GetStatus = 0xB2,
    /// Start a bootloader image download.
    DownloadBootloader = 0xB3,
}

impl Opcode {
    /// Raw wire value.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Map a wire byte back onto an opcode.
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0xA0 => Opcode::GetSystemInfo,
            0xA1 => Opcode::SetClock,
            0xA2 => Opcode::GetClock,
            0xA3 => Opcode::GetBusAddress,
            0xA4 => Opcode::SetBusAddress,
            0xA5 => Opcode::GetDigitalIo,
            0xA6 => Opcode::SetDigitalIo,
            0xA7 => Opcode::GetRoomStatus,
            0xA8 => Opcode::SetRoomStatus,
            0xA9 => Opcode::GetRoomTemperature,
            0xAA => Opcode::SetRoomTemperature,
            0xAB => Opcode::ResetSosAlarm,
            0xAC => Opcode::GetLogList,
            0xAD => Opcode::DeleteLogList,
            0xAE => Opcode::DownloadImage,
            0xAF => Opcode::DownloadFirmware,
            0xB0 => Opcode::StartBootloader,
            0xB1 => Opcode::ExecuteApplication,
            0xB2 => Opcode::GetStatus,
            0xB3 => Opcode::DownloadBootloader,
            _ => return None,
        })
    }

    /// Command table entry for this opcode.
    pub const fn spec(self) -> CommandSpec {
        use ArgShape::*;
        use ReplyShape::{AckOnly, AckThenFrame};
        let (arg, reply, broadcastable) = match self {
            Opcode::GetSystemInfo => (Empty, AckThenFrame, false),
            Opcode::SetClock => (Digits(12), AckOnly, true),
            Opcode::GetClock => (Empty, AckThenFrame, false),
            Opcode::GetBusAddress => (Empty, AckThenFrame, false),
            Opcode::SetBusAddress => (Digits(5), AckOnly, false),
            Opcode::GetDigitalIo => (Empty, AckThenFrame, false),
            Opcode::SetDigitalIo => (HexDigits(2), AckOnly, true),
            Opcode::GetRoomStatus => (Empty, AckThenFrame, false),
            Opcode::SetRoomStatus => (Digits(2), AckOnly, true),
            Opcode::GetRoomTemperature => (Empty, AckThenFrame, false),
            Opcode::SetRoomTemperature => (Digits(3), AckOnly, true),
            Opcode::ResetSosAlarm => (Empty, AckOnly, true),
            Opcode::GetLogList => (Internal, AckThenFrame, false),
            Opcode::DeleteLogList => (Internal, AckOnly, false),
            Opcode::DownloadImage => (Transfer, AckOnly, false),
            Opcode::DownloadFirmware => (Transfer, AckOnly, false),
            Opcode::StartBootloader => (Empty, AckOnly, false),
            Opcode::ExecuteApplication => (Empty, AckOnly, false),
            Opcode::GetStatus => (Internal, AckThenFrame, false),
            Opcode::DownloadBootloader => (Transfer, AckOnly, false),
        };
        CommandSpec {
            opcode: self,
            arg,
            reply,
            broadcastable,
        }
    }

    /// True for the opcodes that open a chunked transfer session.
    pub const fn is_transfer(self) -> bool {
        matches!(self.spec().arg, ArgShape::Transfer)
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        value.code()
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Opcode::from_code(value).ok_or(value)
    }
}

/// Argument accepted after the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "shape", content = "len")]
pub enum ArgShape {
    /// No argument bytes.
    Empty,
    /// Exactly `n` decimal digits from the operator.
    Digits(u8),
    /// Exactly `n` hexadecimal digits from the operator.
    HexDigits(u8),
    /// Built by the orchestrator itself; not available as an ad-hoc command.
    Internal,
    /// Transfer header built by the transfer engine.
    Transfer,
}

/// What the master waits for after sending a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyShape {
    /// Nothing; used for group and broadcast sends.
    None,
    /// A single ACK or NAK byte.
    AckOnly,
    /// ACK followed by a data frame, or a NAK byte.
    AckThenFrame,
}

impl ReplyShape {
    /// Whether the exchange waits in `Pending` at all.
    pub const fn expects_reply(self) -> bool {
        !matches!(self, ReplyShape::None)
    }
}

/// Command table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Opcode this row describes.
    pub opcode: Opcode,
    /// Argument shape.
    pub arg: ArgShape,
    /// Reply shape for point-to-point sends.
    pub reply: ReplyShape,
    /// Whether the opcode may go to the group or broadcast address.
    pub broadcastable: bool,
}
