//! ---
//! rl_section: "05-protocol-core"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Master orchestration of the room controller bus."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Operator commands queued for the poll loop.
//!
//! Arguments arrive as digit strings and are checked against the opcode's command-table
//! row before anything is queued, so a bad argument never reaches the bus.

use roomlink_msg::{ArgShape, BcdDateTime, Opcode, ReplyShape};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::enumerator::Destination;
use crate::CommandError;

const TEMPERATURE_RANGE: (u32, u32) = (50, 350);
const BUS_ADDRESS_RANGE: (u32, u32) = (1, 65533);

/// A validated command ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdHocCommand {
    pub opcode: Opcode,
    pub destination: Destination,
    /// Argument bytes following the opcode on the wire.
    pub args: Vec<u8>,
}

impl AdHocCommand {
    /// Validate `args` for `opcode` and encode them.
    pub fn parse(opcode: Opcode, destination: Destination, args: &str) -> Result<Self, CommandError> {
        let spec = opcode.spec();
        if !destination.is_point_to_point() && !spec.broadcastable {
            return Err(CommandError::NotBroadcastable(opcode));
        }
        let args = args.trim();
        let encoded = match spec.arg {
            ArgShape::Internal | ArgShape::Transfer => return Err(CommandError::NotAdHoc(opcode)),
            ArgShape::Empty => {
                expect_len(opcode, args, 0)?;
                Vec::new()
            }
            ArgShape::Digits(n) => {
                expect_len(opcode, args, usize::from(n))?;
                if !args.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(CommandError::NotDigits {
                        opcode,
                        arg: args.to_owned(),
                        radix: "decimal",
                    });
                }
                encode_decimal(opcode, args)?
            }
            ArgShape::HexDigits(n) => {
                expect_len(opcode, args, usize::from(n))?;
                hex::decode(args).map_err(|_| CommandError::NotDigits {
                    opcode,
                    arg: args.to_owned(),
                    radix: "hexadecimal",
                })?
            }
        };
        Ok(Self {
            opcode,
            destination,
            args: encoded,
        })
    }

    /// Opcode byte followed by the arguments.
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(1 + self.args.len());
        payload.push(self.opcode.code());
        payload.extend_from_slice(&self.args);
        payload
    }

    /// Reply grammar; group and broadcast sends get none.
    pub fn reply(&self) -> ReplyShape {
        if self.destination.is_point_to_point() {
            self.opcode.spec().reply
        } else {
            ReplyShape::None
        }
    }

    /// New address carried by a `SetBusAddress` command.
    pub fn new_bus_address(&self) -> Option<u16> {
        match (self.opcode, self.args.as_slice()) {
            (Opcode::SetBusAddress, [hi, lo]) => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }
}

fn expect_len(opcode: Opcode, args: &str, expected: usize) -> Result<(), CommandError> {
    if args.len() != expected {
        return Err(CommandError::WrongLength {
            opcode,
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

fn ranged(opcode: Opcode, value: u32, (min, max): (u32, u32)) -> Result<u32, CommandError> {
    if value < min || value > max {
        return Err(CommandError::OutOfRange {
            opcode,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

fn encode_decimal(opcode: Opcode, digits: &str) -> Result<Vec<u8>, CommandError> {
    let value = || {
        digits.parse::<u32>().map_err(|_| CommandError::NotDigits {
            opcode,
            arg: digits.to_owned(),
            radix: "decimal",
        })
    };
    match opcode {
        Opcode::SetClock => BcdDateTime::from_digits(digits)
            .map(|stamp| stamp.0.to_vec())
            .ok_or_else(|| CommandError::InvalidClock(digits.to_owned())),
        Opcode::SetBusAddress => {
            let addr = ranged(opcode, value()?, BUS_ADDRESS_RANGE)? as u16;
            Ok(addr.to_be_bytes().to_vec())
        }
        Opcode::SetRoomTemperature => {
            let tenths = ranged(opcode, value()?, TEMPERATURE_RANGE)? as u16;
            Ok(tenths.to_be_bytes().to_vec())
        }
        _ => Ok(vec![value()? as u8]),
    }
}

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "data")]
pub enum CommandOutcome {
    /// Group or broadcast send; nobody answers.
    Sent,
    /// Plain ACK.
    Acked,
    /// ACK with a data frame payload.
    Reply(Vec<u8>),
    /// Attempt budget exhausted.
    Failed,
}

/// Result published in the slot once the poll loop is done with a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: AdHocCommand,
    pub outcome: CommandOutcome,
    /// Transmissions used.
    pub attempts: u32,
}

#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    Idle,
    Queued(AdHocCommand),
    InFlight(AdHocCommand),
    Done(CommandResult),
}

/// The single ad-hoc command slot between an operator and the poll loop.
#[derive(Debug, Clone, Default)]
pub struct CommandSlot {
    slot: Slot,
}

impl CommandSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and queue a command. Fails synchronously on bad arguments or while another
    /// command is queued or in flight. An unread result is discarded.
    pub fn submit(
        &mut self,
        opcode: Opcode,
        destination: Destination,
        args: &str,
    ) -> Result<(), CommandError> {
        let command = AdHocCommand::parse(opcode, destination, args)?;
        self.submit_parsed(command)
    }

    /// Queue an already validated command.
    pub fn submit_parsed(&mut self, command: AdHocCommand) -> Result<(), CommandError> {
        if self.is_busy() {
            return Err(CommandError::Busy);
        }
        debug!(opcode = %command.opcode, destination = ?command.destination, "ad-hoc command queued");
        self.slot = Slot::Queued(command);
        Ok(())
    }

    /// Queued or in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self.slot, Slot::Queued(_) | Slot::InFlight(_))
    }

    /// Queued and not yet picked up.
    pub fn has_queued(&self) -> bool {
        matches!(self.slot, Slot::Queued(_))
    }

    /// Hand the queued command to the poll loop; the slot stays busy until [`Self::complete`].
    pub fn dispatch(&mut self) -> Option<AdHocCommand> {
        match std::mem::take(&mut self.slot) {
            Slot::Queued(command) => {
                self.slot = Slot::InFlight(command.clone());
                Some(command)
            }
            other => {
                self.slot = other;
                None
            }
        }
    }

    /// Publish the outcome of the in-flight command.
    pub fn complete(&mut self, outcome: CommandOutcome, attempts: u32) -> Option<&CommandResult> {
        let command = match std::mem::take(&mut self.slot) {
            Slot::InFlight(command) => command,
            other => {
                self.slot = other;
                return None;
            }
        };
        self.slot = Slot::Done(CommandResult {
            command,
            outcome,
            attempts,
        });
        match &self.slot {
            Slot::Done(result) => Some(result),
            _ => None,
        }
    }

    /// Collect a finished result, freeing the slot.
    pub fn take_result(&mut self) -> Option<CommandResult> {
        match std::mem::take(&mut self.slot) {
            Slot::Done(result) => Some(result),
            other => {
                self.slot = other;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: Destination = Destination::Unit(0x0102);

    #[test]
    fn digit_arguments_encode() {
        let clock = AdHocCommand::parse(Opcode::SetClock, Destination::Broadcast, "240229235959").unwrap();
        assert_eq!(clock.args, vec![0x24, 0x02, 0x29, 0x23, 0x59, 0x59]);
        assert_eq!(clock.reply(), ReplyShape::None);

        let addr = AdHocCommand::parse(Opcode::SetBusAddress, UNIT, "00513").unwrap();
        assert_eq!(addr.args, vec![0x02, 0x01]);
        assert_eq!(addr.new_bus_address(), Some(513));

        let io = AdHocCommand::parse(Opcode::SetDigitalIo, UNIT, "a5").unwrap();
        assert_eq!(io.payload(), vec![Opcode::SetDigitalIo.code(), 0xA5]);

        let temp = AdHocCommand::parse(Opcode::SetRoomTemperature, UNIT, "215").unwrap();
        assert_eq!(temp.args, vec![0x00, 215]);

        let status = AdHocCommand::parse(Opcode::GetRoomStatus, UNIT, "").unwrap();
        assert_eq!(status.reply(), ReplyShape::AckThenFrame);
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert_eq!(
            AdHocCommand::parse(Opcode::SetBusAddress, UNIT, "1234"),
            Err(CommandError::WrongLength {
                opcode: Opcode::SetBusAddress,
                expected: 5,
                actual: 4
            })
        );
        assert!(matches!(
            AdHocCommand::parse(Opcode::SetBusAddress, UNIT, "65534"),
            Err(CommandError::OutOfRange { value: 65534, .. })
        ));
        assert!(matches!(
            AdHocCommand::parse(Opcode::SetBusAddress, UNIT, "00000"),
            Err(CommandError::OutOfRange { value: 0, .. })
        ));
        assert!(matches!(
            AdHocCommand::parse(Opcode::SetRoomTemperature, UNIT, "351"),
            Err(CommandError::OutOfRange { .. })
        ));
        assert!(matches!(
            AdHocCommand::parse(Opcode::SetRoomStatus, UNIT, "1x"),
            Err(CommandError::NotDigits { .. })
        ));
        assert!(matches!(
            AdHocCommand::parse(Opcode::SetDigitalIo, UNIT, "zz"),
            Err(CommandError::NotDigits { .. })
        ));
        assert_eq!(
            AdHocCommand::parse(Opcode::SetClock, UNIT, "241301000000"),
            Err(CommandError::InvalidClock("241301000000".into()))
        );
        assert_eq!(
            AdHocCommand::parse(Opcode::DownloadImage, UNIT, ""),
            Err(CommandError::NotAdHoc(Opcode::DownloadImage))
        );
        assert_eq!(
            AdHocCommand::parse(Opcode::GetClock, Destination::Group, ""),
            Err(CommandError::NotBroadcastable(Opcode::GetClock))
        );
    }

    #[test]
    fn slot_lifecycle() {
        let mut slot = CommandSlot::new();
        slot.submit(Opcode::ResetSosAlarm, UNIT, "").unwrap();
        assert_eq!(
            slot.submit(Opcode::ResetSosAlarm, UNIT, ""),
            Err(CommandError::Busy)
        );
        let command = slot.dispatch().unwrap();
        assert_eq!(command.opcode, Opcode::ResetSosAlarm);
        assert!(slot.dispatch().is_none());
        assert!(slot.is_busy());
        assert!(slot.take_result().is_none());

        slot.complete(CommandOutcome::Acked, 2).unwrap();
        assert!(!slot.is_busy());
        let result = slot.take_result().unwrap();
        assert_eq!(result.outcome, CommandOutcome::Acked);
        assert_eq!(result.attempts, 2);
        assert!(slot.take_result().is_none());
    }
}
