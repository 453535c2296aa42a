//! ---
//! rl_section: "05-protocol-core"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Master orchestration of the room controller bus."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Records the master writes into its own log.

use roomlink_msg::{BcdDateTime, LogEvent};
use roomlink_transfer::TransferKind;
use serde::{Deserialize, Serialize};

/// Event codes reserved for master-generated records.
pub mod codes {
    pub const LOG_TRANSFER_FAILED: u8 = 0xE0;
    pub const TRANSFER_FAILED: u8 = 0xE1;
    pub const TRANSFER_FINISHED: u8 = 0xE2;
    pub const UNIT_UNREACHABLE: u8 = 0xE3;
    pub const SOS_REPORTED: u8 = 0xE4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum MasterEvent {
    LogTransferFailed { unit: u16 },
    TransferFailed { unit: u16, kind: TransferKind },
    TransferFinished { unit: u16, kind: TransferKind },
    UnitUnreachable { unit: u16 },
    SosReported { unit: u16 },
}

impl MasterEvent {
    pub fn event_code(&self) -> u8 {
        match self {
            MasterEvent::LogTransferFailed { .. } => codes::LOG_TRANSFER_FAILED,
            MasterEvent::TransferFailed { .. } => codes::TRANSFER_FAILED,
            MasterEvent::TransferFinished { .. } => codes::TRANSFER_FINISHED,
            MasterEvent::UnitUnreachable { .. } => codes::UNIT_UNREACHABLE,
            MasterEvent::SosReported { .. } => codes::SOS_REPORTED,
        }
    }

    /// Subtype byte: the transfer kind for transfer events, zero otherwise.
    pub fn event_type(&self) -> u8 {
        match self {
            MasterEvent::TransferFailed { kind, .. } | MasterEvent::TransferFinished { kind, .. } => {
                match kind {
                    TransferKind::Firmware => 1,
                    TransferKind::Bootloader => 2,
                    TransferKind::Asset { .. } => 3,
                }
            }
            _ => 0,
        }
    }

    /// Group byte: the asset slot for asset transfers, zero otherwise.
    pub fn group(&self) -> u8 {
        match self {
            MasterEvent::TransferFailed { kind, .. } | MasterEvent::TransferFinished { kind, .. } => {
                kind.slot()
            }
            _ => 0,
        }
    }

    pub fn unit(&self) -> u16 {
        match *self {
            MasterEvent::LogTransferFailed { unit }
            | MasterEvent::TransferFailed { unit, .. }
            | MasterEvent::TransferFinished { unit, .. }
            | MasterEvent::UnitUnreachable { unit }
            | MasterEvent::SosReported { unit } => unit,
        }
    }

    /// Name used for system event logging.
    pub fn label(&self) -> &'static str {
        match self {
            MasterEvent::LogTransferFailed { .. } => "log.transfer_failed",
            MasterEvent::TransferFailed { .. } => "transfer.failed",
            MasterEvent::TransferFinished { .. } => "transfer.finished",
            MasterEvent::UnitUnreachable { .. } => "unit.unreachable",
            MasterEvent::SosReported { .. } => "unit.sos",
        }
    }

    /// Log event stamped with `at`, originating from the unit concerned.
    pub fn to_log_event(&self, at: BcdDateTime) -> LogEvent {
        LogEvent {
            event_code: self.event_code(),
            event_type: self.event_type(),
            group: self.group(),
            originator: LogEvent::unit_originator(self.unit()),
            timestamp: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_events_carry_kind_and_slot() {
        let at = BcdDateTime::new(24, 5, 1, 12, 0, 0);
        let event = MasterEvent::TransferFinished {
            unit: 0x0203,
            kind: TransferKind::Asset { slot: 7 },
        }
        .to_log_event(at);
        assert_eq!(event.event_code, 0xE2);
        assert_eq!(event.event_type, 3);
        assert_eq!(event.group, 7);
        assert_eq!(event.originator, [0x02, 0x03, 0, 0, 0]);
        assert_eq!(event.timestamp, at);
    }

    #[test]
    fn codes_are_distinct() {
        let events = [
            MasterEvent::LogTransferFailed { unit: 1 },
            MasterEvent::TransferFailed { unit: 1, kind: TransferKind::Firmware },
            MasterEvent::TransferFinished { unit: 1, kind: TransferKind::Firmware },
            MasterEvent::UnitUnreachable { unit: 1 },
            MasterEvent::SosReported { unit: 1 },
        ];
        let mut codes: Vec<u8> = events.iter().map(MasterEvent::event_code).collect();
        codes.dedup();
        assert_eq!(codes, vec![0xE0, 0xE1, 0xE2, 0xE3, 0xE4]);
    }
}
