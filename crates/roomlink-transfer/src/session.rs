//! ---
//! rl_section: "04-transfer"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Chunked transfer sessions, sender engine and slave-side receiver."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use roomlink_msg::{Opcode, MAX_PAYLOAD};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{Result, TransferError};

/// Largest chunk that fits a data frame next to its 2-byte sequence number.
pub const MAX_CHUNK_SIZE: usize = MAX_PAYLOAD - 2;

/// Chunks needed for `total_bytes`, rounded up.
pub const fn chunk_count(total_bytes: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    (total_bytes + chunk_size - 1) / chunk_size
}

/// What is being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TransferKind {
    /// Application firmware; the unit reboots into its bootloader first.
    Firmware,
    /// Bootloader image, written by the running application.
    Bootloader,
    /// Display bitmap for one asset slot.
    Asset {
        /// Target slot selector.
        slot: u8,
    },
}

impl TransferKind {
    /// Opcode carried by the header frame.
    pub const fn opcode(self) -> Opcode {
        match self {
            TransferKind::Firmware => Opcode::DownloadFirmware,
            TransferKind::Bootloader => Opcode::DownloadBootloader,
            TransferKind::Asset { .. } => Opcode::DownloadImage,
        }
    }

    /// Slot byte carried by the header frame.
    pub const fn slot(self) -> u8 {
        match self {
            TransferKind::Asset { slot } => slot,
            _ => 0,
        }
    }

    /// Rebuild from a header's opcode and slot.
    pub const fn from_header(opcode: Opcode, slot: u8) -> Option<Self> {
        match opcode {
            Opcode::DownloadFirmware => Some(TransferKind::Firmware),
            Opcode::DownloadBootloader => Some(TransferKind::Bootloader),
            Opcode::DownloadImage => Some(TransferKind::Asset { slot }),
            _ => None,
        }
    }

    /// Whether the unit must be moved into its bootloader before data flows.
    pub const fn arms_bootloader(self) -> bool {
        matches!(self, TransferKind::Firmware)
    }

    /// Firmware and bootloader sessions outrank the log cycle; assets do not.
    pub const fn is_system_image(self) -> bool {
        matches!(self, TransferKind::Firmware | TransferKind::Bootloader)
    }

    /// Metric and log label.
    pub const fn label(self) -> &'static str {
        match self {
            TransferKind::Firmware => "firmware",
            TransferKind::Bootloader => "bootloader",
            TransferKind::Asset { .. } => "asset",
        }
    }
}

/// Transfer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransferState {
    /// No session.
    Idle,
    /// Header frame outstanding.
    Init,
    /// Waiting for the unit to come up in its bootloader.
    BootloaderArm,
    /// Streaming data chunks.
    Running,
    /// Every chunk acknowledged.
    Finished,
    /// Attempt budget exhausted.
    Failed,
}

/// Tunables for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Data bytes per chunk.
    pub chunk_size: usize,
    /// Attempts per chunk before the session fails.
    pub attempt_ceiling: u32,
    /// Report that flash write protection should be re-armed after a bootloader update.
    pub rearm_write_protect: bool,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: 64,
            attempt_ceiling: 10,
            rearm_write_protect: false,
        }
    }
}

impl TransferSettings {
    /// Reject chunk sizes a data frame cannot carry.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::InvalidChunkSize(self.chunk_size));
        }
        Ok(())
    }
}

/// One outstanding chunked transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSession {
    /// What is delivered.
    pub kind: TransferKind,
    /// Destination unit.
    pub unit: u16,
    /// Source size in bytes.
    pub total_bytes: usize,
    /// Bytes per chunk.
    pub chunk_size: usize,
    /// Data chunks in the session.
    pub total_chunks: u16,
    /// Sequence number of the chunk in flight.
    pub next_chunk_to_send: u16,
    /// Chunks acknowledged so far.
    pub chunks_acked: u16,
    /// Attempts left for the frame in flight.
    pub attempts_remaining: u32,
    /// Attempts granted to each new frame.
    pub attempt_ceiling: u32,
    /// Offset of the chunk in flight within the source.
    pub source_cursor: usize,
    /// Lifecycle state.
    pub state: TransferState,
}

impl TransferSession {
    /// Open a session in `Init`.
    pub fn new(
        kind: TransferKind,
        unit: u16,
        total_bytes: usize,
        settings: &TransferSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let chunks = chunk_count(total_bytes, settings.chunk_size);
        let total_chunks = u16::try_from(chunks).map_err(|_| TransferError::TooLarge {
            bytes: total_bytes,
            chunks,
        })?;
        Ok(Self {
            kind,
            unit,
            total_bytes,
            chunk_size: settings.chunk_size,
            total_chunks,
            next_chunk_to_send: 0,
            chunks_acked: 0,
            attempts_remaining: settings.attempt_ceiling.max(1),
            attempt_ceiling: settings.attempt_ceiling.max(1),
            source_cursor: 0,
            state: TransferState::Init,
        })
    }

    /// Length of the chunk at the cursor.
    pub fn current_chunk_len(&self) -> usize {
        self.chunk_size
            .min(self.total_bytes.saturating_sub(self.source_cursor))
    }

    /// Whether every chunk has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.next_chunk_to_send >= self.total_chunks
    }

    /// Header payload `[opcode, slot, chunks_hi, chunks_lo, total_bytes (4)]`.
    pub fn header_payload(&self) -> Vec<u8> {
        let mut payload = vec![self.kind.opcode().code(), self.kind.slot()];
        payload.extend_from_slice(&self.total_chunks.to_be_bytes());
        payload.extend_from_slice(&(self.total_bytes as u32).to_be_bytes());
        payload
    }

    /// Grant a fresh attempt budget.
    pub fn reset_attempts(&mut self) {
        self.attempts_remaining = self.attempt_ceiling;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_rounds_up_exactly_once() {
        for k in 1..=64 {
            assert_eq!(chunk_count(64 * k, 64), k);
            assert_eq!(chunk_count(64 * k + 1, 64), k + 1);
        }
        assert_eq!(chunk_count(0, 64), 0);
        assert_eq!(chunk_count(1, 64), 1);
        assert_eq!(chunk_count(10, 0), 0);
    }

    #[test]
    fn header_payload_layout() {
        let session = TransferSession::new(
            TransferKind::Asset { slot: 3 },
            0x0010,
            1000,
            &TransferSettings::default(),
        )
        .unwrap();
        assert_eq!(session.total_chunks, 16);
        assert_eq!(
            session.header_payload(),
            vec![0xAE, 3, 0x00, 0x10, 0x00, 0x00, 0x03, 0xE8]
        );
        assert_eq!(session.state, TransferState::Init);
    }

    #[test]
    fn oversize_source_is_rejected() {
        let settings = TransferSettings {
            chunk_size: 1,
            ..TransferSettings::default()
        };
        assert!(matches!(
            TransferSession::new(TransferKind::Firmware, 1, 70_000, &settings),
            Err(TransferError::TooLarge { chunks: 70_000, .. })
        ));
    }

    #[test]
    fn invalid_chunk_size_is_rejected() {
        let settings = TransferSettings {
            chunk_size: MAX_CHUNK_SIZE + 1,
            ..TransferSettings::default()
        };
        assert!(matches!(
            TransferSession::new(TransferKind::Bootloader, 1, 10, &settings),
            Err(TransferError::InvalidChunkSize(249))
        ));
    }

    #[test]
    fn kinds_round_trip_through_header() {
        for kind in [
            TransferKind::Firmware,
            TransferKind::Bootloader,
            TransferKind::Asset { slot: 9 },
        ] {
            assert_eq!(TransferKind::from_header(kind.opcode(), kind.slot()), Some(kind));
        }
        assert_eq!(TransferKind::from_header(Opcode::GetStatus, 0), None);
    }
}
