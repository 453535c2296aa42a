//! ---
//! rl_section: "04-transfer"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Chunked transfer sessions, sender engine and slave-side receiver."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Slave side of a chunked transfer.
//!
//! Chunks must arrive in order. A repeat of the last accepted chunk means the master lost
//! our ACK; it is acknowledged again without touching the image.

use roomlink_msg::Opcode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session::{chunk_count, TransferKind};
use crate::{Result, TransferError};

/// Where completed images go.
pub trait AssetSink: Send {
    /// Persist a completed image.
    fn store(&mut self, kind: TransferKind, image: &[u8]) -> Result<()>;
}

/// Sink that keeps every completed image in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    images: Vec<(TransferKind, Vec<u8>)>,
}

impl MemorySink {
    /// Completed images in arrival order.
    pub fn images(&self) -> &[(TransferKind, Vec<u8>)] {
        &self.images
    }
}

impl AssetSink for MemorySink {
    fn store(&mut self, kind: TransferKind, image: &[u8]) -> Result<()> {
        self.images.push((kind, image.to_vec()));
        Ok(())
    }
}

/// Parsed transfer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderInfo {
    /// What is being delivered.
    pub kind: TransferKind,
    /// Chunks announced.
    pub total_chunks: u16,
    /// Bytes announced.
    pub total_bytes: u32,
}

impl HeaderInfo {
    /// Parse `[opcode, slot, chunks_hi, chunks_lo, total_bytes (4)]`.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() != 8 {
            return Err(TransferError::MalformedHeader(format!(
                "expected 8 bytes, got {}",
                payload.len()
            )));
        }
        let opcode = Opcode::from_code(payload[0]).ok_or_else(|| {
            TransferError::MalformedHeader(format!("unknown opcode {:#04x}", payload[0]))
        })?;
        let kind = TransferKind::from_header(opcode, payload[1]).ok_or_else(|| {
            TransferError::MalformedHeader(format!("{opcode} does not open a transfer"))
        })?;
        let total_chunks = u16::from_be_bytes([payload[2], payload[3]]);
        let total_bytes = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        if total_chunks == 0 || total_bytes == 0 {
            return Err(TransferError::MalformedHeader("empty transfer".into()));
        }
        Ok(Self {
            kind,
            total_chunks,
            total_bytes,
        })
    }

    /// Chunk size implied by the header, rounded up.
    pub fn chunk_size(&self) -> usize {
        let chunks = usize::from(self.total_chunks);
        (self.total_bytes as usize).div_ceil(chunks)
    }
}

/// What the slave answers to a data chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkVerdict {
    /// Stored; ACK echoing `seq`. `complete` is set when this was the last chunk.
    Accepted {
        /// Sequence number to echo.
        seq: u16,
        /// Whether the image is now complete and handed to the sink.
        complete: bool,
    },
    /// Repeat of the previous chunk; ACK again without storing.
    Duplicate {
        /// Sequence number to echo.
        seq: u16,
    },
    /// Gap or rewind; NAK.
    OutOfOrder {
        /// Sequence expected next.
        expected: u16,
        /// Sequence received.
        got: u16,
    },
}

#[derive(Debug, Clone)]
struct Incoming {
    header: HeaderInfo,
    next_seq: u16,
    image: Vec<u8>,
}

/// Reassembles one incoming transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferReceiver {
    incoming: Option<Incoming>,
    last_completed: Option<(TransferKind, u16)>,
}

impl TransferReceiver {
    /// Idle receiver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a transfer is being assembled.
    pub fn in_progress(&self) -> Option<HeaderInfo> {
        self.incoming.as_ref().map(|incoming| incoming.header)
    }

    /// Start (or restart) a transfer from its header payload.
    pub fn accept_header(&mut self, payload: &[u8]) -> Result<HeaderInfo> {
        let header = HeaderInfo::parse(payload)?;
        let expected = chunk_count(header.total_bytes as usize, header.chunk_size());
        if expected != usize::from(header.total_chunks) {
            return Err(TransferError::MalformedHeader(format!(
                "{} bytes cannot span {} chunks",
                header.total_bytes, header.total_chunks
            )));
        }
        debug!(kind = header.kind.label(), chunks = header.total_chunks, "transfer header accepted");
        self.incoming = Some(Incoming {
            header,
            next_seq: 0,
            image: Vec::with_capacity(header.total_bytes as usize),
        });
        self.last_completed = None;
        Ok(header)
    }

    /// Feed one data frame payload `[seq_hi, seq_lo, data...]`.
    pub fn accept_chunk(&mut self, payload: &[u8], sink: &mut dyn AssetSink) -> Result<ChunkVerdict> {
        if payload.len() < 3 {
            return Err(TransferError::MalformedChunk(payload.len()));
        }
        let seq = u16::from_be_bytes([payload[0], payload[1]]);

        let Some(incoming) = self.incoming.as_mut() else {
            return match self.last_completed {
                Some((_, last)) if last == seq => Ok(ChunkVerdict::Duplicate { seq }),
                _ => Err(TransferError::NoSession),
            };
        };

        if incoming.next_seq > 0 && seq == incoming.next_seq - 1 {
            return Ok(ChunkVerdict::Duplicate { seq });
        }
        if seq != incoming.next_seq {
            return Ok(ChunkVerdict::OutOfOrder {
                expected: incoming.next_seq,
                got: seq,
            });
        }

        let remaining = incoming.header.total_bytes as usize - incoming.image.len();
        let data = &payload[2..];
        if data.len() > remaining {
            return Err(TransferError::MalformedChunk(payload.len()));
        }
        incoming.image.extend_from_slice(data);
        incoming.next_seq += 1;

        if incoming.next_seq < incoming.header.total_chunks {
            return Ok(ChunkVerdict::Accepted {
                seq,
                complete: false,
            });
        }
        if incoming.image.len() != incoming.header.total_bytes as usize {
            return Err(TransferError::MalformedChunk(payload.len()));
        }

        let kind = incoming.header.kind;
        let image = std::mem::take(&mut incoming.image);
        self.incoming = None;
        self.last_completed = Some((kind, seq));
        sink.store(kind, &image)?;
        debug!(kind = kind.label(), bytes = image.len(), "transfer image complete");
        Ok(ChunkVerdict::Accepted {
            seq,
            complete: true,
        })
    }

    /// Drop any partial transfer.
    pub fn reset(&mut self) {
        self.incoming = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(kind: TransferKind, chunks: u16, bytes: u32) -> Vec<u8> {
        let mut payload = vec![kind.opcode().code(), kind.slot()];
        payload.extend_from_slice(&chunks.to_be_bytes());
        payload.extend_from_slice(&bytes.to_be_bytes());
        payload
    }

    fn chunk(seq: u16, data: &[u8]) -> Vec<u8> {
        let mut payload = seq.to_be_bytes().to_vec();
        payload.extend_from_slice(data);
        payload
    }

    #[test]
    fn assembles_in_order_and_reacks_duplicates() {
        let mut rx = TransferReceiver::new();
        let mut sink = MemorySink::default();
        let kind = TransferKind::Asset { slot: 2 };
        rx.accept_header(&header(kind, 3, 10)).unwrap();

        assert_eq!(
            rx.accept_chunk(&chunk(0, &[1, 2, 3, 4]), &mut sink).unwrap(),
            ChunkVerdict::Accepted {
                seq: 0,
                complete: false
            }
        );
        assert_eq!(
            rx.accept_chunk(&chunk(0, &[1, 2, 3, 4]), &mut sink).unwrap(),
            ChunkVerdict::Duplicate { seq: 0 }
        );
        assert_eq!(
            rx.accept_chunk(&chunk(2, &[9, 9]), &mut sink).unwrap(),
            ChunkVerdict::OutOfOrder {
                expected: 1,
                got: 2
            }
        );
        rx.accept_chunk(&chunk(1, &[5, 6, 7, 8]), &mut sink).unwrap();
        assert_eq!(
            rx.accept_chunk(&chunk(2, &[9, 10]), &mut sink).unwrap(),
            ChunkVerdict::Accepted {
                seq: 2,
                complete: true
            }
        );
        assert_eq!(
            rx.accept_chunk(&chunk(2, &[9, 10]), &mut sink).unwrap(),
            ChunkVerdict::Duplicate { seq: 2 }
        );
        assert_eq!(sink.images(), &[(kind, (1..=10).collect::<Vec<u8>>())]);
        assert!(rx.in_progress().is_none());
    }

    #[test]
    fn rejects_inconsistent_header() {
        let mut rx = TransferReceiver::new();
        assert!(rx.accept_header(&header(TransferKind::Firmware, 5, 10)).is_ok());
        assert!(matches!(
            rx.accept_header(&header(TransferKind::Firmware, 0, 10)),
            Err(TransferError::MalformedHeader(_))
        ));
        let mut bogus = header(TransferKind::Firmware, 1, 1);
        bogus[0] = Opcode::GetClock.code();
        assert!(rx.accept_header(&bogus).is_err());
    }

    #[test]
    fn chunk_without_session_is_an_error() {
        let mut rx = TransferReceiver::new();
        let mut sink = MemorySink::default();
        assert!(matches!(
            rx.accept_chunk(&chunk(0, &[1]), &mut sink),
            Err(TransferError::NoSession)
        ));
    }
}
