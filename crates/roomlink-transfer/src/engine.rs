//! ---
//! rl_section: "04-transfer"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Chunked transfer sessions, sender engine and slave-side receiver."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Sender side of a chunked transfer.
//!
//! The engine never touches the bus. The orchestrator asks it for the next frame, sends
//! it, and reports back either an acknowledgement (with the echoed sequence number for
//! data chunks) or a failure. A failed frame is resent unchanged until the attempt
//! budget runs out.

use roomlink_msg::{encode, Frame, FrameKind, Opcode, ReplyShape};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::session::{TransferKind, TransferSession, TransferSettings, TransferState};
use crate::source::AssetSource;
use crate::{Result, TransferError};

/// Frame ready to transmit plus what the reply must look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedFrame {
    /// Encoded request.
    pub frame: Frame,
    /// Reply grammar expected.
    pub reply: ReplyShape,
    /// Sequence number the reply must echo, for data chunks.
    pub echo: Option<u16>,
    /// The unit is rebooting into its bootloader; allow the settle time.
    pub arms_bootloader: bool,
}

/// Summary published when a session ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    /// What was delivered.
    pub kind: TransferKind,
    /// Destination unit.
    pub unit: u16,
    /// Source label.
    pub source: String,
    /// Chunks in the session.
    pub total_chunks: u16,
    /// Chunks acknowledged.
    pub chunks_acked: u16,
    /// Follow-up request the unit still needs, if any.
    pub follow_up: Option<Opcode>,
    /// Site policy: re-arm flash write protection after a bootloader update.
    pub rearm_write_protect: bool,
}

/// Result of feeding an acknowledgement or failure into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferProgress {
    /// Moved on to the next frame.
    Advanced,
    /// Same frame goes again.
    Retry {
        /// Attempts left for it.
        remaining: u32,
    },
    /// Last chunk acknowledged.
    Finished(TransferReport),
    /// Nothing left to send; drop the engine.
    Released,
    /// Attempt budget exhausted; the session is dead.
    Failed(TransferReport),
}

/// Drives one [`TransferSession`] against an [`AssetSource`].
pub struct TransferEngine {
    session: TransferSession,
    source: Box<dyn AssetSource>,
    label: String,
    follow_up_pending: bool,
    rearm_write_protect: bool,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("session", &self.session)
            .field("source", &self.label)
            .field("follow_up_pending", &self.follow_up_pending)
            .finish()
    }
}

impl TransferEngine {
    /// Open a session for `source` towards `unit`.
    pub fn start(
        kind: TransferKind,
        unit: u16,
        source: Box<dyn AssetSource>,
        settings: &TransferSettings,
    ) -> Result<Self> {
        let label = source.label();
        let total_bytes = source.total_size();
        if total_bytes == 0 {
            return Err(TransferError::EmptySource(label));
        }
        let session = TransferSession::new(kind, unit, total_bytes, settings)?;
        info!(
            unit,
            kind = kind.label(),
            source = %label,
            total_bytes,
            total_chunks = session.total_chunks,
            "transfer session opened"
        );
        Ok(Self {
            session,
            source,
            label,
            follow_up_pending: false,
            rearm_write_protect: settings.rearm_write_protect,
        })
    }

    /// Session state.
    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    /// Lifecycle state.
    pub fn state(&self) -> TransferState {
        self.session.state
    }

    /// What is being delivered.
    pub fn kind(&self) -> TransferKind {
        self.session.kind
    }

    /// Destination unit.
    pub fn unit(&self) -> u16 {
        self.session.unit
    }

    /// Whether another frame remains to be sent.
    pub fn is_active(&self) -> bool {
        match self.session.state {
            TransferState::Init | TransferState::BootloaderArm | TransferState::Running => true,
            TransferState::Finished => self.follow_up_pending,
            TransferState::Idle | TransferState::Failed => false,
        }
    }

    fn report(&self) -> TransferReport {
        TransferReport {
            kind: self.session.kind,
            unit: self.session.unit,
            source: self.label.clone(),
            total_chunks: self.session.total_chunks,
            chunks_acked: self.session.chunks_acked,
            follow_up: self
                .follow_up_pending
                .then_some(Opcode::ExecuteApplication),
            rearm_write_protect: self.rearm_write_protect
                && matches!(self.session.kind, TransferKind::Bootloader),
        }
    }

    fn command(&self, master: u16, payload: Vec<u8>) -> Result<Frame> {
        Ok(encode(FrameKind::Command, self.session.unit, master, payload)?)
    }

    /// Build the frame for the current position. Calling it again without feedback
    /// rebuilds the same frame from the same cursor.
    pub fn prepare_chunk(&mut self, master: u16) -> Result<PreparedFrame> {
        match self.session.state {
            TransferState::Init => Ok(PreparedFrame {
                frame: self.command(master, self.session.header_payload())?,
                reply: ReplyShape::AckOnly,
                echo: None,
                arms_bootloader: false,
            }),
            TransferState::BootloaderArm => Ok(PreparedFrame {
                frame: self.command(master, vec![Opcode::StartBootloader.code()])?,
                reply: ReplyShape::AckOnly,
                echo: None,
                arms_bootloader: true,
            }),
            TransferState::Running => {
                let seq = self.session.next_chunk_to_send;
                let len = self.session.current_chunk_len();
                let mut payload = vec![0u8; 2 + len];
                payload[..2].copy_from_slice(&seq.to_be_bytes());
                self.source
                    .read_at(self.session.source_cursor, &mut payload[2..])?;
                let frame = encode(FrameKind::Data, self.session.unit, master, payload)?;
                Ok(PreparedFrame {
                    frame,
                    reply: ReplyShape::AckThenFrame,
                    echo: Some(seq),
                    arms_bootloader: false,
                })
            }
            TransferState::Finished if self.follow_up_pending => Ok(PreparedFrame {
                frame: self.command(master, vec![Opcode::ExecuteApplication.code()])?,
                reply: ReplyShape::AckOnly,
                echo: None,
                arms_bootloader: false,
            }),
            state => Err(TransferError::NotActive(state)),
        }
    }

    /// Positive reply for the frame in flight. `echoed` is the sequence number carried by a
    /// data chunk reply; a mismatch counts as a failed attempt.
    pub fn on_ack(&mut self, echoed: Option<u16>) -> TransferProgress {
        match self.session.state {
            TransferState::Init => {
                self.session.reset_attempts();
                self.session.state = if self.session.kind.arms_bootloader() {
                    TransferState::BootloaderArm
                } else {
                    TransferState::Running
                };
                debug!(unit = self.session.unit, state = %self.session.state, "transfer header accepted");
                TransferProgress::Advanced
            }
            TransferState::BootloaderArm => {
                self.session.reset_attempts();
                self.session.state = TransferState::Running;
                debug!(unit = self.session.unit, "unit running bootloader");
                TransferProgress::Advanced
            }
            TransferState::Running => {
                let expected = self.session.next_chunk_to_send;
                if echoed != Some(expected) {
                    debug!(unit = self.session.unit, expected, ?echoed, "chunk echo mismatch");
                    return self.on_failure();
                }
                self.session.source_cursor += self.session.current_chunk_len();
                self.session.next_chunk_to_send += 1;
                self.session.chunks_acked += 1;
                self.session.reset_attempts();
                if self.session.is_complete() {
                    self.session.state = TransferState::Finished;
                    self.follow_up_pending = self.session.kind.arms_bootloader();
                    let report = self.report();
                    info!(
                        unit = report.unit,
                        kind = report.kind.label(),
                        chunks = report.total_chunks,
                        "transfer finished"
                    );
                    TransferProgress::Finished(report)
                } else {
                    TransferProgress::Advanced
                }
            }
            TransferState::Finished if self.follow_up_pending => {
                self.follow_up_pending = false;
                info!(unit = self.session.unit, "unit restarted into application");
                TransferProgress::Released
            }
            _ => TransferProgress::Released,
        }
    }

    /// NAK, timeout or any invalid reply for the frame in flight.
    pub fn on_failure(&mut self) -> TransferProgress {
        if !self.is_active() {
            return TransferProgress::Released;
        }
        self.session.attempts_remaining = self.session.attempts_remaining.saturating_sub(1);
        let remaining = self.session.attempts_remaining;
        if remaining > 0 {
            debug!(
                unit = self.session.unit,
                chunk = self.session.next_chunk_to_send,
                remaining,
                "transfer frame will be resent"
            );
            return TransferProgress::Retry { remaining };
        }

        if self.session.state == TransferState::Finished {
            // The image landed but the unit is still in its bootloader.
            let report = self.report();
            self.follow_up_pending = false;
            warn!(
                unit = report.unit,
                kind = report.kind.label(),
                "unit never confirmed restart into application"
            );
            return TransferProgress::Failed(report);
        }

        let failed_in = self.session.state;
        self.session.state = TransferState::Failed;
        let report = self.report();
        warn!(
            unit = report.unit,
            kind = report.kind.label(),
            state = %failed_in,
            chunk = self.session.next_chunk_to_send,
            acked = report.chunks_acked,
            "transfer failed, attempts exhausted"
        );
        TransferProgress::Failed(report)
    }

    /// Abandon the session.
    pub fn cancel(&mut self) -> TransferReport {
        self.follow_up_pending = false;
        if self.session.state != TransferState::Finished {
            self.session.state = TransferState::Failed;
        }
        self.report()
    }
}
