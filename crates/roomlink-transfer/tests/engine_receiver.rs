//! ---
//! rl_section: "04-transfer"
//! rl_subsection: "tests"
//! rl_type: "test"
//! rl_scope: "code"
//! rl_description: "Sender engine against the slave receiver over encoded frames."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::io::Write;

use anyhow::Result;
use roomlink_msg::{decode, AddressPair, FrameKind, Opcode};
use roomlink_transfer::{
    ChunkVerdict, FileSource, MemorySink, TransferEngine, TransferKind, TransferProgress,
    TransferReceiver, TransferSettings, TransferState,
};

const MASTER: u16 = 0x0001;
const UNIT: u16 = 0x0107;

#[test]
fn file_image_streams_into_receiver_with_lost_acks() -> Result<()> {
    let image: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(&image)?;

    let settings = TransferSettings {
        chunk_size: 100,
        ..TransferSettings::default()
    };
    let kind = TransferKind::Asset { slot: 4 };
    let mut engine = TransferEngine::start(kind, UNIT, Box::new(FileSource::open(file.path())?), &settings)?;
    let mut receiver = TransferReceiver::new();
    let mut sink = MemorySink::default();
    let mut dropped_once = false;

    loop {
        let prepared = engine.prepare_chunk(MASTER)?;
        let frame = decode(&prepared.frame.to_bytes(), Some(AddressPair { dest: UNIT, src: MASTER }))?;
        let progress = match frame.kind {
            FrameKind::Command => {
                assert_eq!(frame.payload[0], Opcode::DownloadImage.code());
                receiver.accept_header(&frame.payload)?;
                engine.on_ack(None)
            }
            FrameKind::Data => {
                let verdict = receiver.accept_chunk(&frame.payload, &mut sink)?;
                let seq = match verdict {
                    ChunkVerdict::Accepted { seq, .. } | ChunkVerdict::Duplicate { seq } => seq,
                    ChunkVerdict::OutOfOrder { .. } => panic!("sender skipped a chunk"),
                };
                if seq == 5 && !dropped_once {
                    dropped_once = true;
                    engine.on_failure()
                } else {
                    engine.on_ack(Some(seq))
                }
            }
        };
        match progress {
            TransferProgress::Finished(report) => {
                assert_eq!(report.total_chunks, 10);
                assert_eq!(report.chunks_acked, 10);
                break;
            }
            TransferProgress::Failed(report) => panic!("transfer failed: {report:?}"),
            _ => {}
        }
    }

    assert_eq!(engine.state(), TransferState::Finished);
    assert!(!engine.is_active());
    assert_eq!(sink.images(), &[(kind, image)]);
    Ok(())
}
