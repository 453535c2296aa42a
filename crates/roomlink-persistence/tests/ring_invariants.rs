//! ---
//! rl_section: "03-log-storage"
//! rl_subsection: "tests"
//! rl_type: "test"
//! rl_scope: "code"
//! rl_description: "Randomised ring invariants and restart recovery."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::collections::HashSet;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use roomlink_msg::{BcdDateTime, LogEvent, RECORD_SIZE};
use roomlink_persistence::{
    FileEeprom, FragmentationKind, GatedStore, LogAllocator, LogError, MemoryEeprom, NvStore,
    RegionGeometry,
};

const SLOTS: usize = 10;

fn event(code: u8) -> LogEvent {
    LogEvent {
        event_code: code,
        event_type: 0,
        group: 1,
        originator: LogEvent::unit_originator(0x0102),
        timestamp: BcdDateTime::new(2025, 6, 1, 12, 0, 0),
    }
}

fn probes(bytes: &[u8], start: usize) -> Vec<u16> {
    (0..SLOTS)
        .map(|slot| {
            let at = start + slot * RECORD_SIZE;
            u16::from_be_bytes([bytes[at], bytes[at + 1]])
        })
        .collect()
}

fn assert_consistent(alloc: &LogAllocator<MemoryEeprom>, start: usize) {
    let span = alloc.span();
    let ids = probes(alloc.store().inner().bytes(), start);
    for (slot, id) in ids.iter().enumerate() {
        assert_eq!(
            *id != 0,
            span.contains(slot),
            "slot {slot} probe {id:#06x} disagrees with {span:?}"
        );
    }
    let region = alloc.region();
    assert_eq!(region.count, ids.iter().filter(|id| **id != 0).count());
    assert_eq!(region.layout, span.kind());
    assert_eq!(region.next_write_addr, start + span.write_slot() * RECORD_SIZE);
}

#[test]
fn random_operations_preserve_count_and_survive_restart() -> Result<()> {
    let start = 32;
    let geometry = RegionGeometry::new(start, SLOTS * RECORD_SIZE);
    let store = GatedStore::new(MemoryEeprom::new(256).with_write_latency(2), 8, 64);
    let mut alloc = LogAllocator::recover(store, geometry)?;
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut seen = HashSet::new();

    for step in 0..4000u32 {
        match rng.gen_range(0..100) {
            0..=59 => match alloc.append(event(step as u8)) {
                Ok(_) => {}
                Err(LogError::Full) => assert!(alloc.is_full()),
                Err(other) => return Err(other.into()),
            },
            60..=95 => {
                let n = rng.gen_range(1..=3);
                match alloc.delete_records(n) {
                    Ok(_) => {}
                    Err(LogError::Empty) => assert_eq!(alloc.count(), 0),
                    Err(other) => return Err(other.into()),
                }
            }
            _ => alloc.delete_all()?,
        }
        assert_consistent(&alloc, start);
        seen.insert(alloc.layout());

        if step % 97 == 0 {
            let image = alloc.store().inner().bytes().to_vec();
            let restarted =
                LogAllocator::recover(GatedStore::new(MemoryEeprom::from_bytes(image), 8, 64), geometry)?;
            assert_eq!(restarted.region(), alloc.region());
            if alloc.count() > 0 {
                assert_eq!(restarted.next_sequence(), alloc.next_sequence());
            }
        }
    }

    for kind in [
        FragmentationKind::Empty,
        FragmentationKind::ContiguousWrappedFull,
        FragmentationKind::ContiguousWrappedOpen,
        FragmentationKind::Full,
        FragmentationKind::ContiguousFromStartOpen,
        FragmentationKind::SplitByGap,
    ] {
        assert!(seen.contains(&kind), "layout {kind} never reached");
    }
    Ok(())
}

#[test]
fn recovery_reads_each_slot_exactly_once() -> Result<()> {
    let mut image = vec![0u8; SLOTS * RECORD_SIZE];
    for slot in 3..7 {
        image[slot * RECORD_SIZE + 1] = slot as u8;
    }
    let store = GatedStore::new(MemoryEeprom::from_bytes(image), 4, 0);
    let alloc = LogAllocator::recover(store, RegionGeometry::new(0, SLOTS * RECORD_SIZE))?;
    assert_eq!(alloc.store().inner().read_count(), SLOTS);
    assert_eq!(alloc.layout(), FragmentationKind::ContiguousWrappedOpen);
    assert_eq!(alloc.region().first_addr, 3 * RECORD_SIZE);
    assert_eq!(alloc.region().last_addr, 6 * RECORD_SIZE);
    assert_eq!(alloc.next_sequence(), 7);
    Ok(())
}

#[test]
fn file_backed_ring_resumes_after_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("master-log.img");
    let geometry = RegionGeometry::new(0, SLOTS * RECORD_SIZE);

    let written = {
        let store = GatedStore::new(FileEeprom::open(&path, 512)?, 4, 64);
        let mut alloc = LogAllocator::recover(store, geometry)?;
        for code in 0..12u8 {
            let _ = alloc.append(event(code));
        }
        alloc.delete_records(4)?;
        alloc.append(event(0xEE))?;
        alloc.region()
    };

    let mut reopened = LogAllocator::recover(GatedStore::new(FileEeprom::open(&path, 512)?, 4, 64), geometry)?;
    assert_eq!(reopened.region(), written);
    assert_eq!(reopened.layout(), FragmentationKind::SplitByGap);
    let codes: Vec<u8> = reopened
        .records()
        .map(|record| record.map(|r| r.event_code))
        .collect::<Result<_, _>>()?;
    assert_eq!(codes, vec![4, 5, 6, 7, 8, 9, 0xEE]);
    assert_eq!(reopened.store().inner().capacity(), 512);
    Ok(())
}
