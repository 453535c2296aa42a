//! ---
//! rl_section: "03-log-storage"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Fragmentation classification and pure ring transitions."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Ring occupancy model.
//!
//! The occupied records always form one circular run of slots starting at `first`.
//! The six fragmentation kinds are a classification of that run against the physical
//! region bounds, and every operation is a pure `(span, op) -> span` transition.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

/// Occupied/free layout of the log region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FragmentationKind {
    /// No records.
    Empty,
    /// Occupied run ends exactly at the physical end; free space is at the start.
    ContiguousWrappedFull,
    /// Occupied run sits above the start with free space on both sides.
    ContiguousWrappedOpen,
    /// Every slot holds a record.
    Full,
    /// Occupied run starts at slot 0 and is followed by free space.
    ContiguousFromStartOpen,
    /// Occupied run wraps past the physical end, leaving a gap in the middle.
    SplitByGap,
}

/// Operation applied to a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingOp {
    /// Write one record at the write slot.
    Append,
    /// Drop the `n` oldest records; clamped to the current count.
    DeleteOldest(usize),
    /// Drop everything.
    DeleteAll,
}

/// Why a transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// Append into a full ring.
    #[error("log region full")]
    Full,
    /// Delete from an empty ring.
    #[error("log region empty")]
    Empty,
}

/// Circular run of occupied slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSpan {
    /// Slot of the oldest record; zero whenever the ring is empty.
    pub first: usize,
    /// Number of occupied slots.
    pub count: usize,
    /// Total slots in the region.
    pub slots: usize,
}

impl RingSpan {
    /// Empty ring of `slots` slots.
    pub const fn empty(slots: usize) -> Self {
        Self {
            first: 0,
            count: 0,
            slots,
        }
    }

    /// Classify against the region bounds.
    pub fn kind(&self) -> FragmentationKind {
        if self.count == 0 {
            FragmentationKind::Empty
        } else if self.count >= self.slots {
            FragmentationKind::Full
        } else if self.first == 0 {
            FragmentationKind::ContiguousFromStartOpen
        } else if self.first + self.count == self.slots {
            FragmentationKind::ContiguousWrappedFull
        } else if self.first + self.count < self.slots {
            FragmentationKind::ContiguousWrappedOpen
        } else {
            FragmentationKind::SplitByGap
        }
    }

    /// Slot the next append writes.
    pub fn write_slot(&self) -> usize {
        if self.slots == 0 {
            return 0;
        }
        (self.first + self.count) % self.slots
    }

    /// Slot of the newest record.
    pub fn newest_slot(&self) -> Option<usize> {
        (self.count > 0).then(|| (self.first + self.count - 1) % self.slots)
    }

    /// Slot holding the record `index` positions after the oldest.
    pub fn slot_at(&self, index: usize) -> Option<usize> {
        (index < self.count).then(|| (self.first + index) % self.slots)
    }

    /// Whether `slot` is inside the occupied run.
    pub fn contains(&self, slot: usize) -> bool {
        if slot >= self.slots || self.count == 0 {
            return false;
        }
        (slot + self.slots - self.first) % self.slots < self.count
    }

    /// Free slots left.
    pub fn free(&self) -> usize {
        self.slots.saturating_sub(self.count)
    }
}

/// Apply one operation. Refused operations leave the caller's span untouched.
pub fn transition(span: RingSpan, op: RingOp) -> Result<RingSpan, RingError> {
    match op {
        RingOp::Append => {
            if span.count >= span.slots {
                return Err(RingError::Full);
            }
            Ok(RingSpan {
                count: span.count + 1,
                ..span
            })
        }
        RingOp::DeleteOldest(n) => {
            if span.count == 0 {
                return Err(RingError::Empty);
            }
            let n = n.min(span.count);
            let count = span.count - n;
            let first = if count == 0 {
                0
            } else {
                (span.first + n) % span.slots
            };
            Ok(RingSpan { first, count, ..span })
        }
        RingOp::DeleteAll => Ok(RingSpan::empty(span.slots)),
    }
}

/// Sequence id that follows `id`; zero is skipped.
pub const fn next_sequence(id: u16) -> u16 {
    if id == u16::MAX {
        1
    } else {
        id + 1
    }
}

/// Reconstruct the span from the per-slot probes read at startup.
///
/// `ids[i]` is the 2-byte probe of slot `i`, zero meaning unwritten. Returns `None`
/// when the written slots do not form a single circular run.
pub fn classify_scan(ids: &[u16]) -> Option<RingSpan> {
    let slots = ids.len();
    let written = ids.iter().filter(|id| **id != 0).count();
    if written == 0 {
        return Some(RingSpan::empty(slots));
    }
    if written == slots {
        let first = (0..slots)
            .find(|&i| ids[i] != next_sequence(ids[(i + slots - 1) % slots]))
            .unwrap_or(0);
        return Some(RingSpan {
            first,
            count: slots,
            slots,
        });
    }

    let mut rising = (0..slots).filter(|&i| ids[i] != 0 && ids[(i + slots - 1) % slots] == 0);
    let first = rising.next()?;
    if rising.next().is_some() {
        return None;
    }
    Some(RingSpan {
        first,
        count: written,
        slots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(first: usize, count: usize) -> RingSpan {
        RingSpan {
            first,
            count,
            slots: 10,
        }
    }

    #[test]
    fn classifies_all_six_layouts() {
        assert_eq!(span(0, 0).kind(), FragmentationKind::Empty);
        assert_eq!(span(0, 4).kind(), FragmentationKind::ContiguousFromStartOpen);
        assert_eq!(span(3, 4).kind(), FragmentationKind::ContiguousWrappedOpen);
        assert_eq!(span(6, 4).kind(), FragmentationKind::ContiguousWrappedFull);
        assert_eq!(span(8, 4).kind(), FragmentationKind::SplitByGap);
        assert_eq!(span(5, 10).kind(), FragmentationKind::Full);
    }

    #[test]
    fn append_walks_into_full_then_refuses() {
        let mut current = span(6, 3);
        current = transition(current, RingOp::Append).unwrap();
        assert_eq!(current.kind(), FragmentationKind::ContiguousWrappedFull);
        assert_eq!(current.write_slot(), 0);
        while current.free() > 0 {
            current = transition(current, RingOp::Append).unwrap();
        }
        assert_eq!(current.kind(), FragmentationKind::Full);
        assert_eq!(transition(current, RingOp::Append), Err(RingError::Full));
    }

    #[test]
    fn deleting_last_record_resets_to_start() {
        let after = transition(span(7, 2), RingOp::DeleteOldest(5)).unwrap();
        assert_eq!(after, span(0, 0));
        assert_eq!(
            transition(after, RingOp::DeleteOldest(1)),
            Err(RingError::Empty)
        );
    }

    #[test]
    fn delete_opens_gap_in_full_ring() {
        let after = transition(span(0, 10), RingOp::DeleteOldest(1)).unwrap();
        assert_eq!(after.kind(), FragmentationKind::ContiguousWrappedFull);
        let after = transition(span(4, 10), RingOp::DeleteOldest(1)).unwrap();
        assert_eq!(after.kind(), FragmentationKind::SplitByGap);
    }

    #[test]
    fn slot_helpers_follow_the_wrap() {
        let s = span(8, 4);
        assert_eq!(s.newest_slot(), Some(1));
        assert_eq!(s.slot_at(2), Some(0));
        assert_eq!(s.slot_at(4), None);
        assert!(s.contains(9) && s.contains(1));
        assert!(!s.contains(2) && !s.contains(7));
    }

    #[test]
    fn scan_recognises_runs() {
        assert_eq!(classify_scan(&[0; 4]), Some(RingSpan::empty(4)));
        assert_eq!(
            classify_scan(&[5, 6, 0, 0]),
            Some(RingSpan {
                first: 0,
                count: 2,
                slots: 4
            })
        );
        assert_eq!(
            classify_scan(&[9, 0, 0, 8]),
            Some(RingSpan {
                first: 3,
                count: 2,
                slots: 4
            })
        );
        assert_eq!(classify_scan(&[1, 0, 3, 0]), None);
    }

    #[test]
    fn scan_of_full_ring_finds_sequence_break() {
        assert_eq!(classify_scan(&[21, 22, 19, 20]).map(|s| s.first), Some(2));
        assert_eq!(classify_scan(&[1, 2, 3, 4]).map(|s| s.first), Some(0));
        assert_eq!(
            classify_scan(&[u16::MAX, 1, 2, 65533, 65534]).map(|s| s.first),
            Some(3)
        );
    }
}
