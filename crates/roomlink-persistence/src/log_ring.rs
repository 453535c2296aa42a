//! ---
//! rl_section: "03-log-storage"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Circular event log allocator over an EEPROM region."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use roomlink_msg::{LogEvent, LogRecord, RECORD_SIZE};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::layout::{self, FragmentationKind, RingError, RingOp, RingSpan};
use crate::metrics::LogMetrics;
use crate::store::{GatedStore, NvStore};
use crate::{LogError, Result};

/// Placement of the log ring on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionGeometry {
    /// First byte of the region.
    pub start: usize,
    /// Region length in bytes, a positive multiple of [`RECORD_SIZE`].
    pub size: usize,
}

impl RegionGeometry {
    /// Geometry starting at `start` spanning `size` bytes.
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    /// Number of record slots.
    pub const fn slots(&self) -> usize {
        self.size / RECORD_SIZE
    }

    /// Absolute address of a slot.
    pub const fn slot_addr(&self, slot: usize) -> usize {
        self.start + slot * RECORD_SIZE
    }

    /// Check the geometry against a device.
    pub fn validate(&self, capacity: usize) -> Result<()> {
        if self.size == 0 || self.size % RECORD_SIZE != 0 {
            return Err(LogError::Geometry(format!(
                "region size {} is not a positive multiple of {RECORD_SIZE}",
                self.size
            )));
        }
        if self.start + self.size > capacity {
            return Err(LogError::Geometry(format!(
                "region {:#06x}+{} exceeds device capacity {capacity}",
                self.start, self.size
            )));
        }
        Ok(())
    }
}

/// Address-level snapshot of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRegion {
    /// Address of the oldest record, or the region start when empty.
    pub first_addr: usize,
    /// Address of the newest record, or the region start when empty.
    pub last_addr: usize,
    /// Address the next append writes.
    pub next_write_addr: usize,
    /// Records held.
    pub count: usize,
    /// Current fragmentation layout.
    pub layout: FragmentationKind,
}

impl LogRegion {
    /// Derive every field from one span so they can never disagree.
    pub fn from_span(geometry: &RegionGeometry, span: &RingSpan) -> Self {
        let first_addr = geometry.slot_addr(span.first);
        Self {
            first_addr,
            last_addr: span
                .newest_slot()
                .map(|slot| geometry.slot_addr(slot))
                .unwrap_or(first_addr),
            next_write_addr: geometry.slot_addr(span.write_slot()),
            count: span.count,
            layout: span.kind(),
        }
    }
}

/// How startup recovery went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum Recovery {
    /// The probe scan produced a consistent layout.
    Scanned,
    /// The scan failed or found an impossible pattern; the ring restarted empty.
    Degraded(String),
}

/// Ring allocator for fixed-size log records.
#[derive(Debug)]
pub struct LogAllocator<S> {
    store: GatedStore<S>,
    geometry: RegionGeometry,
    span: RingSpan,
    region: LogRegion,
    next_sequence: u16,
    recovery: Recovery,
    recovery_elapsed: Duration,
    metrics: Option<LogMetrics>,
}

impl<S: NvStore> LogAllocator<S> {
    /// Rebuild the ring state from the device with one probe read per slot.
    ///
    /// Only a bad geometry is an error; unreadable or inconsistent contents degrade to an
    /// empty ring.
    pub fn recover(store: GatedStore<S>, geometry: RegionGeometry) -> Result<Self> {
        geometry.validate(store.capacity())?;
        let started = Instant::now();
        let mut allocator = Self {
            store,
            geometry,
            span: RingSpan::empty(geometry.slots()),
            region: LogRegion::from_span(&geometry, &RingSpan::empty(geometry.slots())),
            next_sequence: 1,
            recovery: Recovery::Scanned,
            recovery_elapsed: Duration::ZERO,
            metrics: None,
        };

        match allocator.scan() {
            Ok((span, ids)) => {
                allocator.next_sequence = span
                    .newest_slot()
                    .map(|slot| layout::next_sequence(ids[slot]))
                    .unwrap_or(1);
                allocator.set_span(span);
                info!(
                    layout = %allocator.region.layout,
                    count = allocator.region.count,
                    first_addr = allocator.region.first_addr,
                    next_write_addr = allocator.region.next_write_addr,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "log region recovered"
                );
            }
            Err(reason) => {
                warn!(%reason, "log region recovery failed, restarting empty");
                if let Err(err) = allocator
                    .store
                    .erase(geometry.start, geometry.size)
                {
                    warn!(error = %err, "could not clear log region after failed recovery");
                }
                allocator.recovery = Recovery::Degraded(reason);
            }
        }
        allocator.recovery_elapsed = started.elapsed();
        Ok(allocator)
    }

    fn scan(&mut self) -> std::result::Result<(RingSpan, Vec<u16>), String> {
        let mut ids = Vec::with_capacity(self.geometry.slots());
        let mut probe = [0u8; 2];
        for slot in 0..self.geometry.slots() {
            self.store
                .read(self.geometry.slot_addr(slot), &mut probe)
                .map_err(|err| format!("probe read of slot {slot} failed: {err}"))?;
            ids.push(u16::from_be_bytes(probe));
        }
        let span = layout::classify_scan(&ids)
            .ok_or_else(|| "written slots do not form a single run".to_string())?;
        Ok((span, ids))
    }

    /// Attach metrics and publish the recovered state.
    pub fn with_metrics(mut self, metrics: LogMetrics) -> Self {
        metrics.set_records(self.span.count);
        metrics.observe_recovery(self.recovery_elapsed.as_secs_f64());
        self.metrics = Some(metrics);
        self
    }

    fn set_span(&mut self, span: RingSpan) {
        self.span = span;
        self.region = LogRegion::from_span(&self.geometry, &span);
        if let Some(metrics) = &self.metrics {
            metrics.set_records(span.count);
        }
    }

    /// Address-level snapshot.
    pub fn region(&self) -> LogRegion {
        self.region
    }

    /// Slot-level occupancy.
    pub fn span(&self) -> RingSpan {
        self.span
    }

    /// Current layout.
    pub fn layout(&self) -> FragmentationKind {
        self.region.layout
    }

    /// Records held.
    pub fn count(&self) -> usize {
        self.span.count
    }

    /// Whether the next append would be refused.
    pub fn is_full(&self) -> bool {
        self.span.free() == 0
    }

    /// Free record slots.
    pub fn free_slots(&self) -> usize {
        self.span.free()
    }

    /// Region placement.
    pub fn geometry(&self) -> RegionGeometry {
        self.geometry
    }

    /// Outcome of startup recovery.
    pub fn recovery(&self) -> &Recovery {
        &self.recovery
    }

    /// Sequence id the next append will carry.
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence
    }

    /// Borrow the underlying store.
    pub fn store(&self) -> &GatedStore<S> {
        &self.store
    }

    /// Mutable access to the underlying store.
    pub fn store_mut(&mut self) -> &mut GatedStore<S> {
        &mut self.store
    }

    /// Release the underlying store.
    pub fn into_store(self) -> GatedStore<S> {
        self.store
    }

    /// Append one event. A full ring refuses the write and nothing changes.
    pub fn append(&mut self, event: LogEvent) -> Result<LogRecord> {
        let next = match layout::transition(self.span, RingOp::Append) {
            Ok(next) => next,
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_rejected();
                }
                debug!(count = self.span.count, "append refused, log region full");
                return Err(err.into());
            }
        };
        let record = event.into_record(self.next_sequence);
        let addr = self.geometry.slot_addr(self.span.write_slot());
        self.store.write(addr, &record.to_bytes())?;
        self.next_sequence = layout::next_sequence(self.next_sequence);
        self.set_span(next);
        if let Some(metrics) = &self.metrics {
            metrics.record_append();
        }
        debug!(
            sequence = record.sequence,
            addr,
            layout = %self.region.layout,
            count = self.region.count,
            "log record appended"
        );
        Ok(record)
    }

    /// Remove the oldest record.
    pub fn delete_oldest(&mut self) -> Result<()> {
        self.delete_records(1).map(|_| ())
    }

    /// Remove the oldest whole records covered by `byte_count`, never past the newest one.
    /// Returns the number of records removed.
    pub fn delete_range(&mut self, byte_count: usize) -> Result<usize> {
        if self.span.count == 0 {
            return Err(LogError::Empty);
        }
        let wanted = (byte_count / RECORD_SIZE).min(self.span.count);
        if wanted == 0 {
            return Ok(0);
        }
        self.delete_records(wanted)
    }

    /// Remove up to `n` oldest records by invalidating their probes.
    pub fn delete_records(&mut self, n: usize) -> Result<usize> {
        if self.span.count == 0 {
            return Err(LogError::Empty);
        }
        let n = n.min(self.span.count);
        let mut removed = 0;
        let mut failure = None;
        for index in 0..n {
            let Some(slot) = self.span.slot_at(index) else {
                break;
            };
            if let Err(err) = self.store.write(self.geometry.slot_addr(slot), &[0, 0]) {
                failure = Some(err);
                break;
            }
            removed += 1;
        }
        if removed > 0 {
            let next = layout::transition(self.span, RingOp::DeleteOldest(removed))?;
            self.set_span(next);
        }
        debug!(
            removed,
            layout = %self.region.layout,
            count = self.region.count,
            "log records deleted"
        );
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(removed),
        }
    }

    /// Erase the whole region in one cycle and reset to empty.
    pub fn delete_all(&mut self) -> Result<()> {
        self.store.erase(self.geometry.start, self.geometry.size)?;
        let next = layout::transition(self.span, RingOp::DeleteAll)?;
        self.set_span(next);
        info!("log region cleared");
        Ok(())
    }

    fn read_slot(&mut self, slot: usize) -> Result<LogRecord> {
        let mut buf = [0u8; RECORD_SIZE];
        self.store.read(self.geometry.slot_addr(slot), &mut buf)?;
        Ok(LogRecord::from_bytes(&buf)?)
    }

    /// Record `index` positions after the oldest.
    pub fn read_at(&mut self, index: usize) -> Result<Option<LogRecord>> {
        match self.span.slot_at(index) {
            Some(slot) => self.read_slot(slot).map(Some),
            None => Ok(None),
        }
    }

    /// Record carrying sequence id `id`.
    pub fn read_by_id(&mut self, id: u16) -> Result<Option<LogRecord>> {
        if id == 0 {
            return Ok(None);
        }
        for index in 0..self.span.count {
            if let Some(record) = self.read_at(index)? {
                if record.sequence == id {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// Up to `max` records starting `start_index` positions after the oldest.
    pub fn read_page(&mut self, start_index: usize, max: usize) -> Result<Vec<LogRecord>> {
        let end = start_index.saturating_add(max).min(self.span.count);
        let mut page = Vec::with_capacity(end.saturating_sub(start_index));
        for index in start_index..end {
            if let Some(record) = self.read_at(index)? {
                page.push(record);
            }
        }
        Ok(page)
    }

    /// Iterate all records, oldest first.
    pub fn records(&mut self) -> Records<'_, S> {
        Records {
            allocator: self,
            index: 0,
        }
    }
}

/// Oldest-first iterator over the ring.
#[derive(Debug)]
pub struct Records<'a, S> {
    allocator: &'a mut LogAllocator<S>,
    index: usize,
}

impl<S: NvStore> Iterator for Records<'_, S> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.allocator.read_at(self.index).transpose()?;
        self.index += 1;
        Some(item)
    }
}

impl From<RingError> for LogError {
    fn from(value: RingError) -> Self {
        match value {
            RingError::Full => LogError::Full,
            RingError::Empty => LogError::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEeprom;
    use roomlink_msg::BcdDateTime;

    fn event(code: u8) -> LogEvent {
        LogEvent {
            event_code: code,
            event_type: 1,
            group: 2,
            originator: [1, 2, 3, 4, 5],
            timestamp: BcdDateTime::new(2024, 1, 2, 3, 4, 5),
        }
    }

    fn allocator(bytes: Vec<u8>) -> LogAllocator<MemoryEeprom> {
        let size = bytes.len();
        let store = GatedStore::new(MemoryEeprom::from_bytes(bytes), 4, 64);
        LogAllocator::recover(store, RegionGeometry::new(0, size)).unwrap()
    }

    #[test]
    fn single_stale_record_recovers_as_open_from_start() {
        let mut image = vec![0u8; 160];
        image[..16].fill(0x11);
        let alloc = allocator(image);
        let region = alloc.region();
        assert_eq!(region.layout, FragmentationKind::ContiguousFromStartOpen);
        assert_eq!(region.count, 1);
        assert_eq!(region.next_write_addr, 16);
        assert_eq!(region.first_addr, 0);
        assert_eq!(alloc.next_sequence(), 0x1112);
    }

    #[test]
    fn append_into_full_region_leaves_state_unchanged() {
        let mut alloc = allocator(vec![0xFF; 160]);
        assert_eq!(alloc.layout(), FragmentationKind::Full);
        let before = alloc.region();
        assert!(matches!(alloc.append(event(1)), Err(LogError::Full)));
        assert_eq!(alloc.region(), before);
    }

    #[test]
    fn appended_records_read_back_in_order() {
        let mut alloc = allocator(vec![0; 160]);
        for code in 0..7 {
            alloc.append(event(code)).unwrap();
        }
        let records: Vec<LogRecord> = alloc.records().collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 7);
        assert!(records.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert_eq!(records[3].event_code, 3);
        assert_eq!(alloc.read_by_id(records[5].sequence).unwrap(), Some(records[5]));
        assert_eq!(alloc.read_page(5, 10).unwrap().len(), 2);
    }

    #[test]
    fn full_delete_append_keeps_order() {
        let mut alloc = allocator(vec![0; 160]);
        while !alloc.is_full() {
            alloc.append(event(0)).unwrap();
        }
        alloc.delete_oldest().unwrap();
        assert_eq!(alloc.layout(), FragmentationKind::ContiguousWrappedFull);
        let record = alloc.append(event(9)).unwrap();
        let region = alloc.region();
        assert_eq!(region.layout, FragmentationKind::Full);
        assert_eq!(region.first_addr, 16);
        assert_eq!(region.last_addr, 0);
        assert_eq!(alloc.read_at(9).unwrap(), Some(record));
    }

    #[test]
    fn delete_range_clamps_to_newest() {
        let mut alloc = allocator(vec![0; 160]);
        for code in 0..3 {
            alloc.append(event(code)).unwrap();
        }
        assert_eq!(alloc.delete_range(15).unwrap(), 0);
        assert_eq!(alloc.delete_range(64 * 10).unwrap(), 3);
        assert_eq!(alloc.layout(), FragmentationKind::Empty);
        assert!(matches!(alloc.delete_range(16), Err(LogError::Empty)));
    }

    #[test]
    fn delete_all_is_one_erase_cycle() {
        let mut alloc = allocator(vec![0; 160]);
        for code in 0..5 {
            alloc.append(event(code)).unwrap();
        }
        let cycles = alloc.store().inner().write_cycles();
        alloc.delete_all().unwrap();
        assert_eq!(alloc.store().inner().write_cycles(), cycles + 1);
        assert_eq!(alloc.count(), 0);
        assert!(alloc.store().inner().bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn broken_pattern_degrades_to_empty() {
        let mut image = vec![0u8; 64];
        image[0] = 1;
        image[32] = 1;
        let alloc = allocator(image);
        assert_eq!(alloc.layout(), FragmentationKind::Empty);
        assert!(matches!(alloc.recovery(), Recovery::Degraded(_)));
        assert!(alloc.store().inner().bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn stuck_device_degrades_to_empty() {
        let mut dev = MemoryEeprom::new(64);
        dev.set_stuck(true);
        let alloc =
            LogAllocator::recover(GatedStore::new(dev, 3, 0), RegionGeometry::new(0, 64)).unwrap();
        assert_eq!(alloc.layout(), FragmentationKind::Empty);
        assert!(matches!(alloc.recovery(), Recovery::Degraded(_)));
    }

    #[test]
    fn bad_geometry_is_rejected() {
        let store = GatedStore::new(MemoryEeprom::new(64), 1, 0);
        assert!(matches!(
            LogAllocator::recover(store, RegionGeometry::new(0, 40)),
            Err(LogError::Geometry(_))
        ));
    }
}
