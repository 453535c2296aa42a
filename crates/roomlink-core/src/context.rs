//! ---
//! rl_section: "05-protocol-core"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Master orchestration of the room controller bus."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! All mutable master state, owned in one place and lent to the components.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use roomlink_common::AppConfig;
use roomlink_logging::{log_system_event, BusContext, SystemEventOutcome};
use roomlink_msg::BcdDateTime;
use roomlink_persistence::{GatedStore, LogAllocator, LogError, NvStore, RegionGeometry};
use roomlink_transfer::{AssetSource, TransferEngine, TransferKind, TransferReport, TransferSettings};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::command::CommandSlot;
use crate::enumerator::{AddressEnumerator, AddressTable};
use crate::events::MasterEvent;
use crate::scan::ScanSettings;
use crate::Result;

/// Protocol tunables resolved from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSettings {
    pub master: u16,
    pub response_timeout: Duration,
    pub byte_timeout: Duration,
    pub inter_frame_delay: Duration,
    pub bootloader_settle: Duration,
    pub attempt_ceiling: u32,
    /// Successful log query rounds before a delete round.
    pub log_cadence: u32,
    pub time_broadcast_interval: Duration,
    pub log_page_records: u8,
    pub scan_attempts: u32,
    pub transfer: TransferSettings,
}

impl ProtocolSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            master: config.bus.master_address,
            response_timeout: config.bus.response_timeout,
            byte_timeout: config.bus.byte_timeout,
            inter_frame_delay: config.bus.inter_frame_delay,
            bootloader_settle: config.bus.bootloader_settle,
            attempt_ceiling: config.protocol.attempt_ceiling,
            log_cadence: config.protocol.log_cadence,
            time_broadcast_interval: config.protocol.time_broadcast_interval,
            log_page_records: config.protocol.log_page_records,
            scan_attempts: 2,
            transfer: TransferSettings {
                chunk_size: config.transfer.chunk_size,
                attempt_ceiling: config.transfer.attempt_ceiling,
                rearm_write_protect: config.transfer.rearm_write_protect,
            },
        }
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            master: self.master,
            response_timeout: self.response_timeout,
            byte_timeout: self.byte_timeout,
            attempts_per_address: self.scan_attempts,
        }
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Sticky master status bits for a management client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusFlags(u8);

impl StatusFlags {
    /// The master log refused an append; drain it.
    pub const LOG_FULL: Self = Self(0x01);
    /// The last transfer session failed.
    pub const LAST_TRANSFER_FAILED: Self = Self(0x02);
    /// A log pull from a unit was abandoned.
    pub const LOG_TRANSFER_FAILED: Self = Self(0x04);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl fmt::Display for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::LOG_FULL, "log_full"),
            (Self::LAST_TRANSFER_FAILED, "last_transfer_failed"),
            (Self::LOG_TRANSFER_FAILED, "log_transfer_failed"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Decoded status poll reply `[flags, room_status, temp_hi, temp_lo]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub has_logs: bool,
    pub sos: bool,
    pub room_status: u8,
    /// Tenths of a degree Celsius.
    pub temperature: i16,
}

impl StatusReply {
    pub const HAS_LOGS: u8 = 0x01;
    pub const SOS: u8 = 0x02;

    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            [flags, room_status, hi, lo] => Some(Self {
                has_logs: flags & Self::HAS_LOGS != 0,
                sos: flags & Self::SOS != 0,
                room_status: *room_status,
                temperature: i16::from_be_bytes([*hi, *lo]),
            }),
            _ => None,
        }
    }

    pub fn to_payload(&self) -> [u8; 4] {
        let mut flags = 0;
        if self.has_logs {
            flags |= Self::HAS_LOGS;
        }
        if self.sos {
            flags |= Self::SOS;
        }
        let [hi, lo] = self.temperature.to_be_bytes();
        [flags, self.room_status, hi, lo]
    }
}

/// Last known state of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub last: Option<StatusReply>,
    pub consecutive_failures: u32,
    pub reachable: bool,
    pub last_seen_ms: Option<u64>,
}

impl Default for UnitStatus {
    fn default() -> Self {
        Self {
            last: None,
            consecutive_failures: 0,
            reachable: true,
            last_seen_ms: None,
        }
    }
}

/// Per-unit status, in address table order.
#[derive(Debug, Clone, Default)]
pub struct UnitStatusTable {
    units: IndexMap<u16, UnitStatus>,
}

impl UnitStatusTable {
    pub fn new(units: &[u16]) -> Self {
        Self {
            units: units.iter().map(|unit| (*unit, UnitStatus::default())).collect(),
        }
    }

    pub fn get(&self, unit: u16) -> Option<&UnitStatus> {
        self.units.get(&unit)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u16, &UnitStatus)> {
        self.units.iter()
    }

    /// Store a poll reply. Returns `true` when the SOS alarm was newly raised.
    pub fn record_reply(&mut self, unit: u16, reply: StatusReply, now_ms: u64) -> bool {
        let status = self.units.entry(unit).or_default();
        let sos_was_set = status.last.map(|last| last.sos).unwrap_or(false);
        status.last = Some(reply);
        status.consecutive_failures = 0;
        status.reachable = true;
        status.last_seen_ms = Some(now_ms);
        reply.sos && !sos_was_set
    }

    /// A poll exhausted its attempts. Returns `true` when the unit just became unreachable.
    pub fn record_exhausted(&mut self, unit: u16) -> bool {
        let status = self.units.entry(unit).or_default();
        status.consecutive_failures += 1;
        let was_reachable = status.reachable;
        status.reachable = false;
        was_reachable
    }

    pub fn unreachable_count(&self) -> usize {
        self.units.values().filter(|status| !status.reachable).count()
    }

    /// Follow a unit to its new address, keeping its position.
    pub fn rename(&mut self, old: u16, new: u16) {
        if let Some(index) = self.units.get_index_of(&old) {
            let status = self.units[index];
            let (new_index, _) = self.units.insert_full(new, status);
            self.units.move_index(new_index, index);
            self.units.shift_remove(&old);
        }
    }
}

/// Date and time source for time broadcasts and master log records.
pub trait Calendar: Send {
    fn now(&self) -> BcdDateTime;
}

/// Local wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCalendar;

impl Calendar for SystemCalendar {
    fn now(&self) -> BcdDateTime {
        roomlink_common::time::bcd_now_local()
    }
}

/// Frozen calendar for tests and simulations.
#[derive(Debug, Clone, Copy)]
pub struct FixedCalendar(pub BcdDateTime);

impl Calendar for FixedCalendar {
    fn now(&self) -> BcdDateTime {
        self.0
    }
}

/// Phase of a log pull cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogPhase {
    Query,
    Delete,
}

/// Pull of one unit's log: query rounds appending into the master log, then a delete of
/// exactly what was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCycle {
    pub unit: u16,
    pub phase: LogPhase,
    /// Successful query rounds since the last delete.
    pub rounds: u32,
    /// Records stored in the master log and not yet deleted on the unit.
    pub stored: usize,
    /// Set once no further query round follows the pending delete.
    pub end: Option<CycleEnd>,
}

impl LogCycle {
    pub fn new(unit: u16) -> Self {
        Self {
            unit,
            phase: LogPhase::Query,
            rounds: 0,
            stored: 0,
            end: None,
        }
    }
}

/// Why a log pull stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleEnd {
    /// The unit returned an empty page.
    Drained,
    /// The master log has no free slot.
    MasterFull,
    /// Writing to the master log failed.
    StoreFailed,
}

/// Transfer waiting for the bus.
pub struct QueuedTransfer {
    pub kind: TransferKind,
    pub unit: u16,
    pub source: Box<dyn AssetSource>,
}

impl fmt::Debug for QueuedTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedTransfer")
            .field("kind", &self.kind)
            .field("unit", &self.unit)
            .field("source", &self.source.label())
            .finish()
    }
}

/// Everything the master mutates between ticks.
pub struct ProtocolContext<S> {
    pub settings: ProtocolSettings,
    pub enumerator: AddressEnumerator,
    pub log: LogAllocator<S>,
    pub commands: CommandSlot,
    pub units: UnitStatusTable,
    pub flags: StatusFlags,
    pub transfer: Option<TransferEngine>,
    pub transfer_queue: VecDeque<QueuedTransfer>,
    pub last_transfer: Option<TransferReport>,
    pub log_cycle: Option<LogCycle>,
    calendar: Box<dyn Calendar>,
}

impl<S> fmt::Debug for ProtocolContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolContext")
            .field("settings", &self.settings)
            .field("units", &self.enumerator.table().units())
            .field("flags", &self.flags)
            .field("transfer", &self.transfer)
            .field("queued_transfers", &self.transfer_queue.len())
            .field("log_cycle", &self.log_cycle)
            .finish_non_exhaustive()
    }
}

impl<S: NvStore> ProtocolContext<S> {
    pub fn new(
        settings: ProtocolSettings,
        table: AddressTable,
        log: LogAllocator<S>,
        calendar: Box<dyn Calendar>,
    ) -> Self {
        let units = UnitStatusTable::new(table.units());
        Self {
            settings,
            enumerator: AddressEnumerator::new(table),
            log,
            commands: CommandSlot::new(),
            units,
            flags: StatusFlags::empty(),
            transfer: None,
            transfer_queue: VecDeque::new(),
            last_transfer: None,
            log_cycle: None,
            calendar,
        }
    }

    /// Build the whole context from configuration and a raw store.
    pub fn from_config(config: &AppConfig, store: S, calendar: Box<dyn Calendar>) -> Result<Self> {
        let table = AddressTable::from_config(&config.addressing)?;
        let region = &config.log_region;
        let gated = GatedStore::new(store, region.ready_poll_limit, region.page_size);
        let log = LogAllocator::recover(
            gated,
            RegionGeometry::new(region.region_start, region.region_size),
        )?;
        Ok(Self::new(
            ProtocolSettings::from_config(config),
            table,
            log,
            calendar,
        ))
    }

    pub fn now(&self) -> BcdDateTime {
        self.calendar.now()
    }

    /// Append a master event to the log. A full log drops the event and raises `LOG_FULL`.
    pub fn record_event(&mut self, event: MasterEvent) {
        let outcome = match event {
            MasterEvent::TransferFinished { .. } => SystemEventOutcome::Success,
            _ => SystemEventOutcome::Fault,
        };
        let ctx = BusContext::new().with_unit(event.unit());
        log_system_event(Some(&ctx), event.label(), "master event recorded", outcome);

        let at = self.calendar.now();
        match self.log.append(event.to_log_event(at)) {
            Ok(_) => {}
            Err(LogError::Full) => {
                self.flags.insert(StatusFlags::LOG_FULL);
                warn!(event = event.label(), "master log full, event dropped");
            }
            Err(err) => warn!(event = event.label(), error = %err, "master event not stored"),
        }
    }

    /// Queue a transfer; it starts once no other session is active.
    pub fn queue_transfer(&mut self, kind: TransferKind, unit: u16, source: Box<dyn AssetSource>) {
        self.transfer_queue.push_back(QueuedTransfer { kind, unit, source });
    }
}
