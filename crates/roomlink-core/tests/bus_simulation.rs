//! ---
//! rl_section: "05-protocol-core"
//! rl_subsection: "tests"
//! rl_type: "source"
//! rl_scope: "test"
//! rl_description: "Master poll loop driven against simulated rooms."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use roomlink_core::events::codes;
use roomlink_core::{
    AddressTable, CommandOutcome, Destination, FixedCalendar, MasterController, ProtocolContext,
    ProtocolSettings, ScanMode, StatusFlags,
};
use roomlink_msg::{BcdDateTime, Opcode};
use roomlink_persistence::{GatedStore, LogAllocator, MemoryEeprom, RegionGeometry};
use roomlink_rt::{Clock, ManualClock};
use roomlink_testharness::{Fault, SimulatedBus, SimulatedRoom, SYSTEM_INFO};
use roomlink_transfer::{MemorySource, TransferKind};

const MASTER: u16 = 0x0001;

type Controller = MasterController<MemoryEeprom, SimulatedBus, ManualClock>;

struct Rig {
    ctl: Controller,
    clock: ManualClock,
}

impl Rig {
    fn new(units: &[u16], rooms: Vec<SimulatedRoom>, slots: usize) -> Self {
        Self::with_settings(units, rooms, slots, ProtocolSettings::default())
    }

    fn with_settings(
        units: &[u16],
        rooms: Vec<SimulatedRoom>,
        slots: usize,
        settings: ProtocolSettings,
    ) -> Self {
        let mut bus = SimulatedBus::new(MASTER, 0xFFFE, 0xFFFF);
        for room in rooms {
            bus.add_room(room);
        }
        let store = GatedStore::new(MemoryEeprom::new(slots * 16), 10, 64);
        let log = LogAllocator::recover(store, RegionGeometry::new(0, slots * 16)).unwrap();
        let ctx = ProtocolContext::new(
            settings,
            AddressTable::new(units.to_vec(), 0xFFFE, 0xFFFF).unwrap(),
            log,
            Box::new(FixedCalendar(BcdDateTime::new(24, 6, 1, 9, 30, 0))),
        );
        let clock = ManualClock::new();
        Self {
            ctl: MasterController::new(ctx, bus, clock.clone()),
            clock,
        }
    }

    fn run_for(&mut self, ms: u64) {
        let end = self.clock.now_ms() + ms;
        while self.clock.now_ms() < end {
            self.ctl.poll();
            self.clock.advance(2);
        }
    }

    fn run_until(&mut self, limit_ms: u64, done: impl Fn(&Controller) -> bool) -> bool {
        let end = self.clock.now_ms() + limit_ms;
        while self.clock.now_ms() < end {
            if done(&self.ctl) {
                return true;
            }
            self.ctl.poll();
            self.clock.advance(2);
        }
        done(&self.ctl)
    }

    fn event_codes(&mut self) -> Vec<u8> {
        self.ctl
            .get_log_page(0, 512)
            .unwrap()
            .iter()
            .map(|record| record.event_code)
            .collect()
    }
}

#[test]
fn polls_every_unit_round_robin() {
    let mut rig = Rig::new(
        &[0x0101, 0x0102],
        vec![SimulatedRoom::new(0x0101), SimulatedRoom::new(0x0102)],
        32,
    );
    rig.ctl.bus_mut().room_mut(0x0102).unwrap().room_status = 0x21;
    rig.run_for(200);

    let units = &rig.ctl.context().units;
    assert_eq!(units.get(0x0101).unwrap().last.unwrap().temperature, 215);
    assert_eq!(units.get(0x0102).unwrap().last.unwrap().room_status, 0x21);
    // The clock went out first and reached both rooms.
    let first = &rig.ctl.bus().sent()[0];
    assert_eq!(first[6], Opcode::SetClock.code());
    assert!(rig
        .ctl
        .bus()
        .rooms()
        .iter()
        .all(|room| room.clock == BcdDateTime::new(24, 6, 1, 9, 30, 0)));
}

#[test]
fn log_cycle_pulls_then_deletes_exactly_what_was_stored() {
    let room = SimulatedRoom::new(0x0101).with_card_events(20, 3);
    let mut rig = Rig::new(&[0x0101], vec![room], 64);

    assert!(rig.run_until(2_000, |ctl| ctl.bus().room(0x0101).unwrap().pending_logs() == 0
        && ctl.context().log_cycle.is_none()));
    assert_eq!(rig.ctl.context().log.count(), 20);
    let pulled = rig.ctl.get_log_page(0, 20).unwrap();
    assert_eq!(pulled[0].originator, [3, 0, 0, 0xC0, 0xDE]);
    assert_eq!(pulled[19].originator, [3, 0, 19, 0xC0, 0xDE]);

    let room = rig.ctl.bus().room(0x0101).unwrap();
    let queries = room.handled().iter().filter(|op| **op == Opcode::GetLogList).count();
    let deletes = room.handled().iter().filter(|op| **op == Opcode::DeleteLogList).count();
    assert_eq!(queries, 3);
    assert_eq!(deletes, 1);
}

#[test]
fn log_cadence_interleaves_deletes() {
    let settings = ProtocolSettings {
        log_cadence: 1,
        ..ProtocolSettings::default()
    };
    let room = SimulatedRoom::new(0x0101).with_card_events(20, 9);
    let mut rig = Rig::with_settings(&[0x0101], vec![room], 64, settings);

    assert!(rig.run_until(2_000, |ctl| ctl.context().log.count() == 20
        && ctl.context().log_cycle.is_none()));
    let room = rig.ctl.bus().room(0x0101).unwrap();
    let deletes = room.handled().iter().filter(|op| **op == Opcode::DeleteLogList).count();
    assert_eq!(deletes, 2);
    assert_eq!(room.pending_logs(), 0);
}

#[test]
fn full_master_log_stops_the_pull_and_raises_flag() {
    let room = SimulatedRoom::new(0x0101).with_card_events(20, 1);
    let mut rig = Rig::new(&[0x0101], vec![room], 8);

    assert!(rig.run_until(2_000, |ctl| ctl.flags().contains(StatusFlags::LOG_FULL)
        && ctl.context().log_cycle.is_none()));
    assert!(rig.ctl.context().log.is_full());
    assert_eq!(rig.ctl.bus().room(0x0101).unwrap().pending_logs(), 12);

    rig.run_for(500);
    assert_eq!(rig.ctl.bus().room(0x0101).unwrap().pending_logs(), 12);

    rig.ctl.delete_log_page(8).unwrap();
    assert!(!rig.ctl.flags().contains(StatusFlags::LOG_FULL));
    assert!(rig.run_until(2_000, |ctl| ctl.bus().room(0x0101).unwrap().pending_logs() == 4));
}

#[test]
fn master_store_fault_is_not_reported_as_full() {
    let room = SimulatedRoom::new(0x0101).with_card_events(6, 2);
    let mut rig = Rig::new(&[0x0101], vec![room], 32);
    rig.ctl
        .context_mut()
        .log
        .store_mut()
        .inner_mut()
        .set_stuck(true);

    assert!(rig.run_until(2_000, |ctl| ctl
        .flags()
        .contains(StatusFlags::LOG_TRANSFER_FAILED)));
    assert!(!rig.ctl.flags().contains(StatusFlags::LOG_FULL));
    assert_eq!(rig.ctl.context().log.count(), 0);
    assert_eq!(rig.ctl.bus().room(0x0101).unwrap().pending_logs(), 6);

    rig.ctl
        .context_mut()
        .log
        .store_mut()
        .inner_mut()
        .set_stuck(false);
    assert!(rig.run_until(2_000, |ctl| ctl.bus().room(0x0101).unwrap().pending_logs() == 0));
    assert!(!rig.ctl.flags().contains(StatusFlags::LOG_FULL));
}

#[test]
fn command_survives_nak_and_corruption() {
    let mut rig = Rig::new(&[0x0101], vec![SimulatedRoom::new(0x0101)], 32);
    rig.ctl.bus_mut().inject([Fault::Nak, Fault::Corrupt]);
    rig.ctl
        .submit_command(Opcode::GetRoomTemperature, Destination::Unit(0x0101), "")
        .unwrap();

    assert!(rig.run_until(1_000, |ctl| !ctl.context().commands.is_busy()));
    let result = rig.ctl.take_command_result().unwrap();
    assert_eq!(result.outcome, CommandOutcome::Reply(vec![0x00, 215]));
    assert_eq!(result.attempts, 3);
}

#[test]
fn reply_cut_short_is_retried_after_byte_timeout() {
    let mut rig = Rig::new(&[0x0101], vec![SimulatedRoom::new(0x0101)], 32);
    rig.ctl.bus_mut().inject([Fault::Truncate]);
    rig.ctl
        .submit_command(Opcode::GetRoomTemperature, Destination::Unit(0x0101), "")
        .unwrap();

    assert!(rig.run_until(1_000, |ctl| !ctl.context().commands.is_busy()));
    let result = rig.ctl.take_command_result().unwrap();
    assert_eq!(result.outcome, CommandOutcome::Reply(vec![0x00, 215]));
    assert_eq!(result.attempts, 2);
    assert_eq!(rig.ctl.bus().pending_faults(), 0);

    rig.run_for(200);
    assert!(rig.ctl.context().units.get(0x0101).unwrap().reachable);
}

#[test]
fn broadcast_command_is_sent_without_waiting() {
    let mut rig = Rig::new(
        &[0x0101, 0x0102],
        vec![SimulatedRoom::new(0x0101), SimulatedRoom::new(0x0102)],
        32,
    );
    rig.ctl
        .submit_command(Opcode::SetRoomTemperature, Destination::Broadcast, "240")
        .unwrap();
    rig.run_for(20);
    let result = rig.ctl.take_command_result().unwrap();
    assert_eq!(result.outcome, CommandOutcome::Sent);
    assert!(rig.ctl.bus().rooms().iter().all(|room| room.temperature == 240));
}

#[test]
fn set_bus_address_follows_the_unit() {
    let mut rig = Rig::new(
        &[0x0101, 0x0102],
        vec![SimulatedRoom::new(0x0101), SimulatedRoom::new(0x0102)],
        32,
    );
    rig.ctl
        .submit_command(Opcode::SetBusAddress, Destination::Unit(0x0102), "00515")
        .unwrap();
    assert!(rig.run_until(1_000, |ctl| !ctl.context().commands.is_busy()));
    assert_eq!(
        rig.ctl.take_command_result().unwrap().outcome,
        CommandOutcome::Acked
    );

    let table = rig.ctl.context().enumerator.table();
    assert_eq!(table.units(), &[0x0101, 0x0203]);
    assert!(rig.ctl.context().units.get(0x0102).is_none());

    rig.run_for(400);
    let renamed = rig.ctl.context().units.get(0x0203).unwrap();
    assert!(renamed.last.is_some());
    assert!(renamed.reachable);
}

#[test]
fn silent_unit_becomes_unreachable_once_and_recovers() {
    let settings = ProtocolSettings {
        attempt_ceiling: 3,
        ..ProtocolSettings::default()
    };
    let mut rig = Rig::with_settings(
        &[0x0101, 0x0102],
        vec![SimulatedRoom::new(0x0101), SimulatedRoom::new(0x0102)],
        32,
        settings,
    );
    rig.ctl.bus_mut().set_online(0x0102, false);
    assert!(rig.run_until(5_000, |ctl| !ctl.context().units.get(0x0102).unwrap().reachable));
    rig.run_for(3_000);

    let unreachable = rig
        .event_codes()
        .into_iter()
        .filter(|code| *code == codes::UNIT_UNREACHABLE)
        .count();
    assert_eq!(unreachable, 1);
    assert!(rig.ctl.context().units.get(0x0101).unwrap().reachable);

    rig.ctl.bus_mut().set_online(0x0102, true);
    assert!(rig.run_until(2_000, |ctl| ctl.context().units.get(0x0102).unwrap().reachable));
}

#[test]
fn sos_is_logged_when_raised() {
    let mut rig = Rig::new(&[0x0101], vec![SimulatedRoom::new(0x0101)], 32);
    rig.ctl.bus_mut().room_mut(0x0101).unwrap().sos = true;
    rig.run_for(600);
    let sos: Vec<u8> = rig
        .event_codes()
        .into_iter()
        .filter(|code| *code == codes::SOS_REPORTED)
        .collect();
    assert_eq!(sos.len(), 1);
}

#[test]
fn firmware_update_runs_through_the_bootloader() -> Result<()> {
    let settings = ProtocolSettings {
        bootloader_settle: Duration::from_millis(300),
        ..ProtocolSettings::default()
    };
    let mut rig = Rig::with_settings(&[0x0101], vec![SimulatedRoom::new(0x0101)], 32, settings);
    let image: Vec<u8> = (0..300u32).map(|n| (n * 7) as u8).collect();
    rig.ctl.submit_transfer(
        TransferKind::Firmware,
        0x0101,
        Box::new(MemorySource::new("app-v2.bin", image.clone())),
    )?;

    assert!(rig.run_until(10_000, |ctl| ctl.context().last_transfer.is_some()
        && ctl.context().transfer.is_none()));
    let report = rig.ctl.context().last_transfer.clone().unwrap();
    assert_eq!(report.total_chunks, 5);
    assert_eq!(report.chunks_acked, 5);

    let room = rig.ctl.bus().room(0x0101).unwrap();
    assert_eq!(room.images(), &[(TransferKind::Firmware, image)]);
    assert!(!room.in_bootloader);
    let order: Vec<Opcode> = room
        .handled()
        .iter()
        .copied()
        .filter(|op| op.is_transfer() || matches!(op, Opcode::StartBootloader | Opcode::ExecuteApplication))
        .collect();
    assert_eq!(
        order,
        vec![Opcode::DownloadFirmware, Opcode::StartBootloader, Opcode::ExecuteApplication]
    );
    assert!(rig.event_codes().contains(&codes::TRANSFER_FINISHED));
    assert!(!rig.ctl.flags().contains(StatusFlags::LAST_TRANSFER_FAILED));
    Ok(())
}

#[test]
fn firmware_left_in_bootloader_is_a_failed_transfer() -> Result<()> {
    let mut settings = ProtocolSettings::default();
    settings.transfer.attempt_ceiling = 3;
    let mut room = SimulatedRoom::new(0x0101);
    room.refuses_restart = true;
    let mut rig = Rig::with_settings(&[0x0101], vec![room], 32, settings);
    let image = vec![0x5A; 130];
    rig.ctl.submit_transfer(
        TransferKind::Firmware,
        0x0101,
        Box::new(MemorySource::new("app-v3.bin", image.clone())),
    )?;

    assert!(rig.run_until(10_000, |ctl| ctl.flags().contains(StatusFlags::LAST_TRANSFER_FAILED)
        && ctl.context().transfer.is_none()));
    let report = rig.ctl.context().last_transfer.clone().unwrap();
    assert_eq!(report.chunks_acked, report.total_chunks);
    assert_eq!(report.follow_up, Some(Opcode::ExecuteApplication));

    let room = rig.ctl.bus().room(0x0101).unwrap();
    assert_eq!(room.images(), &[(TransferKind::Firmware, image)]);
    assert!(room.in_bootloader);
    let restarts = room
        .handled()
        .iter()
        .filter(|op| **op == Opcode::ExecuteApplication)
        .count();
    assert_eq!(restarts, 3);

    let events = rig.event_codes();
    assert!(events.contains(&codes::TRANSFER_FINISHED));
    assert!(events.contains(&codes::TRANSFER_FAILED));
    Ok(())
}

#[test]
fn failed_transfer_is_flagged_and_logged() -> Result<()> {
    let mut settings = ProtocolSettings::default();
    settings.transfer.attempt_ceiling = 2;
    let mut rig = Rig::with_settings(&[0x0101], vec![SimulatedRoom::new(0x0101)], 32, settings);
    rig.ctl.bus_mut().set_online(0x0101, false);
    rig.ctl.submit_transfer(
        TransferKind::Asset { slot: 4 },
        0x0101,
        Box::new(MemorySource::new("logo.bmp", vec![0xAA; 100])),
    )?;

    assert!(rig.run_until(2_000, |ctl| ctl.flags().contains(StatusFlags::LAST_TRANSFER_FAILED)));
    assert!(rig.ctl.context().transfer.is_none());
    assert!(rig.event_codes().contains(&codes::TRANSFER_FAILED));
    Ok(())
}

#[test]
fn scan_finds_the_unconfigured_room() -> Result<()> {
    let mut rig = Rig::new(
        &[0x0101],
        vec![SimulatedRoom::new(0x0101), SimulatedRoom::new(0x0105)],
        32,
    );
    let report = rig.ctl.scan(0x0100..=0x0110, ScanMode::FindNew)?;
    assert_eq!(report.found, Some(0x0105));
    assert_eq!(report.system_info, Some(SYSTEM_INFO.to_vec()));

    let report = rig.ctl.scan(0x0100..=0x0110, ScanMode::FirstResponder)?;
    assert_eq!(report.found, Some(0x0101));
    Ok(())
}
