//! ---
//! rl_section: "05-protocol-core"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Master orchestration of the room controller bus."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Synchronous bus scan used for commissioning.
//!
//! The scan probes a range of addresses with `GetSystemInfo` and stops at the first unit
//! that answers. In [`ScanMode::FindNew`] addresses already in the table are skipped, so
//! the result is a unit that is on the bus but not yet configured. It shares the
//! countdown and attempt primitives with the poll loop but spins on [`Clock::idle`] until
//! it is done.

use std::ops::RangeInclusive;
use std::time::Duration;

use roomlink_msg::{encode, AddressPair, BusTransport, FrameKind, Opcode, ReplyShape};
use roomlink_rt::{Clock, Countdown};
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, info};

use crate::attempt::{AttemptOutcome, ExchangeAttempt};
use crate::enumerator::AddressTable;
use crate::reply::{classify_reply, ReplyStatus};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ScanMode {
    /// Report the first address that answers.
    FirstResponder,
    /// Report the first answering address missing from the configured table.
    FindNew,
}

/// Scan sub-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ScanState {
    Init,
    Setup,
    Send,
    Pending,
    Receive,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    pub master: u16,
    pub response_timeout: Duration,
    pub byte_timeout: Duration,
    pub attempts_per_address: u32,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            master: 0x0001,
            response_timeout: Duration::from_millis(150),
            byte_timeout: Duration::from_millis(20),
            attempts_per_address: 2,
        }
    }
}

/// Outcome of a finished scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub mode: ScanMode,
    pub found: Option<u16>,
    /// Addresses actually probed (reserved and skipped ones excluded).
    pub probed: u32,
    /// Frames sent, retries included.
    pub frames_sent: u32,
    /// `GetSystemInfo` payload of the unit found.
    pub system_info: Option<Vec<u8>>,
}

/// One scan run over a borrowed bus and clock.
pub struct BusScan<'a, B: ?Sized, C: ?Sized> {
    bus: &'a mut B,
    clock: &'a C,
    table: &'a AddressTable,
    settings: ScanSettings,
    mode: ScanMode,
    range: RangeInclusive<u16>,
    state: ScanState,
    cursor: Option<u16>,
    candidate: u16,
    attempt: ExchangeAttempt,
    response_timer: Countdown,
    byte_timer: Countdown,
    rx: Vec<u8>,
    report: ScanReport,
}

impl<'a, B, C> BusScan<'a, B, C>
where
    B: BusTransport + ?Sized,
    C: Clock + ?Sized,
{
    pub fn new(
        bus: &'a mut B,
        clock: &'a C,
        table: &'a AddressTable,
        range: RangeInclusive<u16>,
        mode: ScanMode,
        settings: ScanSettings,
    ) -> Self {
        Self {
            bus,
            clock,
            table,
            settings,
            mode,
            range,
            state: ScanState::Init,
            cursor: None,
            candidate: 0,
            attempt: ExchangeAttempt::new(settings.attempts_per_address),
            response_timer: Countdown::stopped(),
            byte_timer: Countdown::stopped(),
            rx: Vec::new(),
            report: ScanReport {
                mode,
                found: None,
                probed: 0,
                frames_sent: 0,
                system_info: None,
            },
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Drive the sub-state machine to completion.
    pub fn run(mut self) -> Result<ScanReport> {
        while self.state != ScanState::Done {
            self.state = self.step()?;
        }
        info!(
            mode = %self.mode,
            found = ?self.report.found,
            probed = self.report.probed,
            "bus scan finished"
        );
        Ok(self.report)
    }

    fn skip(&self, addr: u16) -> bool {
        self.table.is_reserved(addr)
            || addr == self.settings.master
            || (self.mode == ScanMode::FindNew && self.table.contains(addr))
    }

    fn advance_cursor(&mut self) -> Option<u16> {
        let (start, end) = (*self.range.start(), *self.range.end());
        if start > end {
            return None;
        }
        let mut next = match self.cursor {
            None => Some(start),
            Some(current) if current < end => Some(current + 1),
            Some(_) => None,
        };
        while let Some(addr) = next {
            if !self.skip(addr) {
                self.cursor = Some(addr);
                return Some(addr);
            }
            next = (addr < end).then(|| addr + 1);
        }
        self.cursor = Some(end);
        None
    }

    fn failed_attempt(&mut self) -> ScanState {
        self.response_timer.stop();
        self.byte_timer.stop();
        match self.attempt.record_failure() {
            AttemptOutcome::Retry { .. } => ScanState::Send,
            AttemptOutcome::Exhausted => ScanState::Setup,
        }
    }

    fn step(&mut self) -> Result<ScanState> {
        let now = self.clock.now_ms();
        let next = match self.state {
            ScanState::Init => {
                self.bus.discard_received();
                self.cursor = None;
                ScanState::Setup
            }
            ScanState::Setup => match self.advance_cursor() {
                Some(addr) => {
                    self.candidate = addr;
                    self.attempt.reset();
                    self.report.probed += 1;
                    ScanState::Send
                }
                None => ScanState::Done,
            },
            ScanState::Send => {
                let frame = encode(
                    FrameKind::Command,
                    self.candidate,
                    self.settings.master,
                    vec![Opcode::GetSystemInfo.code()],
                )?;
                self.bus.discard_received();
                self.rx.clear();
                self.attempt.record_send();
                self.report.frames_sent += 1;
                match self.bus.send(&frame.to_bytes()) {
                    Ok(()) => {
                        self.response_timer.start(now, self.settings.response_timeout);
                        ScanState::Pending
                    }
                    Err(err) => {
                        debug!(addr = self.candidate, error = %err, "scan probe send failed");
                        self.failed_attempt()
                    }
                }
            }
            ScanState::Pending => {
                if self.bus.bytes_available() > 0 {
                    self.rx.extend(self.bus.take_received());
                    self.byte_timer.start(now, self.settings.byte_timeout);
                    ScanState::Receive
                } else if self.response_timer.expired(now) {
                    self.failed_attempt()
                } else {
                    self.clock.idle();
                    ScanState::Pending
                }
            }
            ScanState::Receive => {
                if self.bus.bytes_available() > 0 {
                    self.rx.extend(self.bus.take_received());
                    self.byte_timer.start(now, self.settings.byte_timeout);
                }
                let expect = AddressPair::reply(self.settings.master, self.candidate);
                match classify_reply(&self.rx, ReplyShape::AckThenFrame, expect) {
                    ReplyStatus::AckWithFrame(frame) => {
                        debug!(addr = self.candidate, "scan probe answered");
                        self.report.found = Some(self.candidate);
                        self.report.system_info = Some(frame.payload);
                        ScanState::Done
                    }
                    ReplyStatus::Incomplete if !self.byte_timer.expired(now) => {
                        self.clock.idle();
                        ScanState::Receive
                    }
                    _ => self.failed_attempt(),
                }
            }
            ScanState::Done => ScanState::Done,
        };
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomlink_msg::{InMemoryBus, ACK, NAK};
    use roomlink_rt::ManualClock;

    fn info_reply(unit: u16) -> Vec<u8> {
        let mut bytes = vec![ACK];
        bytes.extend(
            encode(FrameKind::Command, 0x0001, unit, vec![b'R', b'L', 1, 0])
                .unwrap()
                .to_bytes(),
        );
        bytes
    }

    fn table() -> AddressTable {
        AddressTable::new(vec![0x0010, 0x0011], 0xFFFE, 0xFFFF).unwrap()
    }

    #[test]
    fn first_responder_after_silence() {
        let mut bus = InMemoryBus::new();
        // 0x0010 silent twice, 0x0011 answers.
        bus.script_silence();
        bus.script_silence();
        bus.script_reply(info_reply(0x0011));
        let clock = ManualClock::new();
        let table = table();
        let report = BusScan::new(
            &mut bus,
            &clock,
            &table,
            0x0010..=0x0020,
            ScanMode::FirstResponder,
            ScanSettings::default(),
        )
        .run()
        .unwrap();
        assert_eq!(report.found, Some(0x0011));
        assert_eq!(report.probed, 2);
        assert_eq!(report.frames_sent, 3);
        assert_eq!(report.system_info, Some(vec![b'R', b'L', 1, 0]));
    }

    #[test]
    fn find_new_skips_known_and_reserved() {
        let mut bus = InMemoryBus::new();
        // 0x0002 refuses, 0x0003..=0x000F and 0x0012 stay silent, 0x0013 answers.
        bus.script_reply(vec![NAK]);
        bus.script_reply(vec![NAK]);
        for _ in 0..(14 * 2) {
            bus.script_silence();
        }
        bus.script_reply(info_reply(0x0013));
        let clock = ManualClock::new();
        let table = table();
        let report = BusScan::new(
            &mut bus,
            &clock,
            &table,
            0x0000..=0x0013,
            ScanMode::FindNew,
            ScanSettings::default(),
        )
        .run()
        .unwrap();
        assert_eq!(report.found, Some(0x0013));
        let probed: Vec<u16> = bus
            .sent()
            .iter()
            .map(|bytes| u16::from_be_bytes([bytes[1], bytes[2]]))
            .collect();
        assert!(probed.iter().all(|addr| *addr != 0 && *addr != 0x0001));
        assert!(!probed.contains(&0x0010));
        assert!(!probed.contains(&0x0011));
        assert_eq!(probed.first(), Some(&0x0002));
        assert_eq!(report.probed, 16);
    }

    #[test]
    fn empty_range_finds_nothing() {
        let mut bus = InMemoryBus::new();
        let clock = ManualClock::new();
        let table = table();
        let report = BusScan::new(
            &mut bus,
            &clock,
            &table,
            0x0030..=0x0031,
            ScanMode::FirstResponder,
            ScanSettings {
                attempts_per_address: 1,
                ..ScanSettings::default()
            },
        )
        .run()
        .unwrap();
        assert_eq!(report.found, None);
        assert_eq!(report.probed, 2);
        assert!(clock.now_ms() >= 300);
    }
}
