//! ---
//! rl_section: "06-simulation"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Simulated room controllers and bus fault injection."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::collections::VecDeque;

use roomlink_msg::{BcdDateTime, Frame, FrameKind, LogEvent, LogRecord, Opcode};
use roomlink_transfer::{ChunkVerdict, MemorySink, TransferKind, TransferReceiver};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Payload a simulated unit returns for `GetSystemInfo`.
pub const SYSTEM_INFO: [u8; 4] = [b'R', b'L', 1, 0];

/// What a room answers to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomReply {
    Silent,
    Ack,
    Nak,
    /// ACK followed by a data frame with this payload.
    Data(Vec<u8>),
}

/// Observable state of a simulated room, for assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub address: u16,
    pub room_status: u8,
    pub temperature: u16,
    pub digital_io: u8,
    pub sos: bool,
    pub in_bootloader: bool,
    pub pending_logs: usize,
}

/// One room controller on the bus.
#[derive(Debug, Clone)]
pub struct SimulatedRoom {
    address: u16,
    pub clock: BcdDateTime,
    pub room_status: u8,
    /// Setpoint in tenths of a degree.
    pub temperature: u16,
    pub digital_io: u8,
    pub sos: bool,
    pub in_bootloader: bool,
    /// NAK every request to leave the bootloader.
    pub refuses_restart: bool,
    logs: VecDeque<LogRecord>,
    next_sequence: u16,
    receiver: TransferReceiver,
    sink: MemorySink,
    handled: Vec<Opcode>,
}

impl SimulatedRoom {
    pub fn new(address: u16) -> Self {
        Self {
            address,
            clock: BcdDateTime::new(24, 1, 1, 0, 0, 0),
            room_status: 0,
            temperature: 215,
            digital_io: 0,
            sos: false,
            in_bootloader: false,
            refuses_restart: false,
            logs: VecDeque::new(),
            next_sequence: 1,
            receiver: TransferReceiver::new(),
            sink: MemorySink::default(),
            handled: Vec::new(),
        }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    /// Queue an event in the unit's own log.
    pub fn push_log(&mut self, event: LogEvent) {
        let record = event.into_record(self.next_sequence);
        self.next_sequence = self.next_sequence.wrapping_add(1).max(1);
        self.logs.push_back(record);
    }

    /// Queue `count` card events with serials derived from `seed`.
    pub fn with_card_events(mut self, count: usize, seed: u8) -> Self {
        for n in 0..count {
            let serial = [seed, (n >> 8) as u8, n as u8, 0xC0, 0xDE];
            self.push_log(LogEvent {
                event_code: 0x10,
                event_type: 1,
                group: 0,
                originator: serial,
                timestamp: self.clock,
            });
        }
        self
    }

    pub fn logs(&self) -> impl Iterator<Item = &LogRecord> {
        self.logs.iter()
    }

    pub fn pending_logs(&self) -> usize {
        self.logs.len()
    }

    /// Completed images received so far.
    pub fn images(&self) -> &[(TransferKind, Vec<u8>)] {
        self.sink.images()
    }

    /// Opcodes handled, in order; data chunks are not listed.
    pub fn handled(&self) -> &[Opcode] {
        &self.handled
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            address: self.address,
            room_status: self.room_status,
            temperature: self.temperature,
            digital_io: self.digital_io,
            sos: self.sos,
            in_bootloader: self.in_bootloader,
            pending_logs: self.logs.len(),
        }
    }

    fn status_payload(&self) -> Vec<u8> {
        let mut flags = 0;
        if !self.logs.is_empty() {
            flags |= 0x01;
        }
        if self.sos {
            flags |= 0x02;
        }
        let [hi, lo] = self.temperature.to_be_bytes();
        vec![flags, self.room_status, hi, lo]
    }

    fn log_page(&self, args: &[u8]) -> RoomReply {
        let [off_hi, off_lo, max] = args else {
            return RoomReply::Nak;
        };
        let offset = usize::from(u16::from_be_bytes([*off_hi, *off_lo]));
        let max = usize::from(*max).min(15);
        let records: Vec<&LogRecord> = self.logs.iter().skip(offset).take(max).collect();
        let mut payload = vec![records.len() as u8];
        for record in records {
            payload.extend_from_slice(&record.to_bytes());
        }
        RoomReply::Data(payload)
    }

    /// Answer one frame addressed to this room, or broadcast to every room.
    pub fn handle(&mut self, frame: &Frame) -> RoomReply {
        if frame.kind == FrameKind::Data {
            return self.handle_chunk(&frame.payload);
        }
        let Some((&code, args)) = frame.payload.split_first() else {
            return RoomReply::Nak;
        };
        let Some(opcode) = Opcode::from_code(code) else {
            debug!(unit = self.address, code, "unknown opcode");
            return RoomReply::Nak;
        };
        self.handled.push(opcode);
        match (opcode, args) {
            (Opcode::GetSystemInfo, []) => RoomReply::Data(SYSTEM_INFO.to_vec()),
            (Opcode::SetClock, [_, _, _, _, _, _]) => {
                let stamp = BcdDateTime::from_raw([args[0], args[1], args[2], args[3], args[4], args[5]]);
                if !stamp.is_valid() {
                    return RoomReply::Nak;
                }
                self.clock = stamp;
                RoomReply::Ack
            }
            (Opcode::GetClock, []) => RoomReply::Data(self.clock.0.to_vec()),
            (Opcode::GetBusAddress, []) => RoomReply::Data(self.address.to_be_bytes().to_vec()),
            (Opcode::SetBusAddress, [hi, lo]) => {
                self.address = u16::from_be_bytes([*hi, *lo]);
                RoomReply::Ack
            }
            (Opcode::GetDigitalIo, []) => RoomReply::Data(vec![self.digital_io]),
            (Opcode::SetDigitalIo, [value]) => {
                self.digital_io = *value;
                RoomReply::Ack
            }
            (Opcode::GetRoomStatus, []) => RoomReply::Data(vec![self.room_status]),
            (Opcode::SetRoomStatus, [value]) => {
                self.room_status = *value;
                RoomReply::Ack
            }
            (Opcode::GetRoomTemperature, []) => {
                RoomReply::Data(self.temperature.to_be_bytes().to_vec())
            }
            (Opcode::SetRoomTemperature, [hi, lo]) => {
                self.temperature = u16::from_be_bytes([*hi, *lo]);
                RoomReply::Ack
            }
            (Opcode::ResetSosAlarm, []) => {
                self.sos = false;
                RoomReply::Ack
            }
            (Opcode::GetStatus, []) => RoomReply::Data(self.status_payload()),
            (Opcode::GetLogList, _) => self.log_page(args),
            (Opcode::DeleteLogList, [hi, lo]) => {
                let count = usize::from(u16::from_be_bytes([*hi, *lo])).min(self.logs.len());
                self.logs.drain(..count);
                RoomReply::Ack
            }
            (Opcode::DownloadImage | Opcode::DownloadFirmware | Opcode::DownloadBootloader, _) => {
                match self.receiver.accept_header(&frame.payload) {
                    Ok(_) => RoomReply::Ack,
                    Err(err) => {
                        debug!(unit = self.address, error = %err, "transfer header refused");
                        RoomReply::Nak
                    }
                }
            }
            (Opcode::StartBootloader, []) => {
                self.in_bootloader = true;
                RoomReply::Ack
            }
            (Opcode::ExecuteApplication, []) if self.refuses_restart => RoomReply::Nak,
            (Opcode::ExecuteApplication, []) => {
                self.in_bootloader = false;
                RoomReply::Ack
            }
            _ => RoomReply::Nak,
        }
    }

    fn handle_chunk(&mut self, payload: &[u8]) -> RoomReply {
        match self.receiver.accept_chunk(payload, &mut self.sink) {
            Ok(ChunkVerdict::Accepted { seq, .. }) | Ok(ChunkVerdict::Duplicate { seq }) => {
                RoomReply::Data(seq.to_be_bytes().to_vec())
            }
            Ok(ChunkVerdict::OutOfOrder { expected, got }) => {
                debug!(unit = self.address, expected, got, "chunk out of order");
                RoomReply::Nak
            }
            Err(err) => {
                debug!(unit = self.address, error = %err, "chunk refused");
                RoomReply::Nak
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomlink_msg::{encode, RECORD_SIZE};

    fn command(payload: Vec<u8>) -> Frame {
        encode(FrameKind::Command, 0x0101, 0x0001, payload).unwrap()
    }

    #[test]
    fn status_reflects_logs_and_sos() {
        let mut room = SimulatedRoom::new(0x0101).with_card_events(2, 7);
        room.sos = true;
        room.room_status = 0x21;
        let reply = room.handle(&command(vec![Opcode::GetStatus.code()]));
        assert_eq!(reply, RoomReply::Data(vec![0x03, 0x21, 0x00, 215]));
    }

    #[test]
    fn log_pages_and_deletes() {
        let mut room = SimulatedRoom::new(0x0101).with_card_events(20, 1);
        let RoomReply::Data(page) = room.handle(&command(vec![Opcode::GetLogList.code(), 0, 0, 15]))
        else {
            panic!("expected a data reply");
        };
        assert_eq!(page[0], 15);
        assert_eq!(page.len(), 1 + 15 * RECORD_SIZE);

        let RoomReply::Data(rest) = room.handle(&command(vec![Opcode::GetLogList.code(), 0, 15, 15]))
        else {
            panic!("expected a data reply");
        };
        assert_eq!(rest[0], 5);

        assert_eq!(
            room.handle(&command(vec![Opcode::DeleteLogList.code(), 0, 18])),
            RoomReply::Ack
        );
        assert_eq!(room.pending_logs(), 2);
    }

    #[test]
    fn setters_update_state() {
        let mut room = SimulatedRoom::new(0x0101);
        room.handle(&command(vec![Opcode::SetRoomTemperature.code(), 0x01, 0x2C]));
        room.handle(&command(vec![Opcode::SetDigitalIo.code(), 0xA5]));
        room.handle(&command(vec![Opcode::SetBusAddress.code(), 0x02, 0x01]));
        let snapshot = room.snapshot();
        assert_eq!(snapshot.temperature, 300);
        assert_eq!(snapshot.digital_io, 0xA5);
        assert_eq!(snapshot.address, 0x0201);
        assert_eq!(room.handle(&command(vec![0x42])), RoomReply::Nak);
    }
}
