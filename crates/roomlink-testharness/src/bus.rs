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

use rand::prelude::*;
use roomlink_msg::{decode, encode, BusTransport, FrameKind, MessagingError, Result, RxBuffer, ACK, NAK};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::room::{RoomReply, SimulatedRoom};

/// Disturbance applied to the next point-to-point exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    /// The unit never sees the request.
    Silence,
    /// The unit refuses the request.
    Nak,
    /// The reply arrives with a damaged checksum.
    Corrupt,
    /// The transport reports a write failure.
    SendError,
    /// The reply stops halfway through its frame.
    Truncate,
}

/// Bus with simulated rooms attached.
///
/// Replies land in the receive buffer synchronously with `send`, the same way a loopback
/// serial adapter would deliver them before the next poll.
#[derive(Debug)]
pub struct SimulatedBus {
    master: u16,
    group: u16,
    broadcast: u16,
    rooms: Vec<SimulatedRoom>,
    offline: Vec<u16>,
    faults: VecDeque<Fault>,
    noise: Option<(StdRng, f64)>,
    rx: RxBuffer,
    sent: Vec<Vec<u8>>,
}

impl SimulatedBus {
    pub fn new(master: u16, group: u16, broadcast: u16) -> Self {
        Self {
            master,
            group,
            broadcast,
            rooms: Vec::new(),
            offline: Vec::new(),
            faults: VecDeque::new(),
            noise: None,
            rx: RxBuffer::new(),
            sent: Vec::new(),
        }
    }

    pub fn with_room(mut self, room: SimulatedRoom) -> Self {
        self.rooms.push(room);
        self
    }

    /// Drop a random share of replies, reproducibly for a given seed.
    pub fn with_random_silence(mut self, seed: u64, rate: f64) -> Self {
        self.noise = Some((StdRng::seed_from_u64(seed), rate.clamp(0.0, 1.0)));
        self
    }

    pub fn add_room(&mut self, room: SimulatedRoom) {
        self.rooms.push(room);
    }

    pub fn rooms(&self) -> &[SimulatedRoom] {
        &self.rooms
    }

    pub fn room(&self, address: u16) -> Option<&SimulatedRoom> {
        self.rooms.iter().find(|room| room.address() == address)
    }

    pub fn room_mut(&mut self, address: u16) -> Option<&mut SimulatedRoom> {
        self.rooms.iter_mut().find(|room| room.address() == address)
    }

    /// Disconnect or reconnect the room at `address`.
    pub fn set_online(&mut self, address: u16, online: bool) {
        self.offline.retain(|addr| *addr != address);
        if !online {
            self.offline.push(address);
        }
    }

    /// Queue faults consumed one per point-to-point request.
    pub fn inject(&mut self, faults: impl IntoIterator<Item = Fault>) {
        self.faults.extend(faults);
    }

    pub fn pending_faults(&self) -> usize {
        self.faults.len()
    }

    /// Every frame the master put on the bus.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// Receive side, shared with anything that wants to watch replies.
    pub fn rx(&self) -> &RxBuffer {
        &self.rx
    }

    fn reply_bytes(&self, src: u16, reply: RoomReply) -> Vec<u8> {
        match reply {
            RoomReply::Silent => Vec::new(),
            RoomReply::Ack => vec![ACK],
            RoomReply::Nak => vec![NAK],
            RoomReply::Data(payload) => match encode(FrameKind::Data, self.master, src, payload) {
                Ok(frame) => {
                    let mut bytes = vec![ACK];
                    bytes.extend(frame.to_bytes());
                    bytes
                }
                Err(_) => vec![NAK],
            },
        }
    }

    fn dropped_by_noise(&mut self) -> bool {
        match self.noise.as_mut() {
            Some((rng, rate)) => rng.gen_bool(*rate),
            None => false,
        }
    }
}

impl BusTransport for SimulatedBus {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.sent.push(bytes.to_vec());
        let frame = match decode(bytes, None) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "rooms ignored an undecodable frame");
                return Ok(());
            }
        };

        if frame.dest == self.broadcast || frame.dest == self.group {
            for room in self.rooms.iter_mut() {
                if !self.offline.contains(&room.address()) {
                    room.handle(&frame);
                }
            }
            trace!(dest = frame.dest, rooms = self.rooms.len(), "broadcast delivered");
            return Ok(());
        }

        let fault = self.faults.pop_front();
        if fault == Some(Fault::SendError) {
            return Err(MessagingError::Closed("simulated write failure"));
        }
        if fault == Some(Fault::Silence) || self.offline.contains(&frame.dest) || self.dropped_by_noise() {
            return Ok(());
        }
        let Some(room) = self.rooms.iter_mut().find(|room| room.address() == frame.dest) else {
            return Ok(());
        };
        let src = room.address();
        let reply = room.handle(&frame);
        let mut reply = match fault {
            Some(Fault::Nak) => vec![NAK],
            _ => self.reply_bytes(src, reply),
        };
        if fault == Some(Fault::Corrupt) {
            match reply.len() {
                0 => {}
                1 => reply[0] = 0xFF,
                len => reply[len - 3] ^= 0x5A,
            }
        }
        if fault == Some(Fault::Truncate) && reply.len() > 1 {
            let keep = 1 + (reply.len() - 1) / 2;
            reply.truncate(keep);
        }
        self.rx.extend(&reply);
        Ok(())
    }

    fn bytes_available(&self) -> usize {
        self.rx.pending()
    }

    fn take_received(&mut self) -> Vec<u8> {
        self.rx.drain()
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
