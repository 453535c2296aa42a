//! ---
//! rl_section: "02-bus-protocol"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Wire codec, opcode table and bus transport primitives."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Packet codec for the RS-485 frame format.
//!
//! ```text
//! B0      start marker: 0x01 (command frame) | 0x02 (bulk data frame)
//! B1..B2  destination address (u16, big-endian)
//! B3..B4  source address (u16, big-endian)
//! B5      payload length N
//! B6..    payload bytes [N]
//! B(6+N)  checksum high byte
//! B(7+N)  checksum low byte
//! B(8+N)  end marker: 0x04
//! ```
//!
//! Every decode failure is reported through [`FrameError`], and callers treat all of its
//! variants the same way they treat a reply that never arrived.

use serde::{Deserialize, Serialize};

/// Start marker of a command frame.
pub const START_COMMAND: u8 = 0x01;
/// Start marker of a bulk data frame.
pub const START_DATA: u8 = 0x02;
/// Frame terminator.
pub const END_MARKER: u8 = 0x04;
/// Positive acknowledgement byte.
pub const ACK: u8 = 0x06;
/// Negative acknowledgement byte.
pub const NAK: u8 = 0x15;
/// Largest payload a frame may carry.
pub const MAX_PAYLOAD: usize = 250;
/// Bytes preceding the payload.
pub const HEADER_LEN: usize = 6;
/// Header, checksum and terminator bytes around the payload.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + 3;

/// Validation failures raised while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Source or destination did not match the exchange in progress.
    #[error("address mismatch: expected {expected_src:#06x}->{expected_dest:#06x}, got {src:#06x}->{dest:#06x}")]
    AddressMismatch {
        /// Destination the exchange expected.
        expected_dest: u16,
        /// Source the exchange expected.
        expected_src: u16,
        /// Destination found on the wire.
        dest: u16,
        /// Source found on the wire.
        src: u16,
    },
    /// The transmitted checksum disagrees with the payload sum.
    #[error("checksum mismatch: frame carried {received:#06x}, payload sums to {computed:#06x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame.
        received: u16,
        /// Checksum computed over the received payload.
        computed: u16,
    },
    /// Fewer bytes than the declared frame length.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Total bytes the frame requires.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },
    /// Unknown start marker or missing terminator.
    #[error("invalid frame marker {0:#04x}")]
    InvalidMarker(u8),
    /// Payload exceeds [`MAX_PAYLOAD`].
    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLong(usize),
}

/// Frame start marker selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Request/reply frame carrying an opcode.
    Command,
    /// Bulk data frame carrying a transfer chunk.
    Data,
}

impl FrameKind {
    /// Wire value of the start marker.
    pub const fn marker(self) -> u8 {
        match self {
            FrameKind::Command => START_COMMAND,
            FrameKind::Data => START_DATA,
        }
    }

    /// Map a start marker back onto a frame kind.
    pub const fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            START_COMMAND => Some(FrameKind::Command),
            START_DATA => Some(FrameKind::Data),
            _ => None,
        }
    }
}

/// Source/destination pair a reply must carry to belong to the current exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPair {
    /// Expected destination (usually the master).
    pub dest: u16,
    /// Expected source (the polled unit).
    pub src: u16,
}

impl AddressPair {
    /// Pair expected on a reply from `unit` to `master`.
    pub const fn reply(master: u16, unit: u16) -> Self {
        Self {
            dest: master,
            src: unit,
        }
    }
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command or bulk data.
    pub kind: FrameKind,
    /// Destination address.
    pub dest: u16,
    /// Source address.
    pub src: u16,
    /// Payload bytes, at most [`MAX_PAYLOAD`].
    pub payload: Vec<u8>,
}

impl Frame {
    /// Payload length as carried in byte 5.
    pub fn length(&self) -> u8 {
        self.payload.len() as u8
    }

    /// Additive checksum over the payload.
    pub fn checksum(&self) -> u16 {
        checksum(&self.payload)
    }

    /// Total size on the wire.
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Serialize the frame into its wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.kind.marker());
        out.extend_from_slice(&self.dest.to_be_bytes());
        out.extend_from_slice(&self.src.to_be_bytes());
        out.push(self.length());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.checksum().to_be_bytes());
        out.push(END_MARKER);
        out
    }

    /// First payload byte, which carries the opcode on command frames.
    pub fn opcode_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Wrapping 16-bit sum of the payload bytes.
pub fn checksum(payload: &[u8]) -> u16 {
    payload
        .iter()
        .fold(0u16, |acc, byte| acc.wrapping_add(u16::from(*byte)))
}

/// Build a frame, computing its length and checksum.
pub fn encode(
    kind: FrameKind,
    dest: u16,
    src: u16,
    payload: impl Into<Vec<u8>>,
) -> Result<Frame, FrameError> {
    let payload = payload.into();
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLong(payload.len()));
    }
    Ok(Frame {
        kind,
        dest,
        src,
        payload,
    })
}

/// Total frame length once the header is present, `None` while fewer than
/// [`HEADER_LEN`] bytes have arrived.
pub fn expected_len(bytes: &[u8]) -> Result<Option<usize>, FrameError> {
    let Some(&marker) = bytes.first() else {
        return Ok(None);
    };
    if FrameKind::from_marker(marker).is_none() {
        return Err(FrameError::InvalidMarker(marker));
    }
    if bytes.len() < HEADER_LEN {
        return Ok(None);
    }
    let length = usize::from(bytes[5]);
    if length > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLong(length));
    }
    Ok(Some(FRAME_OVERHEAD + length))
}

/// Validate and decode a frame from the start of `bytes`.
///
/// Trailing bytes after the terminator are ignored. When `expect` is supplied the
/// addresses must match it exactly.
pub fn decode(bytes: &[u8], expect: Option<AddressPair>) -> Result<Frame, FrameError> {
    let needed = match expected_len(bytes)? {
        Some(total) => total,
        None => {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            })
        }
    };
    if bytes.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            available: bytes.len(),
        });
    }

    let kind = FrameKind::from_marker(bytes[0]).ok_or(FrameError::InvalidMarker(bytes[0]))?;
    let dest = u16::from_be_bytes([bytes[1], bytes[2]]);
    let src = u16::from_be_bytes([bytes[3], bytes[4]]);
    if let Some(expect) = expect {
        if expect.dest != dest || expect.src != src {
            return Err(FrameError::AddressMismatch {
                expected_dest: expect.dest,
                expected_src: expect.src,
                dest,
                src,
            });
        }
    }

    let length = usize::from(bytes[5]);
    let terminator = bytes[HEADER_LEN + length + 2];
    if terminator != END_MARKER {
        return Err(FrameError::InvalidMarker(terminator));
    }

    let payload = &bytes[HEADER_LEN..HEADER_LEN + length];
    let received = u16::from_be_bytes([bytes[HEADER_LEN + length], bytes[HEADER_LEN + length + 1]]);
    let computed = checksum(payload);
    if received != computed {
        return Err(FrameError::ChecksumMismatch { received, computed });
    }

    Ok(Frame {
        kind,
        dest,
        src,
        payload: payload.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_documented_layout() {
        let frame = encode(FrameKind::Command, 0x0102, 0x0001, vec![0xB2, 0x10]).unwrap();
        let bytes = frame.to_bytes();
        assert_eq!(
            bytes,
            vec![0x01, 0x01, 0x02, 0x00, 0x01, 0x02, 0xB2, 0x10, 0x00, 0xC2, 0x04]
        );
    }

    #[test]
    fn payload_round_trips_for_every_length() {
        for len in 0..=MAX_PAYLOAD {
            let payload: Vec<u8> = (0..len).map(|i| (i * 37 + 11) as u8).collect();
            let frame = encode(FrameKind::Data, 0x00AA, 0x0001, payload.clone()).unwrap();
            let decoded = decode(&frame.to_bytes(), Some(AddressPair::reply(0x00AA, 0x0001)))
                .unwrap_or_else(|err| panic!("length {len} failed: {err}"));
            assert_eq!(decoded.payload, payload);
            assert_eq!(decoded.kind, FrameKind::Data);
        }
    }

    #[test]
    fn rejects_oversized_payload() {
        let err = encode(FrameKind::Command, 1, 2, vec![0u8; MAX_PAYLOAD + 1]).unwrap_err();
        assert_eq!(err, FrameError::PayloadTooLong(MAX_PAYLOAD + 1));
    }

    #[test]
    fn detects_corrupted_checksum() {
        let mut bytes = encode(FrameKind::Command, 1, 2, vec![1, 2, 3])
            .unwrap()
            .to_bytes();
        bytes[7] ^= 0xFF;
        assert!(matches!(
            decode(&bytes, None),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn detects_address_mismatch() {
        let bytes = encode(FrameKind::Command, 0x0001, 0x0033, vec![ACK])
            .unwrap()
            .to_bytes();
        let err = decode(&bytes, Some(AddressPair::reply(0x0001, 0x0034))).unwrap_err();
        assert!(matches!(err, FrameError::AddressMismatch { src: 0x0033, .. }));
    }

    #[test]
    fn short_input_is_truncated() {
        let bytes = encode(FrameKind::Command, 1, 2, vec![9, 9, 9])
            .unwrap()
            .to_bytes();
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1], None),
            Err(FrameError::Truncated { .. })
        ));
        assert!(matches!(
            decode(&bytes[..3], None),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn missing_terminator_is_rejected() {
        let mut bytes = encode(FrameKind::Command, 1, 2, vec![5]).unwrap().to_bytes();
        let last = bytes.len() - 1;
        bytes[last] = 0x00;
        assert_eq!(decode(&bytes, None), Err(FrameError::InvalidMarker(0x00)));
    }

    #[test]
    fn expected_len_waits_for_header() {
        assert_eq!(expected_len(&[]), Ok(None));
        assert_eq!(expected_len(&[START_COMMAND, 0, 1]), Ok(None));
        assert_eq!(expected_len(&[START_DATA, 0, 1, 0, 2, 4]), Ok(Some(13)));
        assert_eq!(expected_len(&[0x55]), Err(FrameError::InvalidMarker(0x55)));
    }
}
