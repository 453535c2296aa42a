//! ---
//! rl_section: "02-bus-protocol"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Wire codec, opcode table and bus transport primitives."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Sixteen byte log record shared by the EEPROM ring and the log list replies.

use std::fmt;

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::{MessagingError, Result};

/// Size of one encoded record.
pub const RECORD_SIZE: usize = 16;

/// Six BCD bytes in `yy mm dd hh mm ss` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BcdDateTime(pub [u8; 6]);

fn to_bcd(value: u32) -> u8 {
    (((value / 10) % 10) << 4 | (value % 10)) as u8
}

fn from_bcd(byte: u8) -> Option<u8> {
    let (hi, lo) = (byte >> 4, byte & 0x0F);
    (hi <= 9 && lo <= 9).then_some(hi * 10 + lo)
}

impl BcdDateTime {
    /// Build from decimal fields; the year is taken modulo 100.
    pub fn new(year: u32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> Self {
        Self([
            to_bcd(year % 100),
            to_bcd(month),
            to_bcd(day),
            to_bcd(hour),
            to_bcd(minute),
            to_bcd(second),
        ])
    }

    /// Parse twelve ASCII digits `YYMMDDhhmmss`.
    pub fn from_digits(digits: &str) -> Option<Self> {
        let bytes = digits.as_bytes();
        if bytes.len() != 12 || !bytes.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let mut out = [0u8; 6];
        for (slot, pair) in out.iter_mut().zip(bytes.chunks(2)) {
            *slot = ((pair[0] - b'0') << 4) | (pair[1] - b'0');
        }
        let parsed = Self(out);
        parsed.is_valid().then_some(parsed)
    }

    /// Wrap raw bytes as read from the wire or the store.
    pub const fn from_raw(raw: [u8; 6]) -> Self {
        Self(raw)
    }

    /// Decimal fields `[yy, mm, dd, hh, mm, ss]`, `None` if any nibble is not a digit.
    pub fn fields(&self) -> Option<[u8; 6]> {
        let mut out = [0u8; 6];
        for (slot, byte) in out.iter_mut().zip(self.0) {
            *slot = from_bcd(byte)?;
        }
        Some(out)
    }

    /// Calendar range check on top of the digit check.
    pub fn is_valid(&self) -> bool {
        match self.fields() {
            Some([_, month, day, hour, minute, second]) => {
                (1..=12).contains(&month)
                    && (1..=31).contains(&day)
                    && hour < 24
                    && minute < 60
                    && second < 60
            }
            None => false,
        }
    }
}

impl From<NaiveDateTime> for BcdDateTime {
    fn from(value: NaiveDateTime) -> Self {
        Self::new(
            value.year().rem_euclid(100) as u32,
            value.month(),
            value.day(),
            value.hour(),
            value.minute(),
            value.second(),
        )
    }
}

impl fmt::Display for BcdDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fields() {
            Some([yy, mo, dd, hh, mi, ss]) => write!(
                f,
                "20{yy:02}-{mo:02}-{dd:02} {hh:02}:{mi:02}:{ss:02}"
            ),
            None => write!(f, "invalid({})", hex::encode(self.0)),
        }
    }
}

/// Event payload before the store assigns a sequence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Event code.
    pub event_code: u8,
    /// Event subtype.
    pub event_type: u8,
    /// Group the originator belongs to.
    pub group: u8,
    /// Card serial or unit identifier.
    pub originator: [u8; 5],
    /// When the event happened.
    pub timestamp: BcdDateTime,
}

impl LogEvent {
    /// Originator identifier for an event raised about a bus unit.
    pub fn unit_originator(unit: u16) -> [u8; 5] {
        let [hi, lo] = unit.to_be_bytes();
        [hi, lo, 0, 0, 0]
    }

    /// Attach a sequence id.
    pub fn into_record(self, sequence: u16) -> LogRecord {
        LogRecord {
            sequence,
            event_code: self.event_code,
            event_type: self.event_type,
            group: self.group,
            originator: self.originator,
            timestamp: self.timestamp,
        }
    }
}

/// One stored or transmitted log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Sequence id; zero marks an unwritten slot and is never assigned.
    pub sequence: u16,
    /// Event code.
    pub event_code: u8,
    /// Event subtype.
    pub event_type: u8,
    /// Group the originator belongs to.
    pub group: u8,
    /// Card serial or unit identifier.
    pub originator: [u8; 5],
    /// When the event happened.
    pub timestamp: BcdDateTime,
}

impl LogRecord {
    /// Encode into the 16 byte layout.
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0..2].copy_from_slice(&self.sequence.to_be_bytes());
        out[2] = self.event_code;
        out[3] = self.event_type;
        out[4] = self.group;
        out[5..10].copy_from_slice(&self.originator);
        out[10..16].copy_from_slice(&self.timestamp.0);
        out
    }

    /// Decode from exactly [`RECORD_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_SIZE {
            return Err(MessagingError::RecordLength {
                expected: RECORD_SIZE,
                actual: bytes.len(),
            });
        }
        let mut originator = [0u8; 5];
        originator.copy_from_slice(&bytes[5..10]);
        let mut timestamp = [0u8; 6];
        timestamp.copy_from_slice(&bytes[10..16]);
        Ok(Self {
            sequence: u16::from_be_bytes([bytes[0], bytes[1]]),
            event_code: bytes[2],
            event_type: bytes[3],
            group: bytes[4],
            originator,
            timestamp: BcdDateTime(timestamp),
        })
    }

    /// Event part without the sequence id.
    pub fn event(&self) -> LogEvent {
        LogEvent {
            event_code: self.event_code,
            event_type: self.event_type,
            group: self.group,
            originator: self.originator,
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample() -> LogRecord {
        LogEvent {
            event_code: 0x31,
            event_type: 0x02,
            group: 7,
            originator: [0xDE, 0xAD, 0xBE, 0xEF, 0x01],
            timestamp: BcdDateTime::new(2024, 3, 9, 14, 5, 59),
        }
        .into_record(0x1234)
    }

    #[test]
    fn record_layout_matches_wire_order() {
        let bytes = sample().to_bytes();
        assert_eq!(&bytes[0..2], &[0x12, 0x34]);
        assert_eq!(&bytes[2..5], &[0x31, 0x02, 7]);
        assert_eq!(&bytes[5..10], &[0xDE, 0xAD, 0xBE, 0xEF, 0x01]);
        assert_eq!(&bytes[10..16], &[0x24, 0x03, 0x09, 0x14, 0x05, 0x59]);
        assert_eq!(LogRecord::from_bytes(&bytes).unwrap(), sample());
    }

    #[test]
    fn short_buffer_is_rejected() {
        let err = LogRecord::from_bytes(&[0u8; 15]).unwrap_err();
        assert!(matches!(
            err,
            MessagingError::RecordLength {
                expected: 16,
                actual: 15
            }
        ));
    }

    #[test]
    fn bcd_digits_parse_and_validate() {
        let parsed = BcdDateTime::from_digits("241231235958").unwrap();
        assert_eq!(parsed.0, [0x24, 0x12, 0x31, 0x23, 0x59, 0x58]);
        assert_eq!(parsed.to_string(), "2024-12-31 23:59:58");
        assert!(BcdDateTime::from_digits("241331235958").is_none());
        assert!(BcdDateTime::from_digits("2412312359").is_none());
        assert!(BcdDateTime::from_digits("24123123595x").is_none());
        assert!(!BcdDateTime::from_raw([0x2A, 1, 1, 0, 0, 0]).is_valid());
    }

    #[test]
    fn converts_from_chrono() {
        let when = NaiveDate::from_ymd_opt(2031, 7, 4)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        assert_eq!(
            BcdDateTime::from(when).0,
            [0x31, 0x07, 0x04, 0x08, 0x30, 0x00]
        );
    }
}
