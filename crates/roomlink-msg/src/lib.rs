//! ---
//! rl_section: "02-bus-protocol"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Wire codec, opcode table and bus transport primitives."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod frame;
pub mod opcode;
pub mod record;
pub mod transport;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised by the wire layer that are not frame validation failures.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Frame could not be encoded or decoded.
    #[error("frame error: {0}")]
    Frame(#[from] frame::FrameError),
    /// A log record buffer had the wrong length.
    #[error("log record must be {expected} bytes, got {actual}")]
    RecordLength {
        /// Required record size.
        expected: usize,
        /// Length supplied by the caller.
        actual: usize,
    },
    /// Wrapper for IO errors raised by a physical transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The transport backend has shut down.
    #[error("transport closed: {0}")]
    Closed(&'static str),
}

pub use frame::{
    checksum, decode, encode, expected_len, AddressPair, Frame, FrameError, FrameKind, ACK,
    END_MARKER, FRAME_OVERHEAD, MAX_PAYLOAD, NAK,
};
pub use opcode::{ArgShape, CommandSpec, Opcode, ReplyShape};
pub use record::{BcdDateTime, LogEvent, LogRecord, RECORD_SIZE};
pub use transport::{BusTransport, InMemoryBus, RxBuffer};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_length_error_formats() {
        let err = MessagingError::RecordLength {
            expected: 16,
            actual: 3,
        };
        assert_eq!(format!("{err}"), "log record must be 16 bytes, got 3");
    }
}
