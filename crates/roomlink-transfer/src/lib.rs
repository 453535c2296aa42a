//! ---
//! rl_section: "04-transfer"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Chunked transfer sessions, sender engine and slave-side receiver."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod engine;
pub mod receiver;
pub mod session;
pub mod source;

/// Result alias used throughout the transfer crate.
pub type Result<T> = std::result::Result<T, TransferError>;

/// Error type for transfer sessions.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Source holds no bytes.
    #[error("transfer source {0} is empty")]
    EmptySource(String),
    /// More chunks than the 16-bit sequence space allows.
    #[error("{bytes} bytes need {chunks} chunks, above the 65535 chunk limit")]
    TooLarge {
        /// Source size.
        bytes: usize,
        /// Chunks required.
        chunks: usize,
    },
    /// Chunk size of zero or too large for a frame.
    #[error("chunk size {0} outside 1..={max}", max = session::MAX_CHUNK_SIZE)]
    InvalidChunkSize(usize),
    /// Reading the source failed.
    #[error("source read failed: {0}")]
    Source(#[from] std::io::Error),
    /// Source returned fewer bytes than its declared size.
    #[error("source ended at offset {offset}, expected {expected} more bytes")]
    ShortRead {
        /// Offset of the short read.
        offset: usize,
        /// Bytes that were requested.
        expected: usize,
    },
    /// Operation requires an active session.
    #[error("no frame to send in state {0}")]
    NotActive(TransferState),
    /// Header payload could not be parsed.
    #[error("malformed transfer header: {0}")]
    MalformedHeader(String),
    /// Chunk payload could not be parsed.
    #[error("malformed chunk payload of {0} bytes")]
    MalformedChunk(usize),
    /// Chunk arrived without a session.
    #[error("chunk received with no transfer in progress")]
    NoSession,
    /// The sink refused the completed image.
    #[error("asset sink rejected image: {0}")]
    Sink(String),
    /// Frame encoding failed.
    #[error("frame error: {0}")]
    Frame(#[from] roomlink_msg::FrameError),
}

pub use engine::{PreparedFrame, TransferEngine, TransferProgress, TransferReport};
pub use receiver::{AssetSink, ChunkVerdict, HeaderInfo, MemorySink, TransferReceiver};
pub use session::{
    chunk_count, TransferKind, TransferSession, TransferSettings, TransferState, MAX_CHUNK_SIZE,
};
pub use source::{AssetSource, FileSource, MemorySource};
