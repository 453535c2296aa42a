//! ---
//! rl_section: "03-log-storage"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Non-volatile store abstraction and the circular event log."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
#![warn(missing_docs)]

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, LogError>;

/// Error type for the log allocator.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Append refused; the ring holds a record in every slot.
    #[error("log region full")]
    Full,
    /// Delete refused; the ring holds no records.
    #[error("log region empty")]
    Empty,
    /// The underlying device failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// Region placement does not fit the device.
    #[error("invalid log region geometry: {0}")]
    Geometry(String),
    /// A stored record could not be decoded.
    #[error("record decode error: {0}")]
    Record(#[from] roomlink_msg::MessagingError),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub mod layout;
pub mod log_ring;
pub mod metrics;
pub mod store;

pub use layout::{classify_scan, transition, FragmentationKind, RingError, RingOp, RingSpan};
pub use log_ring::{LogAllocator, LogRegion, Recovery, RegionGeometry};
pub use metrics::LogMetrics;
pub use store::{FileEeprom, GatedStore, MemoryEeprom, NvStore, StoreError};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_convert() {
        let err: LogError = StoreError::NotReady { polls: 3 }.into();
        assert_eq!(format!("{err}"), "store error: device not ready after 3 polls");
    }
}
