//! Error types shared by every disk implementation in this crate.

use thiserror::Error;

/// Unified error type for disk open, read, write and copy operations.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short write at offset {offset}: {written} of {expected} bytes. Disk full?")]
    ShortWrite {
        offset: u64,
        written: usize,
        expected: usize,
    },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("invalid extent geometry: {0}")]
    Geometry(String),

    #[error("corrupt grain data: {0}")]
    Integrity(String),

    /// Stream-optimized extents are append-only; a grain whose table entry
    /// is already set can never be rewritten.
    #[error("cannot update already written grain {0}")]
    AlreadyWritten(u64),

    #[error("disk copy failed: {0}")]
    Copy(String),

    /// `next_data` found no allocated grain at or after the requested offset.
    #[error("no data past requested offset")]
    NoData,

    #[error("operation not supported by this disk type: {0}")]
    Unsupported(&'static str),
}

/// Result alias using [`DiskError`].
pub type Result<T> = std::result::Result<T, DiskError>;
