//! Error types for segment storage.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while reading or writing segments.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of a segment.
    #[error("read beyond end of segment: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current segment size.
        size: u64,
    },

    /// Truncation was asked to grow the segment.
    #[error("cannot truncate to {requested} bytes, segment holds {size}")]
    InvalidTruncate {
        /// Requested size.
        requested: u64,
        /// Current size.
        size: u64,
    },

    /// The segment does not exist in the store.
    #[error("segment {0} not found")]
    SegmentNotFound(u64),
}
