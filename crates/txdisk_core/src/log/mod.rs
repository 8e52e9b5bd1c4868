//! The durable transaction log.
//!
//! The log is the only durability mechanism of the engine. It is a series
//! of numbered segment files; each entry is framed and checksummed (see
//! [`record`]). Entries are written by the group-commit [`DurableLog`]
//! and read back at boot through [`LogScanner`].

mod iterator;
mod record;
mod segments;
mod writer;

pub use iterator::{LogScanner, SegmentIterator};
pub use record::{
    compute_crc32, Effect, EntryType, LogEntry, QueuedEvent, CRC_SIZE, HEADER_SIZE, LOG_MAGIC, LOG_VERSION,
};
pub use segments::{LogOwner, SegmentTracker};
pub use writer::{DurableLog, LogOptions, PendingAppend};

use std::fmt;

/// Where an entry lives in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogPosition {
    /// Segment number.
    pub segment: u64,
    /// Byte offset of the frame within the segment.
    pub offset: u64,
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.segment, self.offset)
    }
}
