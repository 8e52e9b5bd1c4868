//! # txdisk storage
//!
//! Byte stores underneath the txdisk transaction log.
//!
//! The log is a sequence of numbered segments. Each segment is an
//! append-only byte store; this crate knows nothing about the entries the
//! engine writes into them. It provides:
//!
//! - [`StorageBackend`]: one append-only segment (read, append, sync, truncate)
//! - [`SegmentStore`]: the numbered collection of segments (list, open, remove)
//! - [`FileBackend`] / [`DirSegmentStore`]: segments as files in a directory
//! - [`InMemoryBackend`] / [`MemorySegmentStore`]: shared in-memory segments
//!   that outlive the engine instance that wrote them, for crash tests
//!
//! ## Example
//!
//! ```rust
//! use txdisk_storage::{MemorySegmentStore, SegmentStore};
//!
//! let store = MemorySegmentStore::new();
//! let mut segment = store.open(1).unwrap();
//! let offset = segment.append(b"entry").unwrap();
//! assert_eq!(offset, 0);
//! assert_eq!(store.list().unwrap(), vec![1]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod segments;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use segments::{segment_file_name, DirSegmentStore, MemorySegmentStore, SegmentStore, SEGMENT_PREFIX};
