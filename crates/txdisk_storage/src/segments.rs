//! Numbered segment collections.
//!
//! A [`SegmentStore`] owns the set of numbered segments that make up the
//! transaction log. Segment numbers only grow; the engine opens a fresh
//! active segment at every boot and rotates to the next number once the
//! active one is full.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// File name prefix of segment files.
pub const SEGMENT_PREFIX: &str = "txlog_";

/// Returns the file name used for segment `index`.
#[must_use]
pub fn segment_file_name(index: u64) -> String {
    format!("{SEGMENT_PREFIX}{index:08}")
}

/// A numbered collection of log segments.
pub trait SegmentStore: Send + Sync + fmt::Debug {
    /// Lists the existing segment numbers in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated.
    fn list(&self) -> StorageResult<Vec<u64>>;

    /// Opens segment `index`, creating it empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be opened or created.
    fn open(&self, index: u64) -> StorageResult<Box<dyn StorageBackend>>;

    /// Removes segment `index`. Removing a missing segment is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment exists but cannot be removed.
    fn remove(&self, index: u64) -> StorageResult<()>;
}

/// Segments stored as `txlog_NNNNNNNN` files in one directory.
#[derive(Debug, Clone)]
pub struct DirSegmentStore {
    dir: PathBuf,
}

impl DirSegmentStore {
    /// Uses `dir` for segment files, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Returns the directory holding the segments.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of segment `index`.
    #[must_use]
    pub fn segment_path(&self, index: u64) -> PathBuf {
        self.dir.join(segment_file_name(index))
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> StorageResult<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> StorageResult<()> {
        Ok(())
    }
}

impl SegmentStore for DirSegmentStore {
    fn list(&self) -> StorageResult<Vec<u64>> {
        let mut indices = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(index) = name
                .strip_prefix(SEGMENT_PREFIX)
                .and_then(|n| n.parse::<u64>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    fn open(&self, index: u64) -> StorageResult<Box<dyn StorageBackend>> {
        let path = self.segment_path(index);
        let created = !path.exists();
        let backend = FileBackend::open(&path)?;
        if created {
            self.sync_dir()?;
            debug!(segment = index, path = %path.display(), "created log segment");
        }
        Ok(Box::new(backend))
    }

    fn remove(&self, index: u64) -> StorageResult<()> {
        let path = self.segment_path(index);
        match fs::remove_file(&path) {
            Ok(()) => {
                self.sync_dir()?;
                debug!(segment = index, "removed log segment");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// Segments kept in memory.
///
/// Clones share the same segments, so a test can halt an engine and boot a
/// new one over the log the first one left behind.
#[derive(Debug, Clone, Default)]
pub struct MemorySegmentStore {
    segments: Arc<Mutex<BTreeMap<u64, InMemoryBackend>>>,
}

impl MemorySegmentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a segment with the given raw bytes.
    pub fn insert(&self, index: u64, data: Vec<u8>) {
        self.segments
            .lock()
            .insert(index, InMemoryBackend::with_data(data));
    }

    /// Returns a copy of the bytes of segment `index`.
    #[must_use]
    pub fn bytes(&self, index: u64) -> Option<Vec<u8>> {
        self.segments.lock().get(&index).map(InMemoryBackend::data)
    }
}

impl SegmentStore for MemorySegmentStore {
    fn list(&self) -> StorageResult<Vec<u64>> {
        Ok(self.segments.lock().keys().copied().collect())
    }

    fn open(&self, index: u64) -> StorageResult<Box<dyn StorageBackend>> {
        let backend = self.segments.lock().entry(index).or_default().clone();
        Ok(Box::new(backend))
    }

    fn remove(&self, index: u64) -> StorageResult<()> {
        self.segments.lock().remove(&index);
        Ok(())
    }
}
