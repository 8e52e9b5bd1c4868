//! Failure injection for the log and the managed tree.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use txdisk_core::log::Effect;
use txdisk_core::{FileStore, NodeKind, ResourcePath, TxError, TxResult};
use txdisk_storage::{SegmentStore, StorageBackend, StorageError, StorageResult};

/// Switches shared by a [`FaultySegmentStore`] and every segment it opens.
#[derive(Debug)]
pub struct LogFaults {
    fail_appends: AtomicBool,
    fail_syncs: AtomicBool,
    crash_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    tripped: AtomicBool,
}

impl Default for LogFaults {
    fn default() -> Self {
        Self {
            fail_appends: AtomicBool::new(false),
            fail_syncs: AtomicBool::new(false),
            crash_after_bytes: AtomicUsize::new(usize::MAX),
            bytes_written: AtomicUsize::new(0),
            tripped: AtomicBool::new(false),
        }
    }
}

impl LogFaults {
    /// Makes every append fail.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Makes every sync fail.
    pub fn set_fail_syncs(&self, fail: bool) {
        self.fail_syncs.store(fail, Ordering::SeqCst);
    }

    /// Lets `bytes` more bytes through, writes part of the append that
    /// crosses the limit and fails it and everything after.
    pub fn crash_after(&self, bytes: usize) {
        let written = self.bytes_written.load(Ordering::SeqCst);
        self.crash_after_bytes
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Clears every fault.
    pub fn reset(&self) {
        self.fail_appends.store(false, Ordering::SeqCst);
        self.fail_syncs.store(false, Ordering::SeqCst);
        self.crash_after_bytes.store(usize::MAX, Ordering::SeqCst);
        self.tripped.store(false, Ordering::SeqCst);
    }

    /// True once any injected fault fired.
    pub fn has_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    fn trip(&self, what: &str) -> StorageError {
        self.tripped.store(true, Ordering::SeqCst);
        debug!(what, "injected log fault");
        StorageError::Io(io::Error::other(format!("simulated {what} failure")))
    }
}

/// A segment store whose segments fail on command.
#[derive(Debug)]
pub struct FaultySegmentStore {
    inner: Arc<dyn SegmentStore>,
    faults: Arc<LogFaults>,
}

impl FaultySegmentStore {
    /// Wraps `inner`; the returned handle controls the faults.
    pub fn new(inner: Arc<dyn SegmentStore>) -> (Self, Arc<LogFaults>) {
        let faults = Arc::new(LogFaults::default());
        let store = Self {
            inner,
            faults: Arc::clone(&faults),
        };
        (store, faults)
    }
}

impl SegmentStore for FaultySegmentStore {
    fn list(&self) -> StorageResult<Vec<u64>> {
        self.inner.list()
    }

    fn open(&self, index: u64) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FaultyBackend {
            inner: self.inner.open(index)?,
            faults: Arc::clone(&self.faults),
        }))
    }

    fn remove(&self, index: u64) -> StorageResult<()> {
        self.inner.remove(index)
    }
}

struct FaultyBackend {
    inner: Box<dyn StorageBackend>,
    faults: Arc<LogFaults>,
}

impl StorageBackend for FaultyBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        if self.faults.fail_appends.load(Ordering::SeqCst) {
            return Err(self.faults.trip("append"));
        }
        let current = self.faults.bytes_written.fetch_add(data.len(), Ordering::SeqCst);
        let limit = self.faults.crash_after_bytes.load(Ordering::SeqCst);
        if current >= limit {
            return Err(self.faults.trip("append"));
        }
        if current + data.len() > limit {
            let partial = limit - current;
            if partial > 0 {
                let _ = self.inner.append(&data[..partial]);
            }
            return Err(self.faults.trip("partial append"));
        }
        self.inner.append(data)
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.faults.fail_syncs.load(Ordering::SeqCst) {
            return Err(self.faults.trip("sync"));
        }
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

/// A file store that refuses to apply effects while switched on.
///
/// Reads always pass through, so transactions run normally until commit.
#[derive(Debug)]
pub struct FailingFileStore {
    inner: Arc<dyn FileStore>,
    failing: AtomicBool,
    failures: AtomicUsize,
}

impl FailingFileStore {
    /// Wraps `inner`, initially failing if `failing` is set.
    pub fn new(inner: Arc<dyn FileStore>, failing: bool) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: AtomicBool::new(failing),
            failures: AtomicUsize::new(0),
        })
    }

    /// Switches failure on or off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of effects refused so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl FileStore for FailingFileStore {
    fn metadata(&self, path: &ResourcePath) -> TxResult<Option<NodeKind>> {
        self.inner.metadata(path)
    }

    fn read_at(&self, path: &ResourcePath, offset: u64, len: usize) -> TxResult<Vec<u8>> {
        self.inner.read_at(path, offset, len)
    }

    fn list(&self, path: &ResourcePath) -> TxResult<Vec<String>> {
        self.inner.list(path)
    }

    fn check_access(&self, path: &ResourcePath, write: bool) -> TxResult<()> {
        self.inner.check_access(path, write)
    }

    fn apply(&self, effect: &Effect) -> TxResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(TxError::Io(io::Error::other("simulated apply failure")));
        }
        self.inner.apply(effect)
    }

    fn sync(&self, paths: &[ResourcePath]) -> TxResult<()> {
        self.inner.sync(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txdisk_storage::MemorySegmentStore;

    #[test]
    fn crash_after_writes_partial_tail() {
        let memory = MemorySegmentStore::new();
        let (store, faults) = FaultySegmentStore::new(Arc::new(memory.clone()));
        let mut segment = store.open(1).unwrap();
        segment.append(b"abcd").unwrap();
        faults.crash_after(2);
        assert!(segment.append(b"efgh").is_err());
        assert!(faults.has_tripped());
        assert_eq!(memory.bytes(1).unwrap(), b"abcdef");
        assert!(segment.append(b"x").is_err());
    }

    #[test]
    fn sync_faults_can_be_cleared() {
        let (store, faults) = FaultySegmentStore::new(Arc::new(MemorySegmentStore::new()));
        let mut segment = store.open(1).unwrap();
        faults.set_fail_syncs(true);
        assert!(segment.sync().is_err());
        faults.reset();
        segment.sync().unwrap();
    }
}
