//! Failed transactions, redo after a crash and damaged logs.

mod common;

use common::{boot, config, read_all, write_file};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use txdisk_core::log::Effect;
use txdisk_core::{
    DiskStore, Engine, EngineParts, FileStore, NodeKind, ResourcePath, ThreadScheduler, TxError, TxResult,
};
use txdisk_storage::DirSegmentStore;

/// Disk store whose effect application can be switched off.
#[derive(Debug)]
struct SwitchableStore {
    inner: DiskStore,
    failing: AtomicBool,
}

impl SwitchableStore {
    fn new(root: PathBuf, failing: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: DiskStore::new(root).unwrap(),
            failing: AtomicBool::new(failing),
        })
    }
}

impl FileStore for SwitchableStore {
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
            return Err(TxError::Io(io::Error::other("disk unavailable")));
        }
        self.inner.apply(effect)
    }

    fn sync(&self, paths: &[ResourcePath]) -> TxResult<()> {
        self.inner.sync(paths)
    }
}

fn boot_on(dir: &Path, store: Arc<SwitchableStore>) -> Engine {
    let parts = EngineParts {
        segments: Arc::new(DirSegmentStore::new(&dir.join("logs")).unwrap()),
        files: store,
        scheduler: Arc::new(ThreadScheduler),
    };
    Engine::boot_with(config(dir), parts).unwrap()
}

fn newest_segment(dir: &Path) -> PathBuf {
    let mut segments: Vec<_> = fs::read_dir(dir.join("logs"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    segments.sort();
    segments.pop().unwrap()
}

#[test]
fn failed_commit_holds_locks_until_declared_complete() {
    let dir = tempdir().unwrap();
    let engine = boot_on(dir.path(), SwitchableStore::new(dir.path().join("data"), true));
    engine.wait_for_bootup(Duration::from_secs(5)).unwrap();

    let session = engine.create_session().unwrap();
    session.create_file("/stuck", false).unwrap();
    let ident = match session.commit() {
        Err(TxError::TransactionFailed { id, .. }) => id,
        other => panic!("expected a failed commit, got {other:?}"),
    };
    assert_eq!(engine.failed_transactions(), vec![ident.clone()]);

    let other = engine.create_session().unwrap();
    assert!(matches!(other.file_exists("/stuck", false), Err(TxError::LockingTimedOut(_))));

    engine.declare_transaction_complete(&ident).unwrap();
    assert!(engine.failed_transactions().is_empty());
    assert!(!other.file_exists("/stuck", false).unwrap());
    other.commit().unwrap();
    assert!(matches!(
        engine.declare_transaction_complete(&ident),
        Err(TxError::InvalidArgument { .. })
    ));
    engine.shutdown();
}

#[test]
fn committed_work_is_redone_after_crash() {
    let dir = tempdir().unwrap();
    {
        let engine = boot_on(dir.path(), SwitchableStore::new(dir.path().join("data"), true));
        let session = engine.create_session().unwrap();
        session.create_file("/docs", true).unwrap();
        write_file(&session, "/docs/report", b"durable");
        assert!(matches!(session.commit(), Err(TxError::TransactionFailed { .. })));
        engine.halt();
    }

    let engine = boot(dir.path());
    assert!(engine.failed_transactions().is_empty());
    let session = engine.create_session().unwrap();
    assert_eq!(read_all(&session, "/docs/report"), b"durable");
    session.commit().unwrap();
    engine.shutdown();
}

#[test]
fn failed_redo_gates_new_work() {
    let dir = tempdir().unwrap();
    {
        let engine = boot_on(dir.path(), SwitchableStore::new(dir.path().join("data"), true));
        let session = engine.create_session().unwrap();
        session.create_file("/blocked", false).unwrap();
        assert!(session.commit().is_err());
        engine.halt();
    }

    let engine = boot_on(dir.path(), SwitchableStore::new(dir.path().join("data"), true));
    assert!(matches!(
        engine.wait_for_bootup(Duration::from_millis(100)),
        Err(TxError::RecoveryInProgress)
    ));
    assert!(matches!(engine.create_session(), Err(TxError::RecoveryInProgress)));

    let failed = engine.failed_transactions();
    assert_eq!(failed.len(), 1);
    engine.declare_transaction_complete(&failed[0]).unwrap();
    engine.wait_for_bootup(Duration::from_secs(1)).unwrap();
    engine.create_session().unwrap().commit().unwrap();
    engine.shutdown();
}

#[test]
fn torn_tail_is_ignored() {
    let dir = tempdir().unwrap();
    {
        let engine = boot(dir.path());
        let session = engine.create_session().unwrap();
        session.create_file("/survivor", false).unwrap();
        session.commit().unwrap();
        engine.shutdown();
    }
    let mut segment = OpenOptions::new().append(true).open(newest_segment(dir.path())).unwrap();
    segment.write_all(b"TXLG").unwrap();
    drop(segment);

    let engine = boot(dir.path());
    let session = engine.create_session().unwrap();
    assert!(session.file_exists("/survivor", false).unwrap());
    session.commit().unwrap();
    engine.shutdown();
}

#[test]
fn corrupt_log_fails_boot() {
    let dir = tempdir().unwrap();
    {
        let engine = boot(dir.path());
        let session = engine.create_session().unwrap();
        session.create_file("/x", false).unwrap();
        session.commit().unwrap();
        engine.shutdown();
    }
    let mut segment = OpenOptions::new().append(true).open(newest_segment(dir.path())).unwrap();
    segment.write_all(&[0xAB; 32]).unwrap();
    drop(segment);

    assert!(matches!(Engine::boot(config(dir.path())), Err(TxError::LogCorruption { .. })));
}
