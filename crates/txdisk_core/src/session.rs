//! Sessions: the client-facing handle on one transaction.
//!
//! Every file operation follows the same pattern: check permissions,
//! take the locks the operation needs, then consult or change the
//! transaction's workspace. Locks taken by an operation that fails are
//! released again; locks the transaction held before stay.

use crate::engine::EngineShared;
use crate::error::{TxError, TxResult};
use crate::lock::LockManager;
use crate::path::ResourcePath;
use crate::store::FileStore;
use crate::transaction::{Transaction, TransactionManager, TransactionState};
use crate::types::{LockMode, TransactionId, TransactionIdentifier};
use crate::workspace::{StreamKind, Workspace};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How a session's transactions are completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// The session commits and rolls back its own transaction.
    Local,
    /// An external transaction manager drives the transaction through
    /// [`XaResource`](crate::xa::XaResource).
    Xa,
}

#[derive(Debug)]
struct SessionState {
    tx: Option<Arc<Transaction>>,
    lock_wait: Duration,
    timeout: Duration,
    publish_events: bool,
}

/// Locks taken by one operation, so a failure can undo exactly those.
struct OpLocks<'a> {
    locks: &'a LockManager,
    tx: TransactionId,
    wait: Duration,
    acquired: Vec<ResourcePath>,
    upgraded: Vec<ResourcePath>,
    pinned: Vec<ResourcePath>,
}

impl<'a> OpLocks<'a> {
    fn new(locks: &'a LockManager, tx: TransactionId, wait: Duration) -> Self {
        Self {
            locks,
            tx,
            wait,
            acquired: Vec::new(),
            upgraded: Vec::new(),
            pinned: Vec::new(),
        }
    }

    fn lock(&mut self, path: &ResourcePath, mode: LockMode) -> TxResult<()> {
        match self.locks.acquire(self.tx, path, mode, self.wait)? {
            crate::lock::LockGrant::Acquired => self.acquired.push(path.clone()),
            crate::lock::LockGrant::Upgraded => self.upgraded.push(path.clone()),
            crate::lock::LockGrant::AlreadyHeld => {}
        }
        Ok(())
    }

    fn pin(&mut self, dir: &ResourcePath) -> TxResult<()> {
        if self.locks.holders(dir).pin == Some(self.tx) {
            return Ok(());
        }
        self.locks.acquire_pin(self.tx, dir)?;
        self.pinned.push(dir.clone());
        Ok(())
    }

    fn undo(self) {
        for dir in &self.pinned {
            self.locks.release_pin(self.tx, dir);
        }
        for path in &self.upgraded {
            self.locks.downgrade(self.tx, path);
        }
        for path in &self.acquired {
            self.locks.release(self.tx, path);
        }
    }
}

fn parse(path: impl AsRef<str>) -> TxResult<ResourcePath> {
    ResourcePath::parse(path.as_ref())
}

fn parent_of(path: &ResourcePath) -> TxResult<ResourcePath> {
    path.parent()
        .ok_or_else(|| TxError::invalid_argument("the root cannot be created, moved or removed"))
}

/// A client session bound to at most one transaction at a time.
///
/// A local session starts its transaction when it is created and is
/// finished by [`commit`](Self::commit) or [`rollback`](Self::rollback);
/// after that every operation fails with
/// [`TxError::NoTransactionAssociated`]. An XA session gets its
/// transaction from [`XaResource::start`](crate::xa::XaResource::start).
pub struct Session {
    engine: Arc<EngineShared>,
    kind: SessionKind,
    state: Mutex<SessionState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("kind", &self.kind)
            .field("transaction", &self.transaction_id())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn with_kind(engine: Arc<EngineShared>, kind: SessionKind, publish_events: bool) -> Self {
        let state = SessionState {
            tx: None,
            lock_wait: engine.config.lock_wait_timeout,
            timeout: engine.config.transaction_timeout,
            publish_events,
        };
        Self {
            engine,
            kind,
            state: Mutex::new(state),
        }
    }

    /// Opens a local session and starts its transaction.
    pub(crate) fn local(engine: Arc<EngineShared>, publish_events: bool, dequeue: Option<u64>) -> TxResult<Self> {
        let session = Self::with_kind(engine, SessionKind::Local, publish_events);
        let timeout = session.engine.config.transaction_timeout;
        let tx = session.engine.manager.begin(None, timeout, publish_events, dequeue)?;
        session.state.lock().tx = Some(tx);
        Ok(session)
    }

    /// Opens an XA session with no transaction.
    pub(crate) fn xa(engine: Arc<EngineShared>) -> Self {
        Self::with_kind(engine, SessionKind::Xa, false)
    }

    pub(crate) fn engine(&self) -> &Arc<EngineShared> {
        &self.engine
    }

    pub(crate) fn bind(&self, tx: Option<Arc<Transaction>>) {
        self.state.lock().tx = tx;
    }

    pub(crate) fn bound(&self) -> Option<Arc<Transaction>> {
        self.state.lock().tx.clone()
    }

    /// Whether this is a local or an XA session.
    #[must_use]
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Identifier of the current transaction, if any.
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionIdentifier> {
        self.state.lock().tx.as_ref().map(|tx| tx.ident().clone())
    }

    /// Sets how long lock requests wait. Zero waits indefinitely.
    pub fn set_lock_wait_timeout(&self, wait: Duration) {
        self.state.lock().lock_wait = wait;
    }

    /// Current lock wait timeout.
    #[must_use]
    pub fn lock_wait_timeout(&self) -> Duration {
        self.state.lock().lock_wait
    }

    /// Sets the transaction timeout in seconds, restarting the clock of
    /// the current transaction. Zero restores the configured default.
    pub fn set_transaction_timeout(&self, seconds: u32) {
        let timeout = if seconds == 0 {
            self.engine.config.transaction_timeout
        } else {
            Duration::from_secs(u64::from(seconds))
        };
        let mut state = self.state.lock();
        state.timeout = timeout;
        if let Some(tx) = &state.tx {
            tx.set_timeout(timeout);
        }
    }

    /// Current transaction timeout.
    #[must_use]
    pub fn transaction_timeout(&self) -> Duration {
        self.state.lock().timeout
    }

    /// Turns event publication on or off for the changes committed by
    /// this session.
    pub fn set_publish_events(&self, publish: bool) {
        let mut state = self.state.lock();
        state.publish_events = publish;
        if let Some(tx) = &state.tx {
            tx.set_publish_events(publish);
        }
    }

    /// Whether committed changes raise events.
    #[must_use]
    pub fn publishes_events(&self) -> bool {
        self.state.lock().publish_events
    }

    fn current(&self) -> TxResult<(Arc<Transaction>, Duration)> {
        let state = self.state.lock();
        let tx = state.tx.clone().ok_or(TxError::NoTransactionAssociated)?;
        Ok((tx, state.lock_wait))
    }

    /// Runs one operation under the transaction's operation lock.
    fn run<T>(
        &self,
        op: impl FnOnce(&mut OpLocks<'_>, &mut Workspace, &dyn FileStore) -> TxResult<T>,
    ) -> TxResult<T> {
        self.engine.check_available()?;
        let (tx, wait) = self.current()?;
        let mut work = tx.work();
        if tx.state() != TransactionState::Active || tx.forced_cause().is_some() {
            return Err(TransactionManager::ended_error(&tx));
        }
        let manager = &self.engine.manager;
        let mut locks = OpLocks::new(manager.locks(), tx.id(), wait);
        match op(&mut locks, &mut work.workspace, manager.store().as_ref()) {
            Ok(value) => Ok(value),
            Err(err) => {
                locks.undo();
                Err(match (err, tx.forced_cause()) {
                    (TxError::Interrupted(_), Some(cause)) => TxError::TransactionRolledBack { cause },
                    (err, _) => err,
                })
            }
        }
    }

    /// Creates a file or directory. The parent must exist.
    ///
    /// # Errors
    ///
    /// [`TxError::FileAlreadyExists`], [`TxError::FileNotExists`] for a
    /// missing parent, plus permission and locking errors.
    pub fn create_file(&self, path: impl AsRef<str>, is_directory: bool) -> TxResult<()> {
        let path = parse(path)?;
        let parent = parent_of(&path)?;
        self.run(|locks, ws, store| {
            store.check_access(&parent, true)?;
            locks.lock(&path, LockMode::Exclusive)?;
            ws.create(store, &path, is_directory)
        })
    }

    /// Deletes a file or an empty directory.
    ///
    /// # Errors
    ///
    /// [`TxError::FileNotExists`], [`TxError::DirectoryNotEmpty`],
    /// [`TxError::FileUnderUse`], plus permission and locking errors.
    pub fn delete_file(&self, path: impl AsRef<str>) -> TxResult<()> {
        let path = parse(path)?;
        let parent = parent_of(&path)?;
        self.run(|locks, ws, store| {
            store.check_access(&parent, true)?;
            // pin conflicts never wait, so pin before locking
            if ws.exists(store, &path)? == Some(true) {
                locks.pin(&path)?;
            }
            locks.lock(&path, LockMode::Exclusive)?;
            ws.delete(store, &path).map(|_| ())
        })
    }

    /// Copies a file.
    ///
    /// # Errors
    ///
    /// [`TxError::FileNotExists`], [`TxError::FileAlreadyExists`],
    /// [`TxError::InvalidArgument`] for a directory source, plus
    /// permission and locking errors.
    pub fn copy_file(&self, source: impl AsRef<str>, destination: impl AsRef<str>) -> TxResult<()> {
        let source = parse(source)?;
        let destination = parse(destination)?;
        let dst_parent = parent_of(&destination)?;
        self.run(|locks, ws, store| {
            store.check_access(&source, false)?;
            store.check_access(&dst_parent, true)?;
            locks.lock(&source, LockMode::Shared)?;
            locks.lock(&destination, LockMode::Exclusive)?;
            ws.copy(store, &source, &destination)
        })
    }

    /// Moves a file or directory tree.
    ///
    /// # Errors
    ///
    /// [`TxError::FileNotExists`], [`TxError::FileAlreadyExists`],
    /// [`TxError::FileUnderUse`], [`TxError::InvalidArgument`] when moving
    /// a directory into itself, plus permission and locking errors.
    pub fn move_file(&self, source: impl AsRef<str>, destination: impl AsRef<str>) -> TxResult<()> {
        let source = parse(source)?;
        let destination = parse(destination)?;
        let src_parent = parent_of(&source)?;
        let dst_parent = parent_of(&destination)?;
        self.run(|locks, ws, store| {
            store.check_access(&src_parent, true)?;
            store.check_access(&dst_parent, true)?;
            if ws.exists(store, &source)? == Some(true) && !destination.starts_with(&source) {
                locks.pin(&source)?;
                locks.pin(&destination)?;
            }
            locks.lock(&source, LockMode::Exclusive)?;
            locks.lock(&destination, LockMode::Exclusive)?;
            ws.move_path(store, &source, &destination).map(|_| ())
        })
    }

    /// Shrinks a file to `length` bytes.
    ///
    /// # Errors
    ///
    /// [`TxError::InvalidArgument`] if `length` exceeds the file length,
    /// [`TxError::FileNotExists`], plus permission and locking errors.
    pub fn truncate_file(&self, path: impl AsRef<str>, length: u64) -> TxResult<()> {
        let path = parse(path)?;
        self.run(|locks, ws, store| {
            store.check_access(&path, true)?;
            locks.lock(&path, LockMode::Exclusive)?;
            ws.truncate(store, &path, length)
        })
    }

    /// True if the path exists.
    ///
    /// # Errors
    ///
    /// Permission and locking errors.
    pub fn file_exists(&self, path: impl AsRef<str>, exclusive: bool) -> TxResult<bool> {
        let path = parse(path)?;
        self.run(|locks, ws, store| {
            store.check_access(&path, false)?;
            locks.lock(&path, LockMode::from_exclusive(exclusive))?;
            Ok(ws.exists(store, &path)?.is_some())
        })
    }

    /// True if the path exists and is a directory.
    ///
    /// # Errors
    ///
    /// Permission and locking errors.
    pub fn file_exists_and_is_directory(&self, path: impl AsRef<str>, exclusive: bool) -> TxResult<bool> {
        let path = parse(path)?;
        self.run(|locks, ws, store| {
            store.check_access(&path, false)?;
            locks.lock(&path, LockMode::from_exclusive(exclusive))?;
            Ok(ws.exists(store, &path)? == Some(true))
        })
    }

    /// Sorted names of a directory's entries.
    ///
    /// Only the directory itself is locked; entries created by others
    /// after the listing may appear later.
    ///
    /// # Errors
    ///
    /// [`TxError::FileNotExists`], [`TxError::InvalidArgument`] for a
    /// file, plus permission and locking errors.
    pub fn list_files(&self, path: impl AsRef<str>) -> TxResult<Vec<String>> {
        let path = parse(path)?;
        self.run(|locks, ws, store| {
            store.check_access(&path, false)?;
            locks.lock(&path, LockMode::Shared)?;
            ws.list(store, &path)
        })
    }

    /// Length of a file.
    ///
    /// # Errors
    ///
    /// [`TxError::FileNotExists`], [`TxError::InvalidArgument`] for a
    /// directory, plus permission and locking errors.
    pub fn file_length(&self, path: impl AsRef<str>, exclusive: bool) -> TxResult<u64> {
        let path = parse(path)?;
        self.run(|locks, ws, store| {
            store.check_access(&path, false)?;
            locks.lock(&path, LockMode::from_exclusive(exclusive))?;
            ws.length(store, &path)
        })
    }

    /// Opens a file for reading the transaction's view of it.
    ///
    /// # Errors
    ///
    /// [`TxError::FileNotExists`], [`TxError::InvalidArgument`] for a
    /// directory, plus permission and locking errors.
    pub fn open_input_stream(&self, path: impl AsRef<str>, exclusive: bool) -> TxResult<InputStream> {
        let path = parse(path)?;
        let id = self.run(|locks, ws, store| {
            store.check_access(&path, false)?;
            locks.lock(&path, LockMode::from_exclusive(exclusive))?;
            ws.open_stream(store, &path, StreamKind::Input)
        })?;
        let (tx, _) = self.current()?;
        Ok(InputStream {
            handle: StreamHandle::new(tx, Arc::clone(self.engine.manager.store()), path, id),
            position: 0,
        })
    }

    /// Opens a file for appending.
    ///
    /// `heavy_write` is a hint for large writes; two output streams on
    /// the same file must agree on it.
    ///
    /// # Errors
    ///
    /// [`TxError::FileUnderUse`] on a conflicting output stream, plus the
    /// errors of [`open_input_stream`](Self::open_input_stream).
    pub fn open_output_stream(&self, path: impl AsRef<str>, heavy_write: bool) -> TxResult<OutputStream> {
        let path = parse(path)?;
        let id = self.run(|locks, ws, store| {
            store.check_access(&path, true)?;
            locks.lock(&path, LockMode::Exclusive)?;
            ws.open_stream(store, &path, StreamKind::Output { heavy_write })
        })?;
        let (tx, _) = self.current()?;
        Ok(OutputStream {
            handle: StreamHandle::new(tx, Arc::clone(self.engine.manager.store()), path, id),
        })
    }

    fn require_local(&self) -> TxResult<()> {
        if self.kind == SessionKind::Xa {
            return Err(TxError::invalid_argument(
                "an XA session's transaction is completed through its XA resource",
            ));
        }
        Ok(())
    }

    /// Commits the session's transaction.
    ///
    /// # Errors
    ///
    /// - [`TxError::InvalidArgument`] for an XA session.
    /// - [`TxError::NoTransactionAssociated`] or
    ///   [`TxError::TransactionRolledBack`] if there is nothing to commit.
    /// - [`TxError::TransactionFailed`] if the commit could not complete.
    pub fn commit(&self) -> TxResult<()> {
        self.require_local()?;
        self.engine.check_available()?;
        let (tx, _) = self.current()?;
        let events = {
            let mut work = tx.work();
            self.engine.manager.commit_one_phase(&tx, &mut work)?
        };
        debug!(ident = %tx.ident(), "session committed");
        self.engine.events.enqueue(events);
        Ok(())
    }

    /// Rolls back the session's transaction.
    ///
    /// # Errors
    ///
    /// - [`TxError::InvalidArgument`] for an XA session.
    /// - [`TxError::NoTransactionAssociated`] or
    ///   [`TxError::TransactionRolledBack`] if it already ended.
    pub fn rollback(&self) -> TxResult<()> {
        self.require_local()?;
        let (tx, _) = self.current()?;
        let mut work = tx.work();
        self.engine.manager.rollback(&tx, &mut work)
    }
}

/// What both stream types share: the transaction, the path and the
/// stream's registration in the workspace.
struct StreamHandle {
    tx: Arc<Transaction>,
    store: Arc<dyn FileStore>,
    path: ResourcePath,
    id: u64,
    closed: bool,
}

impl StreamHandle {
    fn new(tx: Arc<Transaction>, store: Arc<dyn FileStore>, path: ResourcePath, id: u64) -> Self {
        Self {
            tx,
            store,
            path,
            id,
            closed: false,
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Workspace, &dyn FileStore) -> TxResult<T>) -> TxResult<T> {
        if self.closed {
            return Err(TxError::ClosedStream);
        }
        let mut work = self.tx.work();
        if self.tx.state() != TransactionState::Active || self.tx.forced_cause().is_some() {
            return Err(TransactionManager::ended_error(&self.tx));
        }
        if !work.workspace.is_stream_open(self.id) {
            return Err(TxError::ClosedStream);
        }
        f(&mut work.workspace, self.store.as_ref())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.tx.work().workspace.close_stream(self.id);
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn to_io(err: TxError) -> io::Error {
    match err {
        TxError::Io(err) => err,
        other => io::Error::other(other),
    }
}

/// Reads a file as the owning transaction sees it.
pub struct InputStream {
    handle: StreamHandle,
    position: u64,
}

impl fmt::Debug for InputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputStream")
            .field("path", &self.handle.path)
            .field("position", &self.position)
            .finish()
    }
}

impl InputStream {
    /// Path being read.
    #[must_use]
    pub fn path(&self) -> &ResourcePath {
        &self.handle.path
    }

    /// Current offset.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes left before the end of the file.
    ///
    /// # Errors
    ///
    /// [`TxError::ClosedStream`] or the transaction's end.
    pub fn available(&self) -> TxResult<u64> {
        let position = self.position;
        let path = &self.handle.path;
        self.handle
            .with(|ws, store| Ok(ws.length(store, path)?.saturating_sub(position)))
    }

    /// Advances by up to `n` bytes, returning how far it moved.
    ///
    /// # Errors
    ///
    /// As for [`available`](Self::available).
    pub fn skip(&mut self, n: u64) -> TxResult<u64> {
        let skipped = self.available()?.min(n);
        self.position += skipped;
        Ok(skipped)
    }

    /// Reads into `buf`, returning the count; zero at the end.
    ///
    /// # Errors
    ///
    /// As for [`available`](Self::available).
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> TxResult<usize> {
        let position = self.position;
        let path = &self.handle.path;
        let data = self
            .handle
            .with(|ws, store| ws.read(store, path, position, buf.len()))?;
        buf[..data.len()].copy_from_slice(&data);
        self.position += data.len() as u64;
        Ok(data.len())
    }

    /// Closes the stream.
    pub fn close(&mut self) {
        self.handle.close();
    }
}

impl io::Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_bytes(buf).map_err(to_io)
    }
}

/// Appends to a file inside the owning transaction.
///
/// Written bytes are staged in the workspace; [`flush`](io::Write::flush)
/// makes nothing durable. Commit closes every open output stream.
pub struct OutputStream {
    handle: StreamHandle,
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("path", &self.handle.path)
            .finish()
    }
}

impl OutputStream {
    /// Path being written.
    #[must_use]
    pub fn path(&self) -> &ResourcePath {
        &self.handle.path
    }

    /// Appends all of `data`.
    ///
    /// # Errors
    ///
    /// [`TxError::ClosedStream`] or the transaction's end.
    pub fn write_bytes(&mut self, data: &[u8]) -> TxResult<()> {
        let path = &self.handle.path;
        self.handle.with(|ws, store| ws.append(store, path, data))
    }

    /// Checks the stream is still usable.
    ///
    /// # Errors
    ///
    /// As for [`write_bytes`](Self::write_bytes).
    pub fn flush_bytes(&mut self) -> TxResult<()> {
        self.handle.with(|_, _| Ok(()))
    }

    /// Closes the stream.
    pub fn close(&mut self) {
        self.handle.close();
    }
}

impl io::Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(to_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_bytes().map_err(to_io)
    }
}
