//! Transaction manager.

use super::registry::TransactionRegistry;
use super::state::{Transaction, TransactionState, TransactionWork};
use crate::error::{TxError, TxResult};
use crate::events::FileStateChangeEvent;
use crate::lock::{LockManager, WaitInterrupt};
use crate::log::{DurableLog, Effect, LogEntry, LogOwner, QueuedEvent};
use crate::path::ResourcePath;
use crate::scheduler::WorkScheduler;
use crate::store::FileStore;
use crate::types::{RollbackCause, TransactionId, TransactionIdentifier, Xid};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Outcome of a prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    /// The branch is prepared and can be committed.
    Ok,
    /// The branch changed nothing and is already finished.
    ReadOnly,
}

/// Starting values for the id counters, taken from the log at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdCounters {
    /// Next internal sequence number.
    pub next_transaction: u64,
    /// Next local identifier.
    pub next_local: u64,
    /// Next event id.
    pub next_event: u64,
}

impl Default for IdCounters {
    fn default() -> Self {
        Self {
            next_transaction: 1,
            next_local: 1,
            next_event: 1,
        }
    }
}

/// Drives transactions through their lifecycle.
///
/// Every method that changes a transaction expects the caller to hold
/// the transaction's operation lock and pass the guarded
/// [`TransactionWork`] in.
///
/// Commit order for a transaction that changed something:
///
/// 1. the decision (with any events) is appended and synced;
/// 2. effects are applied to the file store, with checkpoints around moves;
/// 3. touched paths are synced and `Completed` is appended;
/// 4. log references and locks are released.
///
/// A failure in steps 1 to 3 leaves the transaction FAILED, holding its
/// locks, until it is declared complete.
pub struct TransactionManager {
    locks: Arc<LockManager>,
    log: Arc<DurableLog>,
    store: Arc<dyn FileStore>,
    scheduler: Arc<dyn WorkScheduler>,
    registry: TransactionRegistry,
    next_transaction: AtomicU64,
    next_local: AtomicU64,
    next_event: AtomicU64,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("transactions", &self.registry.len())
            .field("failed", &self.registry.failed_count())
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    /// Creates a transaction manager.
    pub fn new(
        locks: Arc<LockManager>,
        log: Arc<DurableLog>,
        store: Arc<dyn FileStore>,
        scheduler: Arc<dyn WorkScheduler>,
        counters: IdCounters,
    ) -> Self {
        Self {
            locks,
            log,
            store,
            scheduler,
            registry: TransactionRegistry::new(),
            next_transaction: AtomicU64::new(counters.next_transaction),
            next_local: AtomicU64::new(counters.next_local),
            next_event: AtomicU64::new(counters.next_event),
        }
    }

    /// The lock manager.
    #[must_use]
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// The durable log.
    #[must_use]
    pub fn log(&self) -> &Arc<DurableLog> {
        &self.log
    }

    /// The committed file tree.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    /// Live and failed transactions.
    #[must_use]
    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    /// Starts a transaction: a global branch when `xid` is given,
    /// otherwise a local one.
    ///
    /// # Errors
    ///
    /// [`TxError::InvalidArgument`] if the branch already exists.
    pub fn begin(
        &self,
        xid: Option<Xid>,
        timeout: Duration,
        publish_events: bool,
        dequeue: Option<u64>,
    ) -> TxResult<Arc<Transaction>> {
        let ident = match xid {
            Some(xid) => TransactionIdentifier::Global(xid),
            None => TransactionIdentifier::Local(self.next_local.fetch_add(1, Ordering::SeqCst)),
        };
        let id = self.allocate_id();
        let tx = Arc::new(Transaction::new(id, ident, timeout, publish_events, dequeue));
        if !self.registry.insert(Arc::clone(&tx)) {
            return Err(TxError::invalid_argument(format!(
                "transaction {} already exists",
                tx.ident()
            )));
        }
        debug!(%id, ident = %tx.ident(), "transaction started");
        Ok(tx)
    }

    /// Registers a transaction rebuilt by recovery.
    pub(crate) fn adopt(&self, tx: Arc<Transaction>) {
        if !self.registry.insert(Arc::clone(&tx)) {
            warn!(ident = %tx.ident(), "recovered transaction registered twice");
        }
    }

    pub(crate) fn allocate_id(&self) -> TransactionId {
        TransactionId::new(self.next_transaction.fetch_add(1, Ordering::SeqCst))
    }

    /// The error a caller gets for a transaction that is no longer active.
    #[must_use]
    pub fn ended_error(tx: &Transaction) -> TxError {
        match tx.forced_cause() {
            Some(cause) => TxError::TransactionRolledBack { cause },
            None => TxError::NoTransactionAssociated,
        }
    }

    fn owner(tx: &Transaction) -> LogOwner {
        LogOwner::Transaction(tx.ident().clone())
    }

    fn number_events(&self, events: Vec<FileStateChangeEvent>) -> Vec<QueuedEvent> {
        events
            .into_iter()
            .map(|event| QueuedEvent {
                id: self.next_event.fetch_add(1, Ordering::SeqCst),
                event,
            })
            .collect()
    }

    fn decision_entries(
        tx: &Transaction,
        events: &[QueuedEvent],
        decision: LogEntry,
    ) -> Vec<(LogEntry, Vec<LogOwner>)> {
        let owner = Self::owner(tx);
        let mut entries = Vec::with_capacity(3);
        if !events.is_empty() {
            let mut owners = vec![owner.clone()];
            owners.extend(events.iter().map(|e| LogOwner::Event(e.id)));
            entries.push((
                LogEntry::EventEnqueue {
                    ident: tx.ident().clone(),
                    events: events.to_vec(),
                },
                owners,
            ));
        }
        if let Some(event_id) = tx.dequeue() {
            entries.push((
                LogEntry::EventDequeue {
                    ident: tx.ident().clone(),
                    event_id,
                },
                vec![owner.clone()],
            ));
        }
        entries.push((decision, vec![owner]));
        entries
    }

    fn finish(&self, tx: &Transaction, state: TransactionState) {
        self.locks.release_all(tx.id());
        tx.set_state(state);
        self.registry.remove(tx);
    }

    fn fail(&self, tx: &Arc<Transaction>, err: &TxError) -> TxError {
        let message = err.to_string();
        error!(ident = %tx.ident(), error = %message, "transaction failed");
        tx.set_failure(message.clone());
        self.registry.mark_failed(tx);
        TxError::transaction_failed(tx.ident().clone(), message)
    }

    /// Applies `effects` from the last checkpoint, syncs them and writes
    /// the completion record.
    fn apply_and_complete(&self, tx: &Transaction, work: &mut TransactionWork, effects: &[Effect]) -> TxResult<()> {
        let owner = Self::owner(tx);
        let mut touched: Vec<ResourcePath> = Vec::new();
        let checkpoint = |applied: usize| -> TxResult<()> {
            let applied = u32::try_from(applied)
                .map_err(|_| TxError::invalid_argument("too many effects in one transaction"))?;
            self.log.append_one(
                LogEntry::Checkpoint {
                    ident: tx.ident().clone(),
                    applied,
                },
                owner.clone(),
            )?;
            Ok(())
        };

        for (index, effect) in effects.iter().enumerate().skip(work.applied) {
            let is_move = matches!(effect, Effect::Move { .. });
            if is_move {
                self.store.sync(&touched)?;
                touched.clear();
                checkpoint(index)?;
            }
            self.store.apply(effect)?;
            work.applied = index + 1;
            touched.extend(effect.paths().into_iter().cloned());
            if is_move {
                self.store.sync(&touched)?;
                touched.clear();
                checkpoint(index + 1)?;
            }
        }
        self.store.sync(&touched)?;

        self.log.append_one(
            LogEntry::Completed {
                ident: tx.ident().clone(),
            },
            owner.clone(),
        )?;
        self.log.release(&owner);
        if let Some(event_id) = tx.dequeue() {
            self.log.release(&LogOwner::Event(event_id));
        }
        Ok(())
    }

    /// Commits an active transaction with a single log write. Returns the
    /// events it published, ready to be queued.
    ///
    /// # Errors
    ///
    /// - [`TxError::NoTransactionAssociated`] or
    ///   [`TxError::TransactionRolledBack`] if the transaction is not active.
    /// - [`TxError::TransactionFailed`] if the log write or the apply fails.
    pub fn commit_one_phase(&self, tx: &Arc<Transaction>, work: &mut TransactionWork) -> TxResult<Vec<QueuedEvent>> {
        if !tx.transition(TransactionState::Active, TransactionState::Committing) {
            return Err(Self::ended_error(tx));
        }
        let (effects, raw_events) = work.workspace.take();
        if effects.is_empty() && tx.dequeue().is_none() {
            debug!(ident = %tx.ident(), "read-only commit");
            self.finish(tx, TransactionState::Committed);
            return Ok(Vec::new());
        }

        let events = if tx.publishes_events() {
            self.number_events(raw_events)
        } else {
            Vec::new()
        };
        let entries = Self::decision_entries(
            tx,
            &events,
            LogEntry::Commit {
                ident: tx.ident().clone(),
                effects: effects.clone(),
            },
        );
        if let Err(e) = self.log.append(entries) {
            return Err(self.fail(tx, &e));
        }
        debug!(ident = %tx.ident(), effects = effects.len(), events = events.len(), "commit durable");

        if let Err(e) = self.apply_and_complete(tx, work, &effects) {
            return Err(self.fail(tx, &e));
        }
        self.finish(tx, TransactionState::Committed);
        Ok(events)
    }

    /// Prepares an active transaction.
    ///
    /// # Errors
    ///
    /// - [`TxError::NoTransactionAssociated`] or
    ///   [`TxError::TransactionRolledBack`] if the transaction is not active.
    /// - A log error if the prepare record could not be written; the
    ///   transaction is then rolled back.
    pub fn prepare(&self, tx: &Arc<Transaction>, work: &mut TransactionWork) -> TxResult<Vote> {
        if !tx.transition(TransactionState::Active, TransactionState::Preparing) {
            return Err(Self::ended_error(tx));
        }
        let read_only = work.workspace.is_read_only();
        let (effects, raw_events) = work.workspace.take();
        if read_only && tx.dequeue().is_none() {
            debug!(ident = %tx.ident(), "read-only prepare");
            self.finish(tx, TransactionState::Committed);
            return Ok(Vote::ReadOnly);
        }

        let events = if tx.publishes_events() {
            self.number_events(raw_events)
        } else {
            Vec::new()
        };
        let entries = Self::decision_entries(
            tx,
            &events,
            LogEntry::Prepare {
                ident: tx.ident().clone(),
                effects: effects.clone(),
            },
        );
        if let Err(e) = self.log.append(entries) {
            error!(ident = %tx.ident(), error = %e, "prepare failed");
            self.release_log_references(tx, &events);
            self.finish(tx, TransactionState::RolledBack);
            return Err(e);
        }
        work.prepared = effects;
        work.prepared_events = events;
        tx.set_state(TransactionState::Prepared);
        debug!(ident = %tx.ident(), "prepared");
        Ok(Vote::Ok)
    }

    /// Commits a prepared transaction. Returns its events.
    ///
    /// # Errors
    ///
    /// - [`TxError::InvalidArgument`] if the transaction is not prepared.
    /// - [`TxError::TransactionFailed`] if the log write or the apply fails.
    pub fn commit_prepared(&self, tx: &Arc<Transaction>, work: &mut TransactionWork) -> TxResult<Vec<QueuedEvent>> {
        if !tx.transition(TransactionState::Prepared, TransactionState::Committing) {
            return Err(TxError::invalid_argument(format!(
                "transaction {} is {}, not PREPARED",
                tx.ident(),
                tx.state()
            )));
        }
        let decision = LogEntry::Commit {
            ident: tx.ident().clone(),
            effects: Vec::new(),
        };
        if let Err(e) = self.log.append_one(decision, Self::owner(tx)) {
            return Err(self.fail(tx, &e));
        }
        self.redo(tx, work)?;
        Ok(std::mem::take(&mut work.prepared_events))
    }

    /// Applies the prepared effects of a transaction whose commit is
    /// already durable, then finishes it.
    ///
    /// # Errors
    ///
    /// [`TxError::TransactionFailed`] if the apply fails.
    pub(crate) fn redo(&self, tx: &Arc<Transaction>, work: &mut TransactionWork) -> TxResult<()> {
        tx.set_state(TransactionState::Committing);
        let effects = std::mem::take(&mut work.prepared);
        if let Err(e) = self.apply_and_complete(tx, work, &effects) {
            work.prepared = effects;
            return Err(self.fail(tx, &e));
        }
        self.finish(tx, TransactionState::Committed);
        debug!(ident = %tx.ident(), "committed");
        Ok(())
    }

    fn release_log_references(&self, tx: &Transaction, events: &[QueuedEvent]) {
        self.log.release(&Self::owner(tx));
        for event in events {
            self.log.release(&LogOwner::Event(event.id));
        }
    }

    /// Rolls back an active or prepared transaction.
    ///
    /// # Errors
    ///
    /// - [`TxError::NoTransactionAssociated`] for a transaction in any
    ///   other state.
    /// - [`TxError::TransactionFailed`] if the rollback record of a
    ///   prepared transaction cannot be written.
    pub fn rollback(&self, tx: &Arc<Transaction>, work: &mut TransactionWork) -> TxResult<()> {
        if tx.transition(TransactionState::Active, TransactionState::RollingBack) {
            work.workspace.take();
            self.finish(tx, TransactionState::RolledBack);
            debug!(ident = %tx.ident(), "rolled back");
            return Ok(());
        }
        if !tx.transition(TransactionState::Prepared, TransactionState::RollingBack) {
            return Err(Self::ended_error(tx));
        }
        let record = LogEntry::Rollback {
            ident: tx.ident().clone(),
        };
        if let Err(e) = self.log.append_one(record, Self::owner(tx)) {
            return Err(self.fail(tx, &e));
        }
        let events = std::mem::take(&mut work.prepared_events);
        self.release_log_references(tx, &events);
        work.prepared.clear();
        self.finish(tx, TransactionState::RolledBack);
        debug!(ident = %tx.ident(), "prepared transaction rolled back");
        Ok(())
    }

    /// Finishes a failed transaction on an administrator's word: writes
    /// its completion record and releases its locks.
    ///
    /// # Errors
    ///
    /// - [`TxError::InvalidArgument`] if `ident` is not a failed
    ///   transaction.
    /// - A log error if the completion record cannot be written.
    pub fn declare_complete(&self, ident: &TransactionIdentifier) -> TxResult<()> {
        let tx = self
            .registry
            .failed(ident)
            .ok_or_else(|| TxError::invalid_argument(format!("{ident} is not a failed transaction")))?;
        let owner = Self::owner(&tx);
        self.log.append_one(LogEntry::Completed { ident: ident.clone() }, owner.clone())?;
        self.log.release(&owner);
        self.registry.take_failed(ident);
        self.locks.release_all(tx.id());
        info!(%ident, "failed transaction declared complete");
        Ok(())
    }

    /// Rolls `tx` back on the engine's initiative.
    ///
    /// The cause is recorded first, so an operation that is interrupted
    /// or starts afterwards reports it. The rollback itself runs on the
    /// scheduler once the transaction's current operation has returned.
    pub fn force_rollback(self: &Arc<Self>, tx: Arc<Transaction>, cause: RollbackCause) {
        if tx.state() != TransactionState::Active || !tx.force(cause) {
            return;
        }
        warn!(ident = %tx.ident(), %cause, "rolling back transaction");
        if cause == RollbackCause::Timeout {
            self.locks.interrupt(tx.id(), WaitInterrupt::Cancelled);
        }
        let manager = Arc::clone(self);
        let job = Box::new(move || manager.run_forced_rollback(&tx));
        if let Err(e) = self.scheduler.schedule("txdisk-rollback", job) {
            error!(error = %e, "could not schedule rollback");
        }
    }

    fn run_forced_rollback(&self, tx: &Arc<Transaction>) {
        let mut work = loop {
            if let Some(work) = tx.try_work_for(Duration::from_millis(20)) {
                break work;
            }
            if tx.state() != TransactionState::Active {
                return;
            }
            self.locks.interrupt(tx.id(), WaitInterrupt::Cancelled);
        };
        if tx.state() == TransactionState::Active {
            if let Err(e) = self.rollback(tx, &mut work) {
                error!(ident = %tx.ident(), error = %e, "forced rollback failed");
            }
        }
    }

    /// Rolls back every active transaction past its deadline. Returns how
    /// many were found.
    pub fn expire_timed_out(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let expired: Vec<_> = self.registry.all().into_iter().filter(|tx| tx.is_expired(now)).collect();
        let count = expired.len();
        for tx in expired {
            self.force_rollback(tx, RollbackCause::Timeout);
        }
        count
    }

    /// Handles a deadlock victim chosen by the lock manager.
    pub fn on_deadlock_victim(self: &Arc<Self>, id: TransactionId) {
        if let Some(tx) = self.registry.get(id) {
            self.force_rollback(tx, RollbackCause::DeadlockVictim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventMask;
    use crate::log::{LogOptions, LogScanner};
    use crate::scheduler::ThreadScheduler;
    use crate::store::DiskStore;
    use crate::types::LockMode;
    use tempfile::{tempdir, TempDir};
    use txdisk_storage::{MemorySegmentStore, SegmentStore};

    struct Fixture {
        _dir: TempDir,
        segments: MemorySegmentStore,
        manager: Arc<TransactionManager>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let segments = MemorySegmentStore::new();
        let options = LogOptions {
            max_segment_size: 1 << 20,
            group_commit_window: Duration::from_millis(1),
            max_batch_bytes: 1 << 16,
            write_retries: 2,
        };
        let log = DurableLog::open(Arc::new(segments.clone()), options, Vec::new()).unwrap();
        let store = DiskStore::new(dir.path().join("data")).unwrap();
        let manager = Arc::new(TransactionManager::new(
            Arc::new(LockManager::new()),
            Arc::new(log),
            Arc::new(store),
            Arc::new(ThreadScheduler),
            IdCounters::default(),
        ));
        Fixture {
            _dir: dir,
            segments,
            manager,
        }
    }

    fn p(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    fn entry_types(segments: &MemorySegmentStore) -> Vec<&'static str> {
        let store: Arc<dyn SegmentStore> = Arc::new(segments.clone());
        LogScanner::new(store)
            .unwrap()
            .map(|r| r.unwrap().1.entry_type().name())
            .collect()
    }

    fn write_file(f: &Fixture, tx: &Arc<Transaction>, path: &str, data: &[u8]) {
        let mut work = tx.work();
        let store = f.manager.store().as_ref();
        work.workspace.create(store, &p(path), false).unwrap();
        work.workspace.append(store, &p(path), data).unwrap();
    }

    #[test]
    fn local_commit_logs_commit_then_completed() {
        let f = fixture();
        let tx = f.manager.begin(None, Duration::from_secs(10), false, None).unwrap();
        write_file(&f, &tx, "/a", b"hi");
        let events = f.manager.commit_one_phase(&tx, &mut tx.work()).unwrap();
        assert!(events.is_empty());
        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(f.manager.store().read_at(&p("/a"), 0, 10).unwrap(), b"hi");
        assert!(f.manager.registry().is_empty());
        f.manager.log().close();
        assert_eq!(entry_types(&f.segments), vec!["COMMIT", "COMPLETED"]);
    }

    #[test]
    fn read_only_commit_writes_nothing() {
        let f = fixture();
        let tx = f.manager.begin(None, Duration::from_secs(10), false, None).unwrap();
        f.manager
            .locks()
            .acquire(tx.id(), &p("/x"), LockMode::Shared, Duration::from_millis(10))
            .unwrap();
        f.manager.commit_one_phase(&tx, &mut tx.work()).unwrap();
        assert!(f.manager.locks().held_by(tx.id()).is_empty());
        f.manager.log().close();
        assert!(entry_types(&f.segments).is_empty());
    }

    #[test]
    fn published_events_are_numbered_and_logged() {
        let f = fixture();
        let tx = f.manager.begin(None, Duration::from_secs(10), true, None).unwrap();
        write_file(&f, &tx, "/a", b"x");
        let events = f.manager.commit_one_phase(&tx, &mut tx.work()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, 1);
        assert_eq!(events[0].event.event_type, EventMask::CREATED);
        // the event keeps its segment alive until dequeued
        assert_eq!(f.manager.log().ref_count(f.manager.log().active_segment()), 1);
        f.manager.log().close();
        assert_eq!(entry_types(&f.segments), vec!["EVENT_ENQUEUE", "COMMIT", "COMPLETED"]);
    }

    #[test]
    fn two_phase_commit_and_read_only_vote() {
        let f = fixture();
        let xid = Xid::new(1, b"g".to_vec(), b"1".to_vec());
        let tx = f.manager.begin(Some(xid.clone()), Duration::from_secs(10), false, None).unwrap();
        write_file(&f, &tx, "/b", b"2pc");
        assert_eq!(f.manager.prepare(&tx, &mut tx.work()).unwrap(), Vote::Ok);
        assert_eq!(f.manager.registry().prepared_xids(), vec![xid]);
        assert_eq!(f.manager.store().metadata(&p("/b")).unwrap(), None);
        f.manager.commit_prepared(&tx, &mut tx.work()).unwrap();
        assert_eq!(f.manager.store().read_at(&p("/b"), 0, 10).unwrap(), b"2pc");

        let ro = f
            .manager
            .begin(Some(Xid::new(1, b"g".to_vec(), b"2".to_vec())), Duration::from_secs(10), false, None)
            .unwrap();
        assert_eq!(f.manager.prepare(&ro, &mut ro.work()).unwrap(), Vote::ReadOnly);
        f.manager.log().close();
        assert_eq!(entry_types(&f.segments), vec!["PREPARE", "COMMIT", "COMPLETED"]);
    }

    #[test]
    fn rollback_of_prepared_writes_rollback_record() {
        let f = fixture();
        let tx = f
            .manager
            .begin(Some(Xid::new(1, b"r".to_vec(), b"".to_vec())), Duration::from_secs(10), false, None)
            .unwrap();
        write_file(&f, &tx, "/c", b"no");
        f.manager.prepare(&tx, &mut tx.work()).unwrap();
        f.manager.rollback(&tx, &mut tx.work()).unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(f.manager.store().metadata(&p("/c")).unwrap(), None);
        assert!(matches!(
            f.manager.rollback(&tx, &mut tx.work()),
            Err(TxError::NoTransactionAssociated)
        ));
        f.manager.log().close();
        assert_eq!(entry_types(&f.segments), vec!["PREPARE", "ROLLBACK"]);
    }

    #[test]
    fn moves_are_bracketed_by_checkpoints() {
        let f = fixture();
        let tx = f.manager.begin(None, Duration::from_secs(10), false, None).unwrap();
        write_file(&f, &tx, "/m", b"1");
        {
            let mut work = tx.work();
            let store = f.manager.store().as_ref();
            work.workspace.move_path(store, &p("/m"), &p("/n")).unwrap();
        }
        f.manager.commit_one_phase(&tx, &mut tx.work()).unwrap();
        assert_eq!(f.manager.store().read_at(&p("/n"), 0, 10).unwrap(), b"1");
        f.manager.log().close();
        assert_eq!(
            entry_types(&f.segments),
            vec!["COMMIT", "CHECKPOINT", "CHECKPOINT", "COMPLETED"]
        );
    }

    #[test]
    fn duplicate_branch_is_rejected() {
        let f = fixture();
        let xid = Xid::new(1, b"dup".to_vec(), b"".to_vec());
        f.manager.begin(Some(xid.clone()), Duration::from_secs(1), false, None).unwrap();
        assert!(matches!(
            f.manager.begin(Some(xid), Duration::from_secs(1), false, None),
            Err(TxError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn timeout_rolls_back_asynchronously() {
        let f = fixture();
        let tx = f.manager.begin(None, Duration::ZERO, false, None).unwrap();
        assert_eq!(f.manager.expire_timed_out(), 1);
        let deadline = Instant::now() + Duration::from_secs(5);
        while tx.state() != TransactionState::RolledBack && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(matches!(
            TransactionManager::ended_error(&tx),
            TxError::TransactionRolledBack {
                cause: RollbackCause::Timeout
            }
        ));
    }
}
