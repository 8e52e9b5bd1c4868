//! Engine facade: boot, recovery gating, background workers and
//! shutdown.

use crate::config::Config;
use crate::dir::InstanceDir;
use crate::error::{TxError, TxResult};
use crate::events::{DeadLetter, DeadLetterWriter, DeliverFn, EventFilter, EventQueue, EventSubscriber};
use crate::lock::LockManager;
use crate::log::{DurableLog, LogOptions, QueuedEvent};
use crate::recovery::{self, RecoveryPlan};
use crate::scheduler::{PeriodicTask, ThreadScheduler, WorkScheduler};
use crate::session::Session;
use crate::store::{DiskStore, FileStore};
use crate::transaction::{Transaction, TransactionManager, TransactionState};
use crate::types::{TransactionId, TransactionIdentifier};
use crate::xa::XaSession;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use txdisk_storage::SegmentStore;
use uuid::Uuid;

const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Collaborators an engine runs on. [`Engine::boot`] uses segment files
/// under the instance directory, the disk under the data root and a
/// thread per background job.
#[derive(Debug, Clone)]
pub struct EngineParts {
    /// Where log segments live.
    pub segments: Arc<dyn SegmentStore>,
    /// The managed file tree.
    pub files: Arc<dyn FileStore>,
    /// Runs background work.
    pub scheduler: Arc<dyn WorkScheduler>,
}

impl EngineParts {
    fn for_instance(config: &Config, dir: &InstanceDir) -> TxResult<Self> {
        Ok(Self {
            segments: Arc::new(dir.segment_store()?),
            files: Arc::new(DiskStore::new(config.resolved_data_root())?),
            scheduler: Arc::new(ThreadScheduler),
        })
    }
}

#[derive(Debug, Default)]
struct Status {
    recovery_done: bool,
    boot_error: Option<String>,
    recovery_failed: BTreeSet<TransactionIdentifier>,
    shutting_down: bool,
}

/// State shared by the engine handle, its sessions and its workers.
pub(crate) struct EngineShared {
    pub(crate) config: Config,
    pub(crate) manager: Arc<TransactionManager>,
    pub(crate) events: EventQueue,
    pub(crate) instance_id: Uuid,
    scheduler: Arc<dyn WorkScheduler>,
    status: Mutex<Status>,
    status_changed: Condvar,
    dead_letters: Mutex<DeadLetterWriter>,
    detectors: Mutex<Vec<PeriodicTask>>,
    delivery: Mutex<Option<DeliverFn>>,
    dir: Mutex<InstanceDir>,
}

impl fmt::Debug for EngineShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineShared")
            .field("instance_id", &self.instance_id)
            .field("status", &*self.status.lock())
            .finish_non_exhaustive()
    }
}

impl EngineShared {
    fn is_failed(&self, status: &Status) -> bool {
        status.boot_error.is_some() || self.manager.log().failure().is_some()
    }

    /// Check made by every operation of a running transaction.
    pub(crate) fn check_available(&self) -> TxResult<()> {
        let status = self.status.lock();
        if self.is_failed(&status) || status.shutting_down {
            return Err(TxError::NoMoreAvailable);
        }
        Ok(())
    }

    /// Check made before a new transaction starts.
    pub(crate) fn admit(&self) -> TxResult<()> {
        let status = self.status.lock();
        if self.is_failed(&status) {
            return Err(TxError::NoMoreAvailable);
        }
        if !status.recovery_done || !status.recovery_failed.is_empty() {
            return Err(TxError::RecoveryInProgress);
        }
        if status.shutting_down {
            return Err(TxError::NoMoreAvailable);
        }
        Ok(())
    }

    fn finish_recovery(&self, failed: Vec<TransactionIdentifier>) {
        let mut status = self.status.lock();
        status.recovery_done = true;
        status.recovery_failed.extend(failed);
        if status.recovery_failed.is_empty() {
            info!("recovery complete");
        } else {
            warn!(
                failed = status.recovery_failed.len(),
                "recovery left failed transactions; declare them complete to admit new work"
            );
        }
        drop(status);
        self.status_changed.notify_all();
    }

    fn fail_boot(&self, message: String) {
        error!(error = %message, "recovery failed");
        self.status.lock().boot_error = Some(message);
        self.status_changed.notify_all();
    }

    fn deliver(self: &Arc<Self>, event: QueuedEvent, subscriber: Option<Arc<dyn EventSubscriber>>) {
        if self.check_available().is_err() {
            return;
        }
        let reason = match subscriber {
            Some(subscriber) => match self.deliver_to(&event, subscriber.as_ref()) {
                Ok(()) => return,
                Err(reason) => reason,
            },
            None => "no interested subscriber".to_string(),
        };
        if self.check_available().is_err() {
            // stopped mid-delivery: the event is redelivered after reboot
            return;
        }
        if let Err(e) = self.dead_letters.lock().write(&DeadLetter::new(&event, reason)) {
            error!(event_id = event.id, error = %e, "could not write dead letter");
            return;
        }
        let consumed = Session::local(Arc::clone(self), false, Some(event.id)).and_then(|s| s.commit());
        if let Err(e) = consumed {
            error!(event_id = event.id, error = %e, "could not dequeue dead-lettered event");
        }
    }

    /// Runs the subscriber inside the event's dequeue transaction.
    /// Returns the failure reason if the event was not consumed.
    fn deliver_to(self: &Arc<Self>, event: &QueuedEvent, subscriber: &dyn EventSubscriber) -> Result<(), String> {
        let session = Session::local(Arc::clone(self), false, Some(event.id)).map_err(|e| e.to_string())?;
        match subscriber.on_event(&event.event, &session) {
            Ok(()) => {
                session.commit().map_err(|e| e.to_string())?;
                debug!(event_id = event.id, "event delivered");
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = session.rollback() {
                    debug!(event_id = event.id, error = %rb, "delivery transaction already ended");
                }
                Err(e.to_string())
            }
        }
    }

    fn stop_workers(&self, drain: Duration) {
        self.manager.locks().interrupt_all();
        if !self.events.stop(drain) {
            warn!("event deliveries still running at shutdown");
        }
        for task in self.detectors.lock().drain(..) {
            task.stop();
        }
    }
}

/// Handle on a running engine instance. Clones share the instance.
#[derive(Debug, Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Boots an engine over the instance directory in `config`.
    ///
    /// # Errors
    ///
    /// - [`TxError::InvalidArgument`] for an invalid configuration.
    /// - [`TxError::InstanceLocked`] if another engine owns the directory.
    /// - [`TxError::LogCorruption`] or [`TxError::BootFailure`] if the log
    ///   cannot be recovered.
    pub fn boot(config: Config) -> TxResult<Self> {
        config.validate()?;
        let dir = InstanceDir::open(config.instance_dir())?;
        let parts = EngineParts::for_instance(&config, &dir)?;
        Self::start(config, dir, parts)
    }

    /// Boots an engine on the given collaborators. The instance directory
    /// still provides the lock and the dead-letter files.
    ///
    /// # Errors
    ///
    /// As for [`boot`](Self::boot).
    pub fn boot_with(config: Config, parts: EngineParts) -> TxResult<Self> {
        config.validate()?;
        let dir = InstanceDir::open(config.instance_dir())?;
        Self::start(config, dir, parts)
    }

    fn start(config: Config, dir: InstanceDir, parts: EngineParts) -> TxResult<Self> {
        let started = Instant::now();
        let instance_id = Uuid::new_v4();
        info!(%instance_id, dir = %dir.path().display(), "booting engine");

        let plan = RecoveryPlan::scan(Arc::clone(&parts.segments))?;
        let log = Arc::new(DurableLog::open(
            Arc::clone(&parts.segments),
            LogOptions::from(&config),
            plan.references.iter().cloned(),
        )?);
        let locks = Arc::new(LockManager::new());
        let manager = Arc::new(TransactionManager::new(
            Arc::clone(&locks),
            log,
            parts.files,
            Arc::clone(&parts.scheduler),
            plan.counters,
        ));
        let redo = recovery::restore(&manager, &plan)?;

        let weak_manager = Arc::downgrade(&manager);
        locks.set_victim_handler(Arc::new(move |victim: TransactionId| {
            if let Some(manager) = weak_manager.upgrade() {
                manager.on_deadlock_victim(victim);
            }
        }));

        let events = EventQueue::new(config.max_concurrent_event_deliveries);
        events.enqueue(plan.live_events.clone());

        let shared = Arc::new(EngineShared {
            dead_letters: Mutex::new(DeadLetterWriter::open(dir.dead_letter_dir())?),
            config,
            manager,
            events,
            instance_id,
            scheduler: parts.scheduler,
            status: Mutex::new(Status::default()),
            status_changed: Condvar::new(),
            detectors: Mutex::new(Vec::new()),
            delivery: Mutex::new(None),
            dir: Mutex::new(dir),
        });
        Self::start_detectors(&shared)?;

        let weak_shared = Arc::downgrade(&shared);
        let deliver: DeliverFn = Arc::new(move |event, subscriber| {
            if let Some(shared) = weak_shared.upgrade() {
                shared.deliver(event, subscriber);
            }
        });
        *shared.delivery.lock() = Some(deliver);

        if shared.config.synchronous_recovery || redo.is_empty() {
            let failed = recovery::redo_all(&shared.manager, &redo);
            shared.finish_recovery(failed);
        } else {
            let worker = Arc::downgrade(&shared);
            let job = Box::new(move || {
                if let Some(shared) = worker.upgrade() {
                    let failed = recovery::redo_all(&shared.manager, &redo);
                    shared.finish_recovery(failed);
                }
            });
            if let Err(e) = shared.scheduler.schedule("txdisk-recovery", job) {
                shared.fail_boot(e.to_string());
            }
        }

        info!(
            %instance_id,
            in_doubt = plan.in_doubt.len(),
            redo = plan.redo.len(),
            events = plan.live_events.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "engine booted"
        );
        Ok(Self { shared })
    }

    fn start_detectors(shared: &Arc<EngineShared>) -> TxResult<()> {
        let manager: Weak<TransactionManager> = Arc::downgrade(&shared.manager);
        let timeouts = PeriodicTask::start("txdisk-timeout-detector", shared.config.timeout_check_interval, move || {
            if let Some(manager) = manager.upgrade() {
                let expired = manager.expire_timed_out();
                if expired > 0 {
                    debug!(expired, "timed-out transactions rolled back");
                }
            }
        })?;
        let locks: Weak<LockManager> = Arc::downgrade(shared.manager.locks());
        let deadlocks =
            PeriodicTask::start("txdisk-deadlock-detector", shared.config.deadlock_detector_interval, move || {
                if let Some(locks) = locks.upgrade() {
                    locks.detect_deadlocks();
                }
            })?;
        shared.detectors.lock().extend([timeouts, deadlocks]);
        Ok(())
    }

    /// Stable identifier of this instance, used by
    /// [`XaResource::is_same_rm`](crate::xa::XaResource::is_same_rm).
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.shared.instance_id
    }

    /// The configuration the engine booted with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Waits until recovery has finished and no failed recovery
    /// transaction remains.
    ///
    /// # Errors
    ///
    /// - [`TxError::RecoveryInProgress`] if `timeout` passes first.
    /// - [`TxError::BootFailure`] if recovery failed or the engine is no
    ///   longer usable.
    pub fn wait_for_bootup(&self, timeout: Duration) -> TxResult<()> {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        loop {
            if let Some(message) = &status.boot_error {
                return Err(TxError::boot_failure(message.clone()));
            }
            if let Some(message) = self.shared.manager.log().failure() {
                return Err(TxError::boot_failure(message));
            }
            if status.recovery_done && status.recovery_failed.is_empty() {
                return Ok(());
            }
            if self.shared.status_changed.wait_until(&mut status, deadline).timed_out() {
                return Err(TxError::RecoveryInProgress);
            }
        }
    }

    /// Opens a local session and starts its transaction.
    ///
    /// # Errors
    ///
    /// [`TxError::RecoveryInProgress`] or [`TxError::NoMoreAvailable`] if
    /// the engine is not admitting work.
    pub fn create_session(&self) -> TxResult<Session> {
        self.shared.admit()?;
        Session::local(Arc::clone(&self.shared), false, None)
    }

    /// Like [`create_session`](Self::create_session), with event
    /// publication turned on.
    ///
    /// # Errors
    ///
    /// As for [`create_session`](Self::create_session).
    pub fn create_session_with_events(&self) -> TxResult<Session> {
        self.shared.admit()?;
        Session::local(Arc::clone(&self.shared), true, None)
    }

    /// Opens a session for global transactions. Admission is checked when
    /// a branch is started.
    #[must_use]
    pub fn xa_session(&self) -> XaSession {
        XaSession::new(Arc::clone(&self.shared))
    }

    /// Identifiers of transactions that failed to commit or roll back.
    #[must_use]
    pub fn failed_transactions(&self) -> Vec<TransactionIdentifier> {
        self.shared.manager.registry().failed_idents()
    }

    /// Marks a failed transaction as complete, releasing its locks.
    ///
    /// # Errors
    ///
    /// - [`TxError::InvalidArgument`] if `ident` is not a failed
    ///   transaction.
    /// - A log error if the completion record cannot be written.
    pub fn declare_transaction_complete(&self, ident: &TransactionIdentifier) -> TxResult<()> {
        self.shared.manager.declare_complete(ident)?;
        let mut status = self.shared.status.lock();
        if status.recovery_failed.remove(ident) && status.recovery_failed.is_empty() && status.recovery_done {
            info!("recovery complete");
        }
        drop(status);
        self.shared.status_changed.notify_all();
        Ok(())
    }

    /// Adds an event subscriber. Each event goes to the first subscriber
    /// whose filter matches it.
    ///
    /// Delivery starts with the first registration; until then committed
    /// events wait, including those recovered from the log.
    pub fn register_subscriber(&self, filter: EventFilter, subscriber: Arc<dyn EventSubscriber>) {
        self.shared.events.register(filter, subscriber);
        let Some(deliver) = self.shared.delivery.lock().take() else {
            return;
        };
        if let Err(e) = self.shared.events.start(Arc::clone(&self.shared.scheduler), deliver) {
            error!(error = %e, "could not start event delivery");
        }
    }

    /// Number of transactions the engine currently tracks.
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.shared.manager.registry().len()
    }

    fn begin_shutdown(&self) -> bool {
        let mut status = self.shared.status.lock();
        if status.shutting_down {
            return false;
        }
        status.shutting_down = true;
        drop(status);
        self.shared.status_changed.notify_all();
        true
    }

    /// Shuts the engine down: active local transactions are rolled back,
    /// workers stop, the log is closed and the directory unlocked.
    /// Prepared branches stay in the log for the next boot.
    pub fn shutdown(&self) {
        if !self.begin_shutdown() {
            return;
        }
        info!(instance_id = %self.shared.instance_id, "shutting down");
        let manager = &self.shared.manager;
        manager.locks().interrupt_all();
        let local: Vec<Arc<Transaction>> = manager
            .registry()
            .all()
            .into_iter()
            .filter(|tx| matches!(tx.ident(), TransactionIdentifier::Local(_)))
            .collect();
        for tx in local {
            let mut work = tx.work();
            if tx.state() == TransactionState::Active {
                if let Err(e) = manager.rollback(&tx, &mut work) {
                    warn!(ident = %tx.ident(), error = %e, "rollback at shutdown failed");
                }
            }
        }
        self.shared.stop_workers(EVENT_DRAIN_TIMEOUT);
        manager.log().close();
        self.shared.dir.lock().unlock();
        info!("engine stopped");
    }

    /// Stops the engine the way a crash would: workers and the log stop
    /// where they are and nothing more is written. The directory is
    /// unlocked so a new engine can boot over it.
    pub fn halt(&self) {
        if !self.begin_shutdown() {
            return;
        }
        warn!(instance_id = %self.shared.instance_id, "halting engine");
        self.shared.stop_workers(Duration::ZERO);
        self.shared.manager.log().close();
        self.shared.dir.lock().unlock();
    }

    /// True once [`shutdown`](Self::shutdown) or [`halt`](Self::halt)
    /// has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.status.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> Config {
        Config::new(dir)
            .synchronous_recovery(true)
            .lock_wait_timeout(Duration::from_millis(200))
    }

    #[test]
    fn boot_and_commit() {
        let dir = tempdir().unwrap();
        let engine = Engine::boot(config(dir.path())).unwrap();
        engine.wait_for_bootup(Duration::from_secs(1)).unwrap();
        let session = engine.create_session().unwrap();
        session.create_file("/a", false).unwrap();
        session.commit().unwrap();
        assert!(dir.path().join("data/a").exists());
        engine.shutdown();
    }

    #[test]
    fn second_engine_on_same_directory_is_refused() {
        let dir = tempdir().unwrap();
        let engine = Engine::boot(config(dir.path())).unwrap();
        assert!(matches!(Engine::boot(config(dir.path())), Err(TxError::InstanceLocked)));
        engine.shutdown();
        let again = Engine::boot(config(dir.path())).unwrap();
        again.shutdown();
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let dir = tempdir().unwrap();
        let engine = Engine::boot(config(dir.path())).unwrap();
        let session = engine.create_session().unwrap();
        engine.shutdown();
        assert!(matches!(engine.create_session(), Err(TxError::NoMoreAvailable)));
        assert!(matches!(session.create_file("/x", false), Err(TxError::NoMoreAvailable)));
        assert!(engine.is_shut_down());
    }

    #[test]
    fn instances_have_distinct_ids() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let first = Engine::boot(config(a.path())).unwrap();
        let second = Engine::boot(config(b.path())).unwrap();
        assert_ne!(first.instance_id(), second.instance_id());
        assert!(!first.xa_session().xa_resource().is_same_rm(second.xa_session().xa_resource()));
        first.shutdown();
        second.shutdown();
    }
}
