//! Transaction state.

use crate::log::{Effect, QueuedEvent};
use crate::types::{RollbackCause, TransactionId, TransactionIdentifier};
use crate::workspace::Workspace;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Operations may be performed.
    Active,
    /// The prepare record is being written.
    Preparing,
    /// Prepared and waiting for the decision.
    Prepared,
    /// The decision is durable and effects are being applied.
    Committing,
    /// Fully committed.
    Committed,
    /// Changes are being discarded.
    RollingBack,
    /// Fully rolled back.
    RolledBack,
    /// Commit or rollback could not complete; locks are kept until an
    /// administrator declares the transaction complete.
    Failed,
}

impl TransactionState {
    /// True once the transaction can no longer change.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "ACTIVE",
            Self::Preparing => "PREPARING",
            Self::Prepared => "PREPARED",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::RollingBack => "ROLLING_BACK",
            Self::RolledBack => "ROLLEDBACK",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Mutable part of a transaction, guarded by its operation lock.
#[derive(Debug, Default)]
pub struct TransactionWork {
    /// Pending changes.
    pub workspace: Workspace,
    /// Effects fixed at prepare (or found in the log by recovery).
    pub prepared: Vec<Effect>,
    /// Events logged with the prepare record.
    pub prepared_events: Vec<QueuedEvent>,
    /// Effects already applied, from the last checkpoint.
    pub applied: usize,
}

/// One transaction known to the engine.
///
/// Every operation on the transaction runs while holding its operation
/// lock ([`work`](Self::work)). State, deadline and the forced rollback
/// cause sit behind their own small mutexes so the detectors can read
/// them without waiting for an operation to finish.
pub struct Transaction {
    id: TransactionId,
    ident: TransactionIdentifier,
    publish_events: AtomicBool,
    dequeue: Option<u64>,
    state: Mutex<TransactionState>,
    deadline: Mutex<Instant>,
    forced: Mutex<Option<RollbackCause>>,
    failure: Mutex<Option<String>>,
    work: Mutex<TransactionWork>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("ident", &self.ident)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        ident: TransactionIdentifier,
        timeout: Duration,
        publish_events: bool,
        dequeue: Option<u64>,
    ) -> Self {
        Self {
            id,
            ident,
            publish_events: AtomicBool::new(publish_events),
            dequeue,
            state: Mutex::new(TransactionState::Active),
            deadline: Mutex::new(Instant::now() + timeout),
            forced: Mutex::new(None),
            failure: Mutex::new(None),
            work: Mutex::new(TransactionWork::default()),
        }
    }

    /// Rebuilds a transaction found in the log at boot.
    pub(crate) fn recovered(
        id: TransactionId,
        ident: TransactionIdentifier,
        state: TransactionState,
        work: TransactionWork,
        dequeue: Option<u64>,
    ) -> Self {
        let tx = Self::new(id, ident, Duration::ZERO, false, dequeue);
        *tx.state.lock() = state;
        *tx.work.lock() = work;
        tx
    }

    /// Internal sequence number.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Stable identifier.
    #[must_use]
    pub fn ident(&self) -> &TransactionIdentifier {
        &self.ident
    }

    /// Whether committed changes raise events.
    #[must_use]
    pub fn publishes_events(&self) -> bool {
        self.publish_events.load(Ordering::SeqCst)
    }

    pub(crate) fn set_publish_events(&self, publish: bool) {
        self.publish_events.store(publish, Ordering::SeqCst);
    }

    /// The event this transaction dequeues, for delivery transactions.
    #[must_use]
    pub fn dequeue(&self) -> Option<u64> {
        self.dequeue
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// Replaces the state only if it is currently `from`.
    pub(crate) fn transition(&self, from: TransactionState, to: TransactionState) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Restarts the timeout clock.
    pub(crate) fn set_timeout(&self, timeout: Duration) {
        *self.deadline.lock() = Instant::now() + timeout;
    }

    /// True if the transaction is active past its deadline.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.state() == TransactionState::Active && self.forced_cause().is_none() && *self.deadline.lock() <= now
    }

    /// Why the engine rolled the transaction back, if it did.
    #[must_use]
    pub fn forced_cause(&self) -> Option<RollbackCause> {
        *self.forced.lock()
    }

    /// Records a forced rollback. Returns false if one was already
    /// recorded.
    pub(crate) fn force(&self, cause: RollbackCause) -> bool {
        let mut forced = self.forced.lock();
        if forced.is_some() {
            return false;
        }
        *forced = Some(cause);
        true
    }

    /// Why the transaction failed, if it did.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    pub(crate) fn set_failure(&self, message: String) {
        *self.failure.lock() = Some(message);
        self.set_state(TransactionState::Failed);
    }

    /// Takes the operation lock.
    pub(crate) fn work(&self) -> MutexGuard<'_, TransactionWork> {
        self.work.lock()
    }

    /// Takes the operation lock, giving up after `wait`.
    pub(crate) fn try_work_for(&self, wait: Duration) -> Option<MutexGuard<'_, TransactionWork>> {
        self.work.try_lock_for(wait)
    }
}
