//! The lock table.
//!
//! All lock state lives in one [`LockTable`] behind a single mutex, and
//! every waiter parks on one condition variable. A waiter re-evaluates its
//! request each time it is woken: pins, interrupts, grantability and its
//! deadline are all checked at the top of the wait loop. Requests are not
//! queued in strict arrival order; a newcomer whose request is compatible
//! with the current holders is granted immediately even if others wait.

use super::graph::{choose_victim, WaitForGraph};
use crate::error::{TxError, TxResult};
use crate::path::ResourcePath;
use crate::types::{LockMode, TransactionId};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Called with each deadlock victim after the table mutex is released.
pub type VictimHandler = Arc<dyn Fn(TransactionId) + Send + Sync>;

/// What a successful acquire did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    /// The transaction had no lock here before.
    Acquired,
    /// A shared lock was converted to exclusive.
    Upgraded,
    /// An equal or stronger lock was already held.
    AlreadyHeld,
}

impl LockGrant {
    /// True if the lock did not exist before this call.
    #[must_use]
    pub fn is_new(self) -> bool {
        matches!(self, Self::Acquired)
    }
}

/// Reasons a lock wait can be cut short from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitInterrupt {
    /// Chosen to break a deadlock.
    DeadlockVictim,
    /// The transaction is being rolled back or the engine is stopping.
    Cancelled,
}

/// Current holders of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockHolders {
    /// Exclusive holder, if any.
    pub exclusive: Option<TransactionId>,
    /// Shared holders.
    pub shared: Vec<TransactionId>,
    /// Pin holder, if any.
    pub pin: Option<TransactionId>,
}

#[derive(Debug, Default)]
struct LockEntry {
    exclusive: Option<TransactionId>,
    shared: BTreeSet<TransactionId>,
    pin: Option<TransactionId>,
    waiters: VecDeque<TransactionId>,
}

impl LockEntry {
    fn is_idle(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty() && self.pin.is_none() && self.waiters.is_empty()
    }

    fn holds_lock(&self, tx: TransactionId) -> bool {
        self.exclusive == Some(tx) || self.shared.contains(&tx)
    }

    fn held_by_other(&self, tx: TransactionId) -> bool {
        self.exclusive.is_some_and(|h| h != tx) || self.shared.iter().any(|h| *h != tx)
    }

    fn pinned_by_other(&self, tx: TransactionId) -> bool {
        self.pin.is_some_and(|p| p != tx)
    }

    /// Holders that keep `tx` from getting `mode`.
    fn blockers(&self, tx: TransactionId, mode: LockMode) -> impl Iterator<Item = TransactionId> + '_ {
        let exclusive = self.exclusive.filter(|h| *h != tx);
        let shared = self
            .shared
            .iter()
            .copied()
            .filter(move |h| mode == LockMode::Exclusive && *h != tx);
        exclusive.into_iter().chain(shared)
    }
}

#[derive(Debug, Default)]
struct LockTable {
    entries: BTreeMap<ResourcePath, LockEntry>,
    /// Paths where a transaction holds a lock or a pin.
    held: HashMap<TransactionId, BTreeSet<ResourcePath>>,
    waiting: HashMap<TransactionId, (ResourcePath, LockMode)>,
    interrupts: HashMap<TransactionId, WaitInterrupt>,
}

impl LockTable {
    fn check_pins(&self, tx: TransactionId, path: &ResourcePath) -> TxResult<()> {
        for candidate in std::iter::once(path.clone()).chain(path.ancestors()) {
            if let Some(entry) = self.entries.get(&candidate) {
                if entry.pinned_by_other(tx) {
                    return Err(TxError::AncestorPinned {
                        path: path.clone(),
                        ancestor: candidate,
                    });
                }
            }
        }
        Ok(())
    }

    fn try_grant(&mut self, tx: TransactionId, path: &ResourcePath, mode: LockMode) -> Option<LockGrant> {
        let entry = self.entries.entry(path.clone()).or_default();
        let grant = match mode {
            LockMode::Shared => {
                if entry.holds_lock(tx) {
                    LockGrant::AlreadyHeld
                } else if entry.exclusive.is_none() {
                    entry.shared.insert(tx);
                    LockGrant::Acquired
                } else {
                    return None;
                }
            }
            LockMode::Exclusive => {
                if entry.exclusive == Some(tx) {
                    LockGrant::AlreadyHeld
                } else if entry.held_by_other(tx) {
                    return None;
                } else if entry.shared.remove(&tx) {
                    entry.exclusive = Some(tx);
                    LockGrant::Upgraded
                } else {
                    entry.exclusive = Some(tx);
                    LockGrant::Acquired
                }
            }
        };
        self.held.entry(tx).or_default().insert(path.clone());
        Some(grant)
    }

    fn start_waiting(&mut self, tx: TransactionId, path: &ResourcePath, mode: LockMode) {
        self.entries.entry(path.clone()).or_default().waiters.push_back(tx);
        self.waiting.insert(tx, (path.clone(), mode));
    }

    fn stop_waiting(&mut self, tx: TransactionId, path: &ResourcePath) {
        if self.waiting.remove(&tx).is_some() {
            if let Some(entry) = self.entries.get_mut(path) {
                entry.waiters.retain(|w| *w != tx);
            }
        }
        self.drop_if_idle(path);
    }

    fn drop_if_idle(&mut self, path: &ResourcePath) {
        if self.entries.get(path).is_some_and(LockEntry::is_idle) {
            self.entries.remove(path);
        }
    }

    fn forget_if_unheld(&mut self, tx: TransactionId, path: &ResourcePath) {
        let still_held = self
            .entries
            .get(path)
            .is_some_and(|e| e.holds_lock(tx) || e.pin == Some(tx));
        if !still_held {
            if let Some(paths) = self.held.get_mut(&tx) {
                paths.remove(path);
                if paths.is_empty() {
                    self.held.remove(&tx);
                }
            }
        }
        self.drop_if_idle(path);
    }

    fn wait_for_graph(&self) -> WaitForGraph {
        let mut graph = WaitForGraph::new();
        for (waiter, (path, mode)) in &self.waiting {
            if self.interrupts.contains_key(waiter) {
                continue;
            }
            if let Some(entry) = self.entries.get(path) {
                for holder in entry.blockers(*waiter, *mode) {
                    graph.add_edge(*waiter, holder);
                }
            }
        }
        graph
    }
}

/// Grants shared, exclusive and pin locks on resource paths.
pub struct LockManager {
    table: Mutex<LockTable>,
    wakeup: Condvar,
    victim_handler: RwLock<Option<VictimHandler>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("LockManager")
            .field("resources", &table.entries.len())
            .field("waiting", &table.waiting.len())
            .finish()
    }
}

impl LockManager {
    /// Creates an empty lock manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            wakeup: Condvar::new(),
            victim_handler: RwLock::new(None),
        }
    }

    /// Installs the callback notified of deadlock victims.
    pub fn set_victim_handler(&self, handler: VictimHandler) {
        *self.victim_handler.write() = Some(handler);
    }

    /// Acquires `mode` on `path` for `tx`, waiting up to `wait`.
    ///
    /// A zero `wait` blocks until the lock is granted or the wait is
    /// interrupted.
    ///
    /// # Errors
    ///
    /// - [`TxError::AncestorPinned`] if `path` or an ancestor is pinned by
    ///   another transaction, checked on every wake.
    /// - [`TxError::LockingTimedOut`] once the deadline passes.
    /// - [`TxError::DeadLockVictimized`] if `tx` is chosen to break a cycle.
    /// - [`TxError::Interrupted`] if the wait is cancelled.
    pub fn acquire(
        &self,
        tx: TransactionId,
        path: &ResourcePath,
        mode: LockMode,
        wait: Duration,
    ) -> TxResult<LockGrant> {
        let deadline = (!wait.is_zero()).then(|| Instant::now() + wait);
        let mut victims = Vec::new();
        let mut timed_out = false;
        let mut table = self.table.lock();

        let result = loop {
            if let Some(interrupt) = table.interrupts.remove(&tx) {
                table.stop_waiting(tx, path);
                break Err(match interrupt {
                    WaitInterrupt::DeadlockVictim => TxError::DeadLockVictimized(path.clone()),
                    WaitInterrupt::Cancelled => TxError::Interrupted(path.clone()),
                });
            }
            if let Err(e) = table.check_pins(tx, path) {
                table.stop_waiting(tx, path);
                break Err(e);
            }
            if let Some(grant) = table.try_grant(tx, path, mode) {
                table.stop_waiting(tx, path);
                trace!(%tx, %path, ?mode, ?grant, "lock granted");
                break Ok(grant);
            }
            if timed_out {
                table.stop_waiting(tx, path);
                debug!(%tx, %path, ?mode, "lock wait timed out");
                break Err(TxError::LockingTimedOut(path.clone()));
            }

            if !table.waiting.contains_key(&tx) {
                table.start_waiting(tx, path, mode);
                if let Some(victim) = table
                    .wait_for_graph()
                    .cycle_through(tx)
                    .and_then(|cycle| choose_victim(&cycle))
                {
                    warn!(requester = %tx, %victim, %path, "deadlock detected");
                    victims.push(victim);
                    if victim == tx {
                        table.stop_waiting(tx, path);
                        break Err(TxError::DeadLockVictimized(path.clone()));
                    }
                    table.interrupts.insert(victim, WaitInterrupt::DeadlockVictim);
                    self.wakeup.notify_all();
                }
            }

            match deadline {
                None => self.wakeup.wait(&mut table),
                Some(deadline) => {
                    if self.wakeup.wait_until(&mut table, deadline).timed_out() {
                        timed_out = true;
                    }
                }
            }
        };

        drop(table);
        self.notify_victims(&victims);
        result
    }

    /// Releases the lock `tx` holds on `path`, if any. A pin is kept.
    pub fn release(&self, tx: TransactionId, path: &ResourcePath) {
        let mut table = self.table.lock();
        if let Some(entry) = table.entries.get_mut(path) {
            if entry.exclusive == Some(tx) {
                entry.exclusive = None;
            }
            entry.shared.remove(&tx);
        }
        table.forget_if_unheld(tx, path);
        drop(table);
        self.wakeup.notify_all();
    }

    /// Turns an exclusive lock of `tx` on `path` back into a shared one.
    /// Used to undo an upgrade made by an operation that then failed.
    pub fn downgrade(&self, tx: TransactionId, path: &ResourcePath) {
        let mut table = self.table.lock();
        if let Some(entry) = table.entries.get_mut(path) {
            if entry.exclusive == Some(tx) {
                entry.exclusive = None;
                entry.shared.insert(tx);
            }
        }
        drop(table);
        self.wakeup.notify_all();
    }

    /// Pins `dir` so no other transaction can lock anything beneath it.
    ///
    /// # Errors
    ///
    /// - [`TxError::AncestorPinned`] if `dir` or an ancestor is pinned by
    ///   another transaction.
    /// - [`TxError::DirectoryPinningFailed`] if `dir` or any descendant is
    ///   locked or pinned by another transaction. Never waits.
    pub fn acquire_pin(&self, tx: TransactionId, dir: &ResourcePath) -> TxResult<()> {
        let mut table = self.table.lock();
        table.check_pins(tx, dir)?;

        let conflict = |path: &ResourcePath| TxError::DirectoryPinningFailed {
            directory: dir.clone(),
            conflicting: path.clone(),
        };
        if table.entries.get(dir).is_some_and(|e| e.held_by_other(tx)) {
            return Err(conflict(dir));
        }
        let prefix = dir.descendant_prefix();
        let range = table
            .entries
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(path, _)| path.as_str().starts_with(&prefix));
        for (path, entry) in range {
            if path != dir && (entry.held_by_other(tx) || entry.pinned_by_other(tx)) {
                return Err(conflict(path));
            }
        }

        table.entries.entry(dir.clone()).or_default().pin = Some(tx);
        table.held.entry(tx).or_default().insert(dir.clone());
        debug!(%tx, %dir, "directory pinned");
        Ok(())
    }

    /// Releases the pin `tx` holds on `dir`, if any.
    pub fn release_pin(&self, tx: TransactionId, dir: &ResourcePath) {
        let mut table = self.table.lock();
        if let Some(entry) = table.entries.get_mut(dir) {
            if entry.pin == Some(tx) {
                entry.pin = None;
            }
        }
        table.forget_if_unheld(tx, dir);
        drop(table);
        self.wakeup.notify_all();
    }

    /// Releases every lock and pin held by `tx`.
    pub fn release_all(&self, tx: TransactionId) {
        let mut table = self.table.lock();
        let paths = table.held.remove(&tx).unwrap_or_default();
        let released = paths.len();
        for path in &paths {
            if let Some(entry) = table.entries.get_mut(path) {
                if entry.exclusive == Some(tx) {
                    entry.exclusive = None;
                }
                if entry.pin == Some(tx) {
                    entry.pin = None;
                }
                entry.shared.remove(&tx);
            }
            table.drop_if_idle(path);
        }
        table.interrupts.remove(&tx);
        drop(table);
        if released > 0 {
            trace!(%tx, released, "released all locks");
        }
        self.wakeup.notify_all();
    }

    /// Interrupts the lock wait of `tx`. Returns false if it is not waiting.
    pub fn interrupt(&self, tx: TransactionId, reason: WaitInterrupt) -> bool {
        let mut table = self.table.lock();
        if !table.waiting.contains_key(&tx) {
            return false;
        }
        table.interrupts.insert(tx, reason);
        drop(table);
        self.wakeup.notify_all();
        true
    }

    /// Interrupts every waiter, used at shutdown.
    pub fn interrupt_all(&self) {
        let mut table = self.table.lock();
        let waiters: Vec<_> = table.waiting.keys().copied().collect();
        for tx in waiters {
            table.interrupts.insert(tx, WaitInterrupt::Cancelled);
        }
        drop(table);
        self.wakeup.notify_all();
    }

    /// Runs a full detection pass over all waiters and interrupts one
    /// victim per cycle found. Returns the victims.
    pub fn detect_deadlocks(&self) -> Vec<TransactionId> {
        let mut table = self.table.lock();
        let mut victims = Vec::new();
        let mut waiters: Vec<_> = table.waiting.keys().copied().collect();
        waiters.sort();
        for waiter in waiters {
            if table.interrupts.contains_key(&waiter) {
                continue;
            }
            let victim = table
                .wait_for_graph()
                .cycle_through(waiter)
                .and_then(|cycle| choose_victim(&cycle));
            if let Some(victim) = victim {
                warn!(%victim, "deadlock detected by periodic pass");
                table.interrupts.insert(victim, WaitInterrupt::DeadlockVictim);
                victims.push(victim);
            }
        }
        drop(table);
        if !victims.is_empty() {
            self.wakeup.notify_all();
            self.notify_victims(&victims);
        }
        victims
    }

    fn notify_victims(&self, victims: &[TransactionId]) {
        if victims.is_empty() {
            return;
        }
        let handler = self.victim_handler.read().clone();
        if let Some(handler) = handler {
            for victim in victims {
                handler(*victim);
            }
        }
    }

    /// Returns the holders of `path`.
    #[must_use]
    pub fn holders(&self, path: &ResourcePath) -> LockHolders {
        let table = self.table.lock();
        table
            .entries
            .get(path)
            .map(|e| LockHolders {
                exclusive: e.exclusive,
                shared: e.shared.iter().copied().collect(),
                pin: e.pin,
            })
            .unwrap_or_default()
    }

    /// Returns the paths where `tx` holds a lock or pin.
    #[must_use]
    pub fn held_by(&self, tx: TransactionId) -> Vec<ResourcePath> {
        let table = self.table.lock();
        table
            .held
            .get(&tx)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns true if `tx` is blocked in [`acquire`](Self::acquire).
    #[must_use]
    pub fn is_waiting(&self, tx: TransactionId) -> bool {
        self.table.lock().waiting.contains_key(&tx)
    }

    /// Number of resources with any lock, pin or waiter.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.table.lock().entries.len()
    }
}
