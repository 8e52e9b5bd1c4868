//! Crash recovery.
//!
//! Boot reads the whole log once and sorts every transaction it finds
//! into one of four outcomes:
//!
//! | Found in the log                        | Outcome                      |
//! |-----------------------------------------|------------------------------|
//! | `Completed` or `Rollback`               | finished, nothing to do      |
//! | `Commit` without `Completed`            | re-applied from checkpoint   |
//! | `Prepare` without a decision            | in doubt, waits for the TM   |
//! | neither `Prepare` nor `Commit`          | rolled back, entries dropped |
//!
//! Events are live when the transaction that raised them committed, and
//! they are queued again unless a committed delivery already dequeued
//! them.

use crate::error::{TxError, TxResult};
use crate::log::{Effect, LogEntry, LogOwner, LogScanner, QueuedEvent};
use crate::transaction::{IdCounters, Transaction, TransactionManager, TransactionState, TransactionWork};
use crate::types::{LockMode, TransactionIdentifier};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use txdisk_storage::SegmentStore;

#[derive(Debug, Default)]
struct ScanRecord {
    prepared: Option<Vec<Effect>>,
    committed: Option<Vec<Effect>>,
    rolled_back: bool,
    completed: bool,
    checkpoint: u32,
    segments: BTreeSet<u64>,
    events: Vec<(u64, QueuedEvent)>,
    dequeue: Option<u64>,
}

impl ScanRecord {
    fn is_terminal(&self) -> bool {
        self.completed || self.rolled_back
    }

    /// Starts over when an identifier is reused after it finished,
    /// keeping what the finished use committed.
    fn reset_if_finished(&mut self, outcomes: &mut CommittedOutcomes) {
        if self.is_terminal() {
            outcomes.record(&std::mem::take(self));
        }
    }
}

/// Events raised and dequeued by committed transactions.
#[derive(Debug, Default)]
struct CommittedOutcomes {
    /// Raised events with the segment holding their enqueue entry.
    events: Vec<(u64, QueuedEvent)>,
    /// Dequeued event ids, and whether the delivery also completed.
    dequeued: HashMap<u64, bool>,
}

impl CommittedOutcomes {
    fn record(&mut self, record: &ScanRecord) {
        if record.committed.is_none() {
            return;
        }
        self.events.extend(record.events.iter().cloned());
        if let Some(event_id) = record.dequeue {
            self.dequeued.insert(event_id, record.completed);
        }
    }
}

/// A prepared branch with no decision in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InDoubtBranch {
    /// Branch identifier.
    pub ident: TransactionIdentifier,
    /// Effects from the prepare record.
    pub effects: Vec<Effect>,
    /// Events logged with the prepare record.
    pub events: Vec<QueuedEvent>,
}

/// A committed transaction whose effects may not all be on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRedo {
    /// Transaction identifier.
    pub ident: TransactionIdentifier,
    /// All of its effects.
    pub effects: Vec<Effect>,
    /// Effects known to be applied, from the last checkpoint.
    pub applied: usize,
    /// The event it dequeues, for delivery transactions.
    pub dequeue: Option<u64>,
}

/// What the log says must happen before new work is admitted.
#[derive(Debug, Default)]
pub struct RecoveryPlan {
    /// Segment references to seed the log writer with.
    pub references: Vec<(u64, LogOwner)>,
    /// Branches waiting for an external decision.
    pub in_doubt: Vec<InDoubtBranch>,
    /// Committed transactions to finish.
    pub redo: Vec<PendingRedo>,
    /// Committed events not yet durably dequeued.
    pub live_events: Vec<QueuedEvent>,
    /// Transactions dropped because they never reached a decision.
    pub abandoned: Vec<TransactionIdentifier>,
    /// Counters continuing after the largest ids in the log.
    pub counters: IdCounters,
    /// Entries read.
    pub entries: usize,
    /// Segments that ended in a partial entry.
    pub torn_tails: Vec<(u64, u64)>,
}

impl RecoveryPlan {
    /// Reads every segment of `store` and builds the plan.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::LogCorruption`] for a damaged entry, or a
    /// storage error.
    pub fn scan(store: Arc<dyn SegmentStore>) -> TxResult<Self> {
        let mut scanner = LogScanner::new(store)?;
        let mut records: HashMap<TransactionIdentifier, ScanRecord> = HashMap::new();
        let mut order: Vec<TransactionIdentifier> = Vec::new();
        let mut max_local = 0;
        let mut max_event = 0;
        let mut entries = 0;
        let mut outcomes = CommittedOutcomes::default();

        for item in scanner.by_ref() {
            let (position, entry) = item?;
            entries += 1;
            let ident = entry.ident().clone();
            if let TransactionIdentifier::Local(n) = ident {
                max_local = max_local.max(n);
            }
            let record = records.entry(ident.clone()).or_insert_with(|| {
                order.push(ident.clone());
                ScanRecord::default()
            });
            match entry {
                LogEntry::Prepare { effects, .. } => {
                    record.reset_if_finished(&mut outcomes);
                    record.prepared = Some(effects);
                }
                LogEntry::Commit { effects, .. } => {
                    record.reset_if_finished(&mut outcomes);
                    record.committed = Some(effects);
                }
                LogEntry::EventEnqueue { events, .. } => {
                    record.reset_if_finished(&mut outcomes);
                    for event in events {
                        max_event = max_event.max(event.id);
                        record.events.push((position.segment, event));
                    }
                }
                LogEntry::EventDequeue { event_id, .. } => {
                    record.reset_if_finished(&mut outcomes);
                    max_event = max_event.max(event_id);
                    record.dequeue = Some(event_id);
                }
                LogEntry::Rollback { .. } => record.rolled_back = true,
                LogEntry::Checkpoint { applied, .. } => record.checkpoint = applied,
                LogEntry::Completed { .. } => record.completed = true,
            }
            record.segments.insert(position.segment);
        }

        let mut plan = Self {
            counters: IdCounters {
                next_transaction: 1,
                next_local: max_local + 1,
                next_event: max_event + 1,
            },
            entries,
            torn_tails: scanner.torn_tails().to_vec(),
            ..Self::default()
        };

        for record in order.iter().filter_map(|ident| records.get(ident)) {
            outcomes.record(record);
        }
        for (segment, event) in &outcomes.events {
            match outcomes.dequeued.get(&event.id) {
                Some(true) => {}
                Some(false) => plan.references.push((*segment, LogOwner::Event(event.id))),
                None => {
                    plan.references.push((*segment, LogOwner::Event(event.id)));
                    plan.live_events.push(event.clone());
                }
            }
        }

        for ident in order {
            let Some(record) = records.remove(&ident) else {
                continue;
            };
            let owner = LogOwner::Transaction(ident.clone());

            if record.is_terminal() {
                continue;
            }
            match (record.committed, record.prepared) {
                (Some(committed), prepared) => {
                    let effects = if committed.is_empty() {
                        prepared.unwrap_or_default()
                    } else {
                        committed
                    };
                    plan.references
                        .extend(record.segments.iter().map(|s| (*s, owner.clone())));
                    plan.redo.push(PendingRedo {
                        ident,
                        applied: (record.checkpoint as usize).min(effects.len()),
                        effects,
                        dequeue: record.dequeue,
                    });
                }
                (None, Some(effects)) => {
                    plan.references
                        .extend(record.segments.iter().map(|s| (*s, owner.clone())));
                    let events: Vec<QueuedEvent> = record.events.iter().map(|(_, e)| e.clone()).collect();
                    for (segment, event) in &record.events {
                        plan.references.push((*segment, LogOwner::Event(event.id)));
                    }
                    plan.in_doubt.push(InDoubtBranch { ident, effects, events });
                }
                (None, None) => plan.abandoned.push(ident),
            }
        }
        plan.live_events.sort_by_key(|e| e.id);

        info!(
            entries = plan.entries,
            in_doubt = plan.in_doubt.len(),
            redo = plan.redo.len(),
            live_events = plan.live_events.len(),
            abandoned = plan.abandoned.len(),
            "log scanned"
        );
        for (segment, offset) in &plan.torn_tails {
            warn!(segment, offset, "segment ends in a partial entry");
        }
        Ok(plan)
    }

    /// True if nothing needs to be done.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.in_doubt.is_empty() && self.redo.is_empty() && self.live_events.is_empty()
    }
}

fn lock_effect_paths(manager: &TransactionManager, tx: &Transaction, effects: &[Effect]) -> TxResult<()> {
    let paths: BTreeSet<_> = effects.iter().flat_map(Effect::paths).cloned().collect();
    for path in &paths {
        manager
            .locks()
            .acquire(tx.id(), path, LockMode::Exclusive, Duration::from_secs(1))?;
    }
    Ok(())
}

/// Rebuilds in-doubt branches and the transactions to redo, taking the
/// exclusive locks of their effects. Returns the transactions to redo.
///
/// # Errors
///
/// Returns [`TxError::BootFailure`] if a lock cannot be taken, which means
/// two unfinished transactions in the log claim the same path.
pub fn restore(manager: &TransactionManager, plan: &RecoveryPlan) -> TxResult<Vec<Arc<Transaction>>> {
    for branch in &plan.in_doubt {
        let work = TransactionWork {
            prepared: branch.effects.clone(),
            prepared_events: branch.events.clone(),
            ..TransactionWork::default()
        };
        let tx = Arc::new(Transaction::recovered(
            manager.allocate_id(),
            branch.ident.clone(),
            TransactionState::Prepared,
            work,
            None,
        ));
        lock_effect_paths(manager, &tx, &branch.effects)
            .map_err(|e| TxError::boot_failure(format!("cannot lock in-doubt {}: {e}", branch.ident)))?;
        manager.adopt(tx);
        info!(ident = %branch.ident, "in-doubt branch restored");
    }

    let mut redo = Vec::with_capacity(plan.redo.len());
    for pending in &plan.redo {
        let work = TransactionWork {
            prepared: pending.effects.clone(),
            applied: pending.applied,
            ..TransactionWork::default()
        };
        let tx = Arc::new(Transaction::recovered(
            manager.allocate_id(),
            pending.ident.clone(),
            TransactionState::Committing,
            work,
            pending.dequeue,
        ));
        lock_effect_paths(manager, &tx, &pending.effects)
            .map_err(|e| TxError::boot_failure(format!("cannot lock {}: {e}", pending.ident)))?;
        manager.adopt(Arc::clone(&tx));
        redo.push(tx);
    }
    Ok(redo)
}

/// Finishes committed transactions. Returns the identifiers of those that
/// failed and now wait in the failed registry.
pub fn redo_all(manager: &TransactionManager, transactions: &[Arc<Transaction>]) -> Vec<TransactionIdentifier> {
    let mut failed = Vec::new();
    for tx in transactions {
        let mut work = tx.work();
        match manager.redo(tx, &mut work) {
            Ok(()) => debug!(ident = %tx.ident(), "committed transaction finished"),
            Err(e) => {
                warn!(ident = %tx.ident(), error = %e, "recovery could not finish transaction");
                failed.push(tx.ident().clone());
            }
        }
    }
    failed
}

/// Summary of a plan per identifier, for tools that only inspect.
#[must_use]
pub fn describe(plan: &RecoveryPlan) -> BTreeMap<String, &'static str> {
    let mut out = BTreeMap::new();
    for branch in &plan.in_doubt {
        out.insert(branch.ident.to_string(), "in-doubt");
    }
    for pending in &plan.redo {
        out.insert(pending.ident.to_string(), "committed-incomplete");
    }
    for ident in &plan.abandoned {
        out.insert(ident.to_string(), "abandoned");
    }
    out
}
