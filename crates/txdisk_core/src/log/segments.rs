//! Segment reference bookkeeping.

use crate::types::TransactionIdentifier;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Something that keeps log entries alive until it finishes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogOwner {
    /// A transaction, until its terminal entry is durable.
    Transaction(TransactionIdentifier),
    /// A queued event, until its dequeue completes.
    Event(u64),
}

impl fmt::Display for LogOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transaction(ident) => ident.fmt(f),
            Self::Event(id) => write!(f, "event:{id}"),
        }
    }
}

/// Which owners reference which segments.
///
/// Segments are reclaimed oldest first: a segment is handed back only when
/// it and every older segment have no owners and it is not the active one.
/// Replay therefore never sees a decision entry whose earlier entries were
/// already removed.
#[derive(Debug, Default)]
pub struct SegmentTracker {
    refs: BTreeMap<u64, BTreeSet<LogOwner>>,
    owners: HashMap<LogOwner, BTreeSet<u64>>,
    active: u64,
}

impl SegmentTracker {
    /// Tracks `existing` segments plus the new `active` one.
    #[must_use]
    pub fn new(existing: &[u64], active: u64) -> Self {
        let mut refs: BTreeMap<u64, BTreeSet<LogOwner>> =
            existing.iter().map(|s| (*s, BTreeSet::new())).collect();
        refs.entry(active).or_default();
        Self {
            refs,
            owners: HashMap::new(),
            active,
        }
    }

    /// The segment new entries go to.
    #[must_use]
    pub fn active(&self) -> u64 {
        self.active
    }

    /// Counts `owner` against `segment`. Repeated calls are no-ops.
    pub fn reference(&mut self, segment: u64, owner: &LogOwner) {
        if self.refs.entry(segment).or_default().insert(owner.clone()) {
            self.owners.entry(owner.clone()).or_default().insert(segment);
        }
    }

    /// Drops every reference held by `owner` and returns the segments
    /// that became reclaimable.
    pub fn release(&mut self, owner: &LogOwner) -> Vec<u64> {
        if let Some(segments) = self.owners.remove(owner) {
            for segment in segments {
                if let Some(set) = self.refs.get_mut(&segment) {
                    set.remove(owner);
                }
            }
        }
        self.take_reclaimable()
    }

    /// Makes `next` the active segment and returns reclaimable segments.
    pub fn rotate(&mut self, next: u64) -> Vec<u64> {
        self.active = next;
        self.refs.entry(next).or_default();
        self.take_reclaimable()
    }

    /// Removes and returns the unreferenced prefix of inactive segments.
    pub fn take_reclaimable(&mut self) -> Vec<u64> {
        let mut reclaimed = Vec::new();
        while let Some(entry) = self.refs.first_entry() {
            if *entry.key() >= self.active || !entry.get().is_empty() {
                break;
            }
            reclaimed.push(entry.remove_entry().0);
        }
        reclaimed
    }

    /// Number of owners referencing `segment`.
    #[must_use]
    pub fn ref_count(&self, segment: u64) -> usize {
        self.refs.get(&segment).map_or(0, BTreeSet::len)
    }

    /// Segments still tracked, oldest first.
    #[must_use]
    pub fn segments(&self) -> Vec<u64> {
        self.refs.keys().copied().collect()
    }

    /// Returns true if `owner` holds any reference.
    #[must_use]
    pub fn is_live(&self, owner: &LogOwner) -> bool {
        self.owners.contains_key(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(n: u64) -> LogOwner {
        LogOwner::Transaction(TransactionIdentifier::Local(n))
    }

    #[test]
    fn unreferenced_old_segments_are_reclaimed() {
        let mut tracker = SegmentTracker::new(&[1, 2], 3);
        tracker.reference(2, &tx(1));
        assert_eq!(tracker.take_reclaimable(), vec![1]);
        assert_eq!(tracker.segments(), vec![2, 3]);
    }

    #[test]
    fn active_segment_is_never_reclaimed() {
        let mut tracker = SegmentTracker::new(&[], 1);
        tracker.reference(1, &tx(1));
        assert!(tracker.release(&tx(1)).is_empty());
        assert_eq!(tracker.rotate(2), vec![1]);
    }

    #[test]
    fn reclaim_stops_at_first_referenced_segment() {
        let mut tracker = SegmentTracker::new(&[1, 2, 3], 4);
        tracker.reference(1, &tx(1));
        tracker.reference(3, &LogOwner::Event(5));
        assert!(tracker.take_reclaimable().is_empty());
        assert_eq!(tracker.release(&tx(1)), vec![1, 2]);
        assert_eq!(tracker.release(&LogOwner::Event(5)), vec![3]);
    }

    #[test]
    fn references_are_counted_once_per_owner() {
        let mut tracker = SegmentTracker::new(&[], 1);
        tracker.reference(1, &tx(1));
        tracker.reference(1, &tx(1));
        tracker.reference(1, &tx(2));
        assert_eq!(tracker.ref_count(1), 2);
        tracker.release(&tx(1));
        assert_eq!(tracker.ref_count(1), 1);
        assert!(!tracker.is_live(&tx(1)));
        assert!(tracker.is_live(&tx(2)));
    }
}
