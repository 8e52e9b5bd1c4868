//! Wait-for graph used for deadlock detection.

use crate::types::TransactionId;
use std::collections::{BTreeMap, BTreeSet};

/// A snapshot of which transaction waits for which.
///
/// An edge `a -> b` means `a` is blocked on a lock `b` holds. The graph is
/// rebuilt from the lock table under the table mutex, so it is always
/// consistent with the holders and waiters it was built from.
#[derive(Debug, Default, Clone)]
pub struct WaitForGraph {
    edges: BTreeMap<TransactionId, BTreeSet<TransactionId>>,
}

impl WaitForGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `waiter` is blocked by `holder`.
    pub fn add_edge(&mut self, waiter: TransactionId, holder: TransactionId) {
        if waiter != holder {
            self.edges.entry(waiter).or_default().insert(holder);
        }
    }

    /// Returns the transactions `waiter` is blocked by.
    pub fn blockers(&self, waiter: TransactionId) -> impl Iterator<Item = TransactionId> + '_ {
        self.edges.get(&waiter).into_iter().flatten().copied()
    }

    /// Returns true if nobody waits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Finds a cycle that passes through `start`.
    ///
    /// The returned members are in wait order beginning with `start`.
    #[must_use]
    pub fn cycle_through(&self, start: TransactionId) -> Option<Vec<TransactionId>> {
        let mut visited = BTreeSet::from([start]);
        let mut stack: Vec<(TransactionId, usize)> = vec![(start, 0)];

        while let Some((node, next_child)) = stack.last_mut() {
            let child = self.edges.get(node).and_then(|s| s.iter().nth(*next_child)).copied();
            *next_child += 1;
            match child {
                Some(child) if child == start => {
                    return Some(stack.iter().map(|(n, _)| *n).collect());
                }
                Some(child) => {
                    if visited.insert(child) {
                        stack.push((child, 0));
                    }
                }
                None => {
                    stack.pop();
                }
            }
        }
        None
    }
}

/// Picks the deadlock victim: the youngest member, i.e. the highest
/// sequence number.
#[must_use]
pub fn choose_victim(cycle: &[TransactionId]) -> Option<TransactionId> {
    cycle.iter().copied().max()
}
