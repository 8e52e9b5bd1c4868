//! Lookup tables for live and failed transactions.

use super::state::{Transaction, TransactionState};
use crate::types::{TransactionId, TransactionIdentifier, Xid};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Tables {
    by_id: HashMap<TransactionId, Arc<Transaction>>,
    by_ident: HashMap<TransactionIdentifier, TransactionId>,
    failed: BTreeMap<TransactionIdentifier, Arc<Transaction>>,
}

/// Every transaction that has not reached a clean end.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    tables: RwLock<Tables>,
}

impl TransactionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a transaction. Returns false if its identifier is taken.
    pub fn insert(&self, tx: Arc<Transaction>) -> bool {
        let mut tables = self.tables.write();
        if tables.by_ident.contains_key(tx.ident()) {
            return false;
        }
        tables.by_ident.insert(tx.ident().clone(), tx.id());
        tables.by_id.insert(tx.id(), tx);
        true
    }

    /// Forgets a transaction that ended.
    pub fn remove(&self, tx: &Transaction) {
        let mut tables = self.tables.write();
        tables.by_id.remove(&tx.id());
        tables.by_ident.remove(tx.ident());
    }

    /// Moves a transaction to the failed registry.
    pub fn mark_failed(&self, tx: &Arc<Transaction>) {
        self.tables
            .write()
            .failed
            .insert(tx.ident().clone(), Arc::clone(tx));
    }

    /// Looks up a failed transaction.
    #[must_use]
    pub fn failed(&self, ident: &TransactionIdentifier) -> Option<Arc<Transaction>> {
        self.tables.read().failed.get(ident).cloned()
    }

    /// Removes a transaction from both tables once it is declared
    /// complete.
    pub fn take_failed(&self, ident: &TransactionIdentifier) -> Option<Arc<Transaction>> {
        let mut tables = self.tables.write();
        let tx = tables.failed.remove(ident)?;
        tables.by_id.remove(&tx.id());
        tables.by_ident.remove(ident);
        Some(tx)
    }

    /// Looks up by internal id.
    #[must_use]
    pub fn get(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        self.tables.read().by_id.get(&id).cloned()
    }

    /// Looks up by stable identifier.
    #[must_use]
    pub fn by_ident(&self, ident: &TransactionIdentifier) -> Option<Arc<Transaction>> {
        let tables = self.tables.read();
        tables
            .by_ident
            .get(ident)
            .and_then(|id| tables.by_id.get(id))
            .cloned()
    }

    /// Looks up a global branch.
    #[must_use]
    pub fn by_xid(&self, xid: &Xid) -> Option<Arc<Transaction>> {
        self.by_ident(&TransactionIdentifier::Global(xid.clone()))
    }

    /// Snapshot of every registered transaction.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Transaction>> {
        self.tables.read().by_id.values().cloned().collect()
    }

    /// Branches that are prepared and wait for a decision, sorted.
    #[must_use]
    pub fn prepared_xids(&self) -> Vec<Xid> {
        let mut xids: Vec<Xid> = self
            .tables
            .read()
            .by_id
            .values()
            .filter(|tx| tx.state() == TransactionState::Prepared)
            .filter_map(|tx| tx.ident().xid().cloned())
            .collect();
        xids.sort();
        xids
    }

    /// Identifiers of failed transactions, sorted.
    #[must_use]
    pub fn failed_idents(&self) -> Vec<TransactionIdentifier> {
        self.tables.read().failed.keys().cloned().collect()
    }

    /// Number of failed transactions.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.tables.read().failed.len()
    }

    /// Number of registered transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().by_id.len()
    }

    /// True if no transaction is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tx(id: u64, ident: TransactionIdentifier) -> Arc<Transaction> {
        Arc::new(Transaction::new(
            TransactionId::new(id),
            ident,
            Duration::from_secs(10),
            false,
            None,
        ))
    }

    #[test]
    fn duplicate_identifier_is_rejected() {
        let registry = TransactionRegistry::new();
        let xid = Xid::new(1, b"g".to_vec(), b"b".to_vec());
        assert!(registry.insert(tx(1, xid.clone().into())));
        assert!(!registry.insert(tx(2, xid.clone().into())));
        assert_eq!(registry.by_xid(&xid).map(|t| t.id()), Some(TransactionId::new(1)));
    }

    #[test]
    fn prepared_branches_are_listed() {
        let registry = TransactionRegistry::new();
        let a = tx(1, Xid::new(1, b"a".to_vec(), b"".to_vec()).into());
        let b = tx(2, Xid::new(1, b"b".to_vec(), b"".to_vec()).into());
        let local = tx(3, TransactionIdentifier::Local(7));
        a.set_state(TransactionState::Prepared);
        local.set_state(TransactionState::Prepared);
        registry.insert(a);
        registry.insert(b);
        registry.insert(local);
        assert_eq!(registry.prepared_xids(), vec![Xid::new(1, b"a".to_vec(), b"".to_vec())]);
    }

    #[test]
    fn failed_transactions_stay_until_taken() {
        let registry = TransactionRegistry::new();
        let t = tx(1, TransactionIdentifier::Local(1));
        registry.insert(Arc::clone(&t));
        registry.mark_failed(&t);
        assert_eq!(registry.failed_idents(), vec![TransactionIdentifier::Local(1)]);
        assert!(registry.take_failed(&TransactionIdentifier::Local(1)).is_some());
        assert!(registry.is_empty());
        assert_eq!(registry.failed_count(), 0);
    }
}
