//! Transactions and their lifecycle.
//!
//! A local transaction goes ACTIVE → COMMITTING → COMMITTED. A global
//! branch goes ACTIVE → PREPARING → PREPARED → COMMITTING → COMMITTED.
//! Either can end in ROLLEDBACK, and a commit that cannot be finished
//! leaves the transaction FAILED.

mod manager;
mod registry;
mod state;

pub use manager::{IdCounters, TransactionManager, Vote};
pub use registry::TransactionRegistry;
pub use state::{Transaction, TransactionState, TransactionWork};
