//! Resource locking.
//!
//! Every resource path can carry shared locks, one exclusive lock and a
//! pin. A pin on a directory keeps every other transaction away from the
//! whole subtree; it is taken by directory moves and deletes.

mod graph;
mod manager;

pub use graph::{choose_victim, WaitForGraph};
pub use manager::{LockGrant, LockHolders, LockManager, VictimHandler, WaitInterrupt};
