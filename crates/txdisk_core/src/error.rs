//! Error types for the txdisk engine.
//!
//! Errors fall into two tiers. Application errors describe an expected
//! condition the caller can branch on (a missing file, a lock that could
//! not be had); they never change the state of other transactions. System
//! errors mean the transaction or the whole engine cannot continue
//! normally. [`TxError::is_system`] tells them apart.

use crate::path::ResourcePath;
use crate::types::{RollbackCause, TransactionIdentifier};
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type TxResult<T> = Result<T, TxError>;

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum TxError {
    /// The path does not exist in the transaction's view.
    #[error("file does not exist: {0}")]
    FileNotExists(ResourcePath),

    /// The path already exists in the transaction's view.
    #[error("file already exists: {0}")]
    FileAlreadyExists(ResourcePath),

    /// A directory still has children.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(ResourcePath),

    /// The operating system denies the requested access.
    #[error("insufficient permission on {0}")]
    InsufficientPermission(ResourcePath),

    /// A lock could not be had within the lock wait timeout.
    #[error("timed out waiting for a lock on {0}")]
    LockingTimedOut(ResourcePath),

    /// The transaction was chosen to break a deadlock while waiting.
    #[error("deadlock victim while waiting for a lock on {0}")]
    DeadLockVictimized(ResourcePath),

    /// An ancestor directory is pinned by another transaction.
    #[error("cannot lock {path}: ancestor {ancestor} is pinned by another transaction")]
    AncestorPinned {
        /// The requested path.
        path: ResourcePath,
        /// The pinned ancestor.
        ancestor: ResourcePath,
    },

    /// A directory could not be pinned because another transaction holds a
    /// lock beneath it.
    #[error("cannot pin {directory}: {conflicting} is locked by another transaction")]
    DirectoryPinningFailed {
        /// The directory to pin.
        directory: ResourcePath,
        /// The conflicting descendant.
        conflicting: ResourcePath,
    },

    /// A lock wait was interrupted.
    #[error("lock wait on {0} was interrupted")]
    Interrupted(ResourcePath),

    /// An open stream conflicts with the requested operation.
    #[error("file is under use: {0}")]
    FileUnderUse(ResourcePath),

    /// A stream was used after being closed.
    #[error("stream is closed")]
    ClosedStream,

    /// The path is not a valid absolute resource path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// An argument is out of range.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong.
        message: String,
    },

    /// The session has no active transaction; the caller already ended it.
    #[error("no transaction associated with this session")]
    NoTransactionAssociated,

    /// The engine rolled the transaction back on its own.
    #[error("transaction was rolled back: {cause}")]
    TransactionRolledBack {
        /// Why the engine rolled back.
        cause: RollbackCause,
    },

    /// Boot did not complete.
    #[error("boot failed: {message}")]
    BootFailure {
        /// Description of the failure.
        message: String,
    },

    /// The engine is shut down or has failed.
    #[error("the engine is no longer available")]
    NoMoreAvailable,

    /// Recovery has not finished yet.
    #[error("recovery is still in progress")]
    RecoveryInProgress,

    /// Another process holds the instance directory.
    #[error("instance directory is locked by another process")]
    InstanceLocked,

    /// A transaction could not complete commit or rollback and keeps its
    /// locks until declared complete.
    #[error("transaction {id} failed: {message}")]
    TransactionFailed {
        /// Stable identifier for administrative completion.
        id: TransactionIdentifier,
        /// What went wrong.
        message: String,
    },

    /// The log could not be written after retries.
    #[error("transaction log failure: {message}")]
    LogFailure {
        /// Description of the failure.
        message: String,
    },

    /// A log segment holds bytes that are not a valid entry.
    #[error("log corruption in segment {segment} at offset {offset}: {message}")]
    LogCorruption {
        /// Segment number.
        segment: u64,
        /// Byte offset of the bad entry.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// Segment storage error.
    #[error("storage error: {0}")]
    Storage(#[from] txdisk_storage::StorageError),

    /// I/O error on the managed file tree.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TxError {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a boot failure error.
    pub fn boot_failure(message: impl Into<String>) -> Self {
        Self::BootFailure {
            message: message.into(),
        }
    }

    /// Creates a log failure error.
    pub fn log_failure(message: impl Into<String>) -> Self {
        Self::LogFailure {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(segment: u64, offset: u64, message: impl Into<String>) -> Self {
        Self::LogCorruption {
            segment,
            offset,
            message: message.into(),
        }
    }

    /// Creates a transaction failed error.
    pub fn transaction_failed(id: TransactionIdentifier, message: impl Into<String>) -> Self {
        Self::TransactionFailed {
            id,
            message: message.into(),
        }
    }

    /// Returns true for system-tier errors.
    #[must_use]
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            Self::BootFailure { .. }
                | Self::NoMoreAvailable
                | Self::RecoveryInProgress
                | Self::InstanceLocked
                | Self::TransactionFailed { .. }
                | Self::LogFailure { .. }
                | Self::LogCorruption { .. }
                | Self::Storage(_)
                | Self::Io(_)
        )
    }

    /// Returns true for every lock acquisition failure.
    #[must_use]
    pub fn is_locking_failure(&self) -> bool {
        matches!(
            self,
            Self::LockingTimedOut(_)
                | Self::DeadLockVictimized(_)
                | Self::AncestorPinned { .. }
                | Self::DirectoryPinningFailed { .. }
        )
    }

    /// Returns true if the error says the session has no live transaction.
    #[must_use]
    pub fn is_no_transaction(&self) -> bool {
        matches!(
            self,
            Self::NoTransactionAssociated | Self::TransactionRolledBack { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_disjoint() {
        let path = ResourcePath::parse("/x").unwrap();
        assert!(!TxError::LockingTimedOut(path.clone()).is_system());
        assert!(TxError::LockingTimedOut(path.clone()).is_locking_failure());
        assert!(!TxError::FileNotExists(path).is_system());
        assert!(TxError::RecoveryInProgress.is_system());
        assert!(TxError::log_failure("disk gone").is_system());
    }

    #[test]
    fn rolled_back_carries_cause() {
        let err = TxError::TransactionRolledBack {
            cause: RollbackCause::Timeout,
        };
        assert!(err.is_no_transaction());
        assert_eq!(err.to_string(), "transaction was rolled back: transaction timeout");
    }
}
