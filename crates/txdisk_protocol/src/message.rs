//! Request and response messages.
//!
//! Every remote call is one [`Request`] answered by one [`Response`].
//! Sessions, XA resources and streams stay on the serving side and are
//! named by [`Handle`]s.

use crate::handles::Handle;
use serde::{Deserialize, Serialize};
use txdisk_core::{EndFlag, RecoverFlag, StartFlag, TxError, Vote, XaError, XaErrorCode, Xid};

/// A call from a remote client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Opens a local session.
    OpenSession {
        /// Whether the session's transactions raise file events.
        publish_events: bool,
    },
    /// Opens a session whose work belongs to XA branches.
    OpenXaSession,
    /// Closes a session, rolling back a local transaction still open.
    CloseSession {
        /// Session handle.
        session: Handle,
    },
    /// Sets the session's lock wait timeout.
    SetLockWaitTimeout {
        /// Session handle.
        session: Handle,
        /// Timeout in milliseconds.
        millis: u64,
    },
    /// Sets the session's transaction timeout.
    SetTransactionTimeout {
        /// Session handle.
        session: Handle,
        /// Timeout in seconds; zero restores the default.
        seconds: u32,
    },

    /// Creates a file or directory.
    CreateFile {
        /// Session handle.
        session: Handle,
        /// Absolute path.
        path: String,
        /// Create a directory instead of a file.
        directory: bool,
    },
    /// Deletes a file or an empty directory.
    DeleteFile {
        /// Session handle.
        session: Handle,
        /// Absolute path.
        path: String,
    },
    /// Copies a file.
    CopyFile {
        /// Session handle.
        session: Handle,
        /// Existing file.
        source: String,
        /// New file.
        destination: String,
    },
    /// Moves a file or directory.
    MoveFile {
        /// Session handle.
        session: Handle,
        /// Existing path.
        source: String,
        /// New path.
        destination: String,
    },
    /// Truncates a file.
    TruncateFile {
        /// Session handle.
        session: Handle,
        /// Absolute path.
        path: String,
        /// New length.
        length: u64,
    },
    /// Tests whether a path exists.
    FileExists {
        /// Session handle.
        session: Handle,
        /// Absolute path.
        path: String,
        /// Take an exclusive lock instead of a shared one.
        exclusive: bool,
    },
    /// Tests whether a path exists and is a directory.
    IsDirectory {
        /// Session handle.
        session: Handle,
        /// Absolute path.
        path: String,
        /// Take an exclusive lock instead of a shared one.
        exclusive: bool,
    },
    /// Lists a directory.
    ListFiles {
        /// Session handle.
        session: Handle,
        /// Directory path.
        path: String,
    },
    /// Returns a file's length.
    FileLength {
        /// Session handle.
        session: Handle,
        /// Absolute path.
        path: String,
        /// Take an exclusive lock instead of a shared one.
        exclusive: bool,
    },

    /// Opens a stream for reading.
    OpenInputStream {
        /// Session handle.
        session: Handle,
        /// File to read.
        path: String,
        /// Take an exclusive lock instead of a shared one.
        exclusive: bool,
    },
    /// Opens a stream that appends to a file.
    OpenOutputStream {
        /// Session handle.
        session: Handle,
        /// File to append to.
        path: String,
        /// Hint that the stream will write a lot of data.
        heavy_write: bool,
    },
    /// Reads up to `max_len` bytes.
    Read {
        /// Stream handle.
        stream: Handle,
        /// Most bytes to return.
        max_len: u32,
    },
    /// Skips input bytes.
    Skip {
        /// Stream handle.
        stream: Handle,
        /// Bytes to skip.
        count: u64,
    },
    /// Returns the bytes left in an input stream.
    Available {
        /// Stream handle.
        stream: Handle,
    },
    /// Appends bytes to an output stream.
    Write {
        /// Stream handle.
        stream: Handle,
        /// Bytes to append.
        data: Vec<u8>,
    },
    /// Flushes an output stream into the transaction.
    Flush {
        /// Stream handle.
        stream: Handle,
    },
    /// Closes a stream.
    CloseStream {
        /// Stream handle.
        stream: Handle,
    },

    /// Commits the session's local transaction.
    Commit {
        /// Session handle.
        session: Handle,
    },
    /// Rolls back the session's local transaction.
    Rollback {
        /// Session handle.
        session: Handle,
    },

    /// Associates the XA session with a branch.
    XaStart {
        /// XA session handle.
        session: Handle,
        /// Branch id.
        xid: Xid,
        /// Start flag.
        flag: StartFlag,
    },
    /// Dissociates the XA session from a branch.
    XaEnd {
        /// XA session handle.
        session: Handle,
        /// Branch id.
        xid: Xid,
        /// End flag.
        flag: EndFlag,
    },
    /// Prepares a branch.
    XaPrepare {
        /// XA session handle.
        session: Handle,
        /// Branch id.
        xid: Xid,
    },
    /// Commits a branch.
    XaCommit {
        /// XA session handle.
        session: Handle,
        /// Branch id.
        xid: Xid,
        /// Commit without a prior prepare.
        one_phase: bool,
    },
    /// Rolls back a branch.
    XaRollback {
        /// XA session handle.
        session: Handle,
        /// Branch id.
        xid: Xid,
    },
    /// Lists prepared branches.
    XaRecover {
        /// XA session handle.
        session: Handle,
        /// Scan flag.
        flag: RecoverFlag,
    },
    /// Forgets a heuristically completed branch.
    XaForget {
        /// XA session handle.
        session: Handle,
        /// Branch id.
        xid: Xid,
    },
    /// Sets the timeout applied to branches started later.
    XaSetTimeout {
        /// XA session handle.
        session: Handle,
        /// Timeout in seconds; zero restores the default.
        seconds: i64,
    },
    /// Returns the branch timeout in seconds.
    XaGetTimeout {
        /// XA session handle.
        session: Handle,
    },

    /// Lists transactions whose commit could not be applied.
    FailedTransactions,
    /// Marks a failed transaction as handled by an administrator.
    DeclareComplete {
        /// Binary transaction identifier from [`Response::Identifiers`].
        identifier: Vec<u8>,
    },
}

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// The call succeeded with nothing to return.
    Done,
    /// A new session.
    Session(Handle),
    /// A new stream.
    Stream(Handle),
    /// A yes/no answer.
    Bool(bool),
    /// A length, count or position.
    Length(u64),
    /// Directory entries.
    Names(Vec<String>),
    /// Bytes read; empty at end of file.
    Bytes(Vec<u8>),
    /// Outcome of an XA prepare.
    Vote(Vote),
    /// Branch ids from an XA recover scan.
    Xids(Vec<Xid>),
    /// Binary transaction identifiers.
    Identifiers(Vec<Vec<u8>>),
    /// The call failed.
    Error(RemoteError),
}

/// A failure reported to the remote client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// What went wrong, for the client to branch on.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl RemoteError {
    /// Creates an error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Error categories carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The path does not exist.
    FileNotExists,
    /// The path already exists.
    FileAlreadyExists,
    /// The directory has children.
    DirectoryNotEmpty,
    /// The operating system denied access.
    InsufficientPermission,
    /// A lock wait timed out, was broken for deadlock, or was refused
    /// because of a pinned directory.
    Locking,
    /// The stream was closed.
    ClosedStream,
    /// A path or argument was rejected.
    InvalidArgument,
    /// The session has no transaction.
    NoTransactionAssociated,
    /// The transaction was rolled back by the engine.
    TransactionRolledBack,
    /// The transaction's commit could not be applied.
    TransactionFailed,
    /// The engine is still recovering.
    RecoveryInProgress,
    /// The engine is shutting down or has failed.
    NoMoreAvailable,
    /// The handle does not name a live object of the expected type.
    UnknownHandle,
    /// An XA call failed with this code.
    Xa(XaErrorCode),
    /// Any other engine failure.
    System,
}

impl From<&TxError> for ErrorKind {
    fn from(err: &TxError) -> Self {
        match err {
            TxError::FileNotExists(_) => Self::FileNotExists,
            TxError::FileAlreadyExists(_) => Self::FileAlreadyExists,
            TxError::DirectoryNotEmpty(_) => Self::DirectoryNotEmpty,
            TxError::InsufficientPermission(_) => Self::InsufficientPermission,
            e if e.is_locking_failure() => Self::Locking,
            TxError::ClosedStream => Self::ClosedStream,
            TxError::InvalidPath(_) | TxError::InvalidArgument { .. } => Self::InvalidArgument,
            TxError::NoTransactionAssociated => Self::NoTransactionAssociated,
            TxError::TransactionRolledBack { .. } => Self::TransactionRolledBack,
            TxError::TransactionFailed { .. } => Self::TransactionFailed,
            TxError::RecoveryInProgress => Self::RecoveryInProgress,
            TxError::NoMoreAvailable => Self::NoMoreAvailable,
            _ => Self::System,
        }
    }
}

impl From<TxError> for RemoteError {
    fn from(err: TxError) -> Self {
        Self::new(ErrorKind::from(&err), err.to_string())
    }
}

impl From<XaError> for RemoteError {
    fn from(err: XaError) -> Self {
        Self::new(ErrorKind::Xa(err.code), err.to_string())
    }
}

impl From<TxError> for Response {
    fn from(err: TxError) -> Self {
        Response::Error(err.into())
    }
}

impl From<XaError> for Response {
    fn from(err: XaError) -> Self {
        Response::Error(err.into())
    }
}
