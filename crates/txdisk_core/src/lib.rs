//! # txdisk core
//!
//! ACID transactions over an ordinary directory tree.
//!
//! Clients open a [`Session`] and create, delete, copy, move, read and
//! write files under it. Changes stay in the transaction's workspace until
//! commit, when they are logged durably and then applied to disk. A crash
//! at any point leaves the tree either with or without the transaction.
//!
//! This crate provides:
//! - a lock manager with shared, exclusive and directory pin locks,
//!   deadlock detection and lock wait timeouts
//! - a segmented write-ahead log with group commit
//! - transaction workspaces with read-your-writes
//! - XA branches for two-phase commit with an external transaction manager
//! - boot-time recovery, including in-doubt branches
//! - a durable file-change event queue
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use txdisk_core::{Config, Engine};
//!
//! let engine = Engine::boot(Config::new("/var/lib/txdisk"))?;
//! engine.wait_for_bootup(Duration::from_secs(10))?;
//!
//! let session = engine.create_session()?;
//! session.create_file("/reports", true)?;
//! session.create_file("/reports/today.txt", false)?;
//! let mut out = session.open_output_stream("/reports/today.txt", false)?;
//! out.write_bytes(b"hello")?;
//! out.close();
//! session.commit()?;
//!
//! engine.shutdown();
//! # Ok::<(), txdisk_core::TxError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dir;
pub mod engine;
pub mod error;
pub mod events;
pub mod lock;
pub mod log;
pub mod path;
pub mod recovery;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod transaction;
pub mod types;
pub mod workspace;
pub mod xa;

pub use config::Config;
pub use engine::{Engine, EngineParts};
pub use error::{TxError, TxResult};
pub use events::{EventFilter, EventMask, EventSubscriber, FileStateChangeEvent, SubscriberError};
pub use path::ResourcePath;
pub use scheduler::{Job, ThreadScheduler, WorkScheduler};
pub use session::{InputStream, OutputStream, Session, SessionKind};
pub use store::{DiskStore, FileStore, NodeKind};
pub use transaction::{TransactionState, Vote};
pub use types::{LockMode, RollbackCause, TransactionId, TransactionIdentifier, Xid};
pub use xa::{EndFlag, RecoverFlag, StartFlag, XaError, XaErrorCode, XaResource, XaResult, XaSession};
