//! Instance directory layout.
//!
//! ```text
//! <instance_dir>/
//! ├─ LOCK              # advisory lock, one engine per directory
//! ├─ logs/             # txlog_NNNNNNNN segments
//! ├─ deadletter/       # letter_N files
//! └─ data/             # default root of the managed tree
//! ```

use crate::error::{TxError, TxResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use txdisk_storage::DirSegmentStore;

const LOCK_FILE: &str = "LOCK";
const LOGS_DIR: &str = "logs";
const DEAD_LETTER_DIR: &str = "deadletter";

/// The directory one engine instance owns, held under an exclusive lock
/// until [`unlock`](Self::unlock) or drop.
#[derive(Debug)]
pub struct InstanceDir {
    path: PathBuf,
    lock_file: Option<File>,
}

impl InstanceDir {
    /// Creates the layout if missing and takes the directory lock.
    ///
    /// # Errors
    ///
    /// - [`TxError::InstanceLocked`] if another engine holds the directory.
    /// - [`TxError::BootFailure`] if `path` exists but is not a directory.
    /// - An I/O error if the layout cannot be created.
    pub fn open(path: &Path) -> TxResult<Self> {
        if path.exists() && !path.is_dir() {
            return Err(TxError::boot_failure(format!(
                "instance path is not a directory: {}",
                path.display()
            )));
        }
        fs::create_dir_all(path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(TxError::InstanceLocked);
        }

        fs::create_dir_all(path.join(LOGS_DIR))?;
        fs::create_dir_all(path.join(DEAD_LETTER_DIR))?;
        debug!(dir = %path.display(), "instance directory locked");
        Ok(Self {
            path: path.to_path_buf(),
            lock_file: Some(lock_file),
        })
    }

    /// Root of the instance directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding log segments.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.path.join(LOGS_DIR)
    }

    /// Directory holding dead-letter files.
    #[must_use]
    pub fn dead_letter_dir(&self) -> PathBuf {
        self.path.join(DEAD_LETTER_DIR)
    }

    /// Segment store over [`logs_dir`](Self::logs_dir).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be opened.
    pub fn segment_store(&self) -> TxResult<DirSegmentStore> {
        Ok(DirSegmentStore::new(&self.logs_dir())?)
    }

    /// Releases the directory lock. Later calls do nothing.
    pub fn unlock(&mut self) {
        if let Some(file) = self.lock_file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(error = %e, "could not release instance lock");
            }
            debug!(dir = %self.path.display(), "instance directory unlocked");
        }
    }

    /// True while the lock is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock_file.is_some()
    }
}

impl Drop for InstanceDir {
    fn drop(&mut self) {
        self.unlock();
    }
}
