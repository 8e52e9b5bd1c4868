//! Engine configuration.

use crate::error::{TxError, TxResult};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for booting an engine instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory owned by this instance: log segments, lock file, dead letters.
    pub instance_dir: PathBuf,

    /// Physical root of the managed file tree. Defaults to
    /// `<instance_dir>/data`.
    pub data_root: Option<PathBuf>,

    /// Default lock wait for new sessions. Zero waits indefinitely.
    pub lock_wait_timeout: Duration,

    /// Default transaction timeout for new sessions.
    pub transaction_timeout: Duration,

    /// Interval of the periodic deadlock detection pass.
    pub deadlock_detector_interval: Duration,

    /// How often the timeout detector scans for expired transactions.
    pub timeout_check_interval: Duration,

    /// Active log segment size that triggers rotation.
    pub max_log_segment_size: u64,

    /// How long the flusher waits for more requests after the first one
    /// of a batch arrives.
    pub group_commit_window: Duration,

    /// A batch is flushed early once it holds this many bytes.
    pub group_commit_max_batch_bytes: usize,

    /// Attempts per batch before the log is declared failed.
    pub log_write_retries: u32,

    /// Upper bound on event deliveries running at once.
    pub max_concurrent_event_deliveries: usize,

    /// Run recovery work inside `boot` instead of on the scheduler.
    pub synchronous_recovery: bool,
}

impl Config {
    /// Creates a configuration with default values for `instance_dir`.
    #[must_use]
    pub fn new(instance_dir: impl Into<PathBuf>) -> Self {
        Self {
            instance_dir: instance_dir.into(),
            data_root: None,
            lock_wait_timeout: Duration::from_millis(10_000),
            transaction_timeout: Duration::from_secs(60),
            deadlock_detector_interval: Duration::from_secs(30),
            timeout_check_interval: Duration::from_secs(1),
            max_log_segment_size: 1_000_000_000,
            group_commit_window: Duration::from_millis(2),
            group_commit_max_batch_bytes: 1_000_000,
            log_write_retries: 3,
            max_concurrent_event_deliveries: 20,
            synchronous_recovery: false,
        }
    }

    /// Sets the physical root of the managed tree.
    #[must_use]
    pub fn data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = Some(root.into());
        self
    }

    /// Sets the default lock wait timeout.
    #[must_use]
    pub const fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    /// Sets the default transaction timeout.
    #[must_use]
    pub const fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Sets the deadlock detector interval.
    #[must_use]
    pub const fn deadlock_detector_interval(mut self, interval: Duration) -> Self {
        self.deadlock_detector_interval = interval;
        self
    }

    /// Sets the timeout detector interval.
    #[must_use]
    pub const fn timeout_check_interval(mut self, interval: Duration) -> Self {
        self.timeout_check_interval = interval;
        self
    }

    /// Sets the segment rotation size.
    #[must_use]
    pub const fn max_log_segment_size(mut self, size: u64) -> Self {
        self.max_log_segment_size = size;
        self
    }

    /// Sets the group commit window.
    #[must_use]
    pub const fn group_commit_window(mut self, window: Duration) -> Self {
        self.group_commit_window = window;
        self
    }

    /// Sets the byte threshold for flushing a batch early.
    #[must_use]
    pub const fn group_commit_max_batch_bytes(mut self, bytes: usize) -> Self {
        self.group_commit_max_batch_bytes = bytes;
        self
    }

    /// Sets the number of log write attempts.
    #[must_use]
    pub const fn log_write_retries(mut self, retries: u32) -> Self {
        self.log_write_retries = retries;
        self
    }

    /// Sets the event delivery concurrency limit.
    #[must_use]
    pub const fn max_concurrent_event_deliveries(mut self, limit: usize) -> Self {
        self.max_concurrent_event_deliveries = limit;
        self
    }

    /// Makes `boot` finish recovery before returning.
    #[must_use]
    pub const fn synchronous_recovery(mut self, value: bool) -> Self {
        self.synchronous_recovery = value;
        self
    }

    /// Returns the physical root of the managed tree.
    #[must_use]
    pub fn resolved_data_root(&self) -> PathBuf {
        self.data_root
            .clone()
            .unwrap_or_else(|| self.instance_dir.join("data"))
    }

    /// Returns the instance directory.
    #[must_use]
    pub fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    /// Rejects values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::InvalidArgument`] naming the offending field.
    pub fn validate(&self) -> TxResult<()> {
        if self.instance_dir.as_os_str().is_empty() {
            return Err(TxError::invalid_argument("instance_dir must be set"));
        }
        if self.transaction_timeout.is_zero() {
            return Err(TxError::invalid_argument("transaction_timeout must be positive"));
        }
        if self.deadlock_detector_interval.is_zero() || self.timeout_check_interval.is_zero() {
            return Err(TxError::invalid_argument("detector intervals must be positive"));
        }
        if self.max_log_segment_size == 0 || self.group_commit_max_batch_bytes == 0 {
            return Err(TxError::invalid_argument("log sizes must be positive"));
        }
        if self.log_write_retries == 0 {
            return Err(TxError::invalid_argument("log_write_retries must be at least 1"));
        }
        if self.max_concurrent_event_deliveries == 0 {
            return Err(TxError::invalid_argument(
                "max_concurrent_event_deliveries must be positive",
            ));
        }
        Ok(())
    }
}
