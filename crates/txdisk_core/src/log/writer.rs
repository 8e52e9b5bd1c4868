//! Group-commit log writer.
//!
//! Callers hand encoded entries to a single flusher thread over a channel.
//! The flusher gathers whatever arrives within the commit window (or until
//! the batch is large enough), appends the whole batch with one write and
//! one sync, then answers every caller in submission order. Only the
//! flusher touches segment files.

use super::record::LogEntry;
use super::segments::{LogOwner, SegmentTracker};
use super::LogPosition;
use crate::config::Config;
use crate::error::{TxError, TxResult};
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use txdisk_storage::{SegmentStore, StorageBackend};

/// Tunables for the writer, usually taken from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct LogOptions {
    /// Rotate once the active segment would grow past this size.
    pub max_segment_size: u64,
    /// How long to gather requests after the first one arrives.
    pub group_commit_window: Duration,
    /// Flush early once a batch holds this many bytes.
    pub max_batch_bytes: usize,
    /// Attempts per batch before the log fails.
    pub write_retries: u32,
}

impl From<&Config> for LogOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_segment_size: config.max_log_segment_size,
            group_commit_window: config.group_commit_window,
            max_batch_bytes: config.group_commit_max_batch_bytes,
            write_retries: config.log_write_retries,
        }
    }
}

type Completion = Result<Vec<LogPosition>, String>;

struct AppendRequest {
    frames: Vec<(Vec<u8>, Vec<LogOwner>)>,
    done: SyncSender<Completion>,
}

impl AppendRequest {
    fn len(&self) -> usize {
        self.frames.iter().map(|(frame, _)| frame.len()).sum()
    }
}

enum Command {
    Append(AppendRequest),
    Reclaim(Vec<u64>),
}

struct LogShared {
    tracker: Mutex<SegmentTracker>,
    failure: Mutex<Option<String>>,
}

/// An append that has been queued but not yet acknowledged.
#[must_use = "an append is not durable until waited on"]
pub struct PendingAppend {
    rx: Receiver<Completion>,
}

impl PendingAppend {
    /// Blocks until the batch holding these entries is synced.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::LogFailure`] if the write failed after retries
    /// or the writer has stopped.
    pub fn wait(self) -> TxResult<Vec<LogPosition>> {
        match self.rx.recv() {
            Ok(Ok(positions)) => Ok(positions),
            Ok(Err(message)) => Err(TxError::log_failure(message)),
            Err(_) => Err(TxError::log_failure("log writer stopped")),
        }
    }
}

/// The durable, segmented, group-committed transaction log.
pub struct DurableLog {
    shared: Arc<LogShared>,
    sender: Mutex<Option<Sender<Command>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DurableLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableLog")
            .field("active_segment", &self.active_segment())
            .field("failed", &self.failure().is_some())
            .finish()
    }
}

impl DurableLog {
    /// Opens a fresh active segment after the existing ones and starts
    /// the flusher.
    ///
    /// `references` seeds the tracker with the owners found by the boot
    /// scan. Existing segments nobody references are reclaimed right away.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed, the new segment
    /// cannot be created, or the thread cannot be spawned.
    pub fn open(
        store: Arc<dyn SegmentStore>,
        options: LogOptions,
        references: impl IntoIterator<Item = (u64, LogOwner)>,
    ) -> TxResult<Self> {
        let existing = store.list()?;
        let active = existing.last().map_or(1, |last| last + 1);
        let backend = store.open(active)?;

        let mut tracker = SegmentTracker::new(&existing, active);
        for (segment, owner) in references {
            tracker.reference(segment, &owner);
        }
        let initial_reclaim = tracker.take_reclaimable();

        let shared = Arc::new(LogShared {
            tracker: Mutex::new(tracker),
            failure: Mutex::new(None),
        });
        let (sender, receiver) = mpsc::channel();

        let flusher = Flusher {
            store,
            backend,
            active,
            active_size: 0,
            options,
            shared: Arc::clone(&shared),
        };
        flusher.remove_segments(&initial_reclaim);
        let handle = thread::Builder::new()
            .name("txdisk-log-flusher".into())
            .spawn(move || flusher.run(receiver))?;

        info!(active_segment = active, existing = existing.len(), "transaction log opened");
        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            flusher: Mutex::new(Some(handle)),
        })
    }

    /// Queues entries for the next group commit. Each entry is counted
    /// against the segment it lands in for each of its owners.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::LogFailure`] if the log already failed or is
    /// closed, or an encoding error.
    pub fn submit(&self, entries: Vec<(LogEntry, Vec<LogOwner>)>) -> TxResult<PendingAppend> {
        if let Some(message) = self.failure() {
            return Err(TxError::log_failure(message));
        }
        let mut frames = Vec::with_capacity(entries.len());
        for (entry, owners) in entries {
            frames.push((entry.encode_frame()?, owners));
        }
        let (done, rx) = mpsc::sync_channel(1);
        self.send(Command::Append(AppendRequest { frames, done }))?;
        Ok(PendingAppend { rx })
    }

    /// Appends entries and waits until they are durable.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit) and [`PendingAppend::wait`].
    pub fn append(&self, entries: Vec<(LogEntry, Vec<LogOwner>)>) -> TxResult<Vec<LogPosition>> {
        self.submit(entries)?.wait()
    }

    /// Appends one entry owned by `owner` and waits until it is durable.
    ///
    /// # Errors
    ///
    /// See [`append`](Self::append).
    pub fn append_one(&self, entry: LogEntry, owner: LogOwner) -> TxResult<LogPosition> {
        self.append(vec![(entry, vec![owner])])?
            .pop()
            .ok_or_else(|| TxError::log_failure("writer acknowledged no position"))
    }

    /// Drops the references of a finished owner and reclaims segments
    /// that became unused.
    pub fn release(&self, owner: &LogOwner) {
        let reclaimable = self.shared.tracker.lock().release(owner);
        if !reclaimable.is_empty() {
            // a closed writer leaves the files for the next boot to reclaim
            let _ = self.send(Command::Reclaim(reclaimable));
        }
    }

    /// The failure message once the log has failed.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.shared.failure.lock().clone()
    }

    /// The segment currently written to.
    #[must_use]
    pub fn active_segment(&self) -> u64 {
        self.shared.tracker.lock().active()
    }

    /// Owners referencing `segment`.
    #[must_use]
    pub fn ref_count(&self, segment: u64) -> usize {
        self.shared.tracker.lock().ref_count(segment)
    }

    /// Segments not yet reclaimed, oldest first.
    #[must_use]
    pub fn segments(&self) -> Vec<u64> {
        self.shared.tracker.lock().segments()
    }

    /// Stops the flusher after it drains queued requests.
    pub fn close(&self) {
        self.sender.lock().take();
        if let Some(handle) = self.flusher.lock().take() {
            if handle.join().is_err() {
                error!("log flusher panicked");
            }
        }
    }

    fn send(&self, command: Command) -> TxResult<()> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or_else(|| TxError::log_failure("log is closed"))?;
        sender
            .send(command)
            .map_err(|_| TxError::log_failure("log writer stopped"))
    }
}

impl Drop for DurableLog {
    fn drop(&mut self) {
        self.close();
    }
}

struct Flusher {
    store: Arc<dyn SegmentStore>,
    backend: Box<dyn StorageBackend>,
    active: u64,
    active_size: u64,
    options: LogOptions,
    shared: Arc<LogShared>,
}

impl Flusher {
    fn run(mut self, receiver: Receiver<Command>) {
        while let Ok(first) = receiver.recv() {
            let mut batch = Vec::new();
            let mut batch_bytes = 0;
            let mut reclaim = Vec::new();
            let mut gather = false;

            match first {
                Command::Append(request) => {
                    batch_bytes += request.len();
                    batch.push(request);
                    gather = true;
                }
                Command::Reclaim(segments) => reclaim.extend(segments),
            }

            let deadline = Instant::now() + self.options.group_commit_window;
            while gather && batch_bytes < self.options.max_batch_bytes {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match receiver.recv_timeout(remaining) {
                    Ok(Command::Append(request)) => {
                        batch_bytes += request.len();
                        batch.push(request);
                    }
                    Ok(Command::Reclaim(segments)) => reclaim.extend(segments),
                    Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
                }
            }

            if !batch.is_empty() {
                self.write_batch(batch, batch_bytes);
            }
            if !reclaim.is_empty() {
                self.remove_segments(&reclaim);
            }
        }
        debug!("log flusher stopped");
    }

    fn write_batch(&mut self, batch: Vec<AppendRequest>, batch_bytes: usize) {
        if let Some(message) = self.shared.failure.lock().clone() {
            for request in batch {
                let _ = request.done.send(Err(message.clone()));
            }
            return;
        }

        let total = batch_bytes as u64;
        if self.active_size > 0 && self.active_size + total > self.options.max_segment_size {
            if let Err(e) = self.rotate() {
                self.fail(batch, format!("segment rotation failed: {e}"));
                return;
            }
        }

        let mut data = Vec::with_capacity(batch_bytes);
        for request in &batch {
            for (frame, _) in &request.frames {
                data.extend_from_slice(frame);
            }
        }

        let base = self.active_size;
        let mut last_error = None;
        for attempt in 1..=self.options.write_retries {
            match self.try_write(&data) {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!(attempt, segment = self.active, error = %e, "log write failed, rolling back batch");
                    if let Err(truncate_err) = self.backend.truncate(base) {
                        warn!(error = %truncate_err, "could not roll back partial batch");
                    }
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            self.fail(batch, format!("log write failed after {} attempts: {e}", self.options.write_retries));
            return;
        }

        let mut offset = base;
        let mut tracker = self.shared.tracker.lock();
        let mut replies = Vec::with_capacity(batch.len());
        for request in batch {
            let mut positions = Vec::with_capacity(request.frames.len());
            for (frame, owners) in &request.frames {
                for owner in owners {
                    tracker.reference(self.active, owner);
                }
                positions.push(LogPosition {
                    segment: self.active,
                    offset,
                });
                offset += frame.len() as u64;
            }
            replies.push((request.done, positions));
        }
        drop(tracker);
        self.active_size = offset;

        for (done, positions) in replies {
            let _ = done.send(Ok(positions));
        }
    }

    fn try_write(&mut self, data: &[u8]) -> TxResult<()> {
        self.backend.append(data)?;
        self.backend.sync()?;
        Ok(())
    }

    fn rotate(&mut self) -> TxResult<()> {
        let next = self.active + 1;
        self.backend.sync()?;
        self.backend = self.store.open(next)?;
        let previous = self.active;
        self.active = next;
        self.active_size = 0;
        let reclaimable = self.shared.tracker.lock().rotate(next);
        info!(previous, next, "log segment rotated");
        self.remove_segments(&reclaimable);
        Ok(())
    }

    fn fail(&self, batch: Vec<AppendRequest>, message: String) {
        error!(segment = self.active, %message, "transaction log failed");
        *self.shared.failure.lock() = Some(message.clone());
        for request in batch {
            let _ = request.done.send(Err(message.clone()));
        }
    }

    fn remove_segments(&self, segments: &[u64]) {
        for segment in segments {
            match self.store.remove(*segment) {
                Ok(()) => debug!(segment, "log segment reclaimed"),
                Err(e) => warn!(segment, error = %e, "could not remove log segment"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogScanner;
    use crate::types::TransactionIdentifier;
    use txdisk_storage::MemorySegmentStore;

    fn options() -> LogOptions {
        LogOptions {
            max_segment_size: 1 << 20,
            group_commit_window: Duration::from_millis(1),
            max_batch_bytes: 1 << 16,
            write_retries: 2,
        }
    }

    fn local(n: u64) -> TransactionIdentifier {
        TransactionIdentifier::Local(n)
    }

    fn owner(n: u64) -> LogOwner {
        LogOwner::Transaction(local(n))
    }

    fn rollback(n: u64) -> LogEntry {
        LogEntry::Rollback { ident: local(n) }
    }

    #[test]
    fn appends_are_readable_after_close() {
        let store = MemorySegmentStore::new();
        let log = DurableLog::open(Arc::new(store.clone()), options(), []).unwrap();
        let first = log.append_one(rollback(1), owner(1)).unwrap();
        let second = log.append_one(rollback(2), owner(2)).unwrap();
        assert_eq!(first.segment, 1);
        assert!(second.offset > first.offset);
        log.close();

        let entries: Vec<_> = LogScanner::new(Arc::new(store))
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(entries, vec![rollback(1), rollback(2)]);
    }

    #[test]
    fn concurrent_appends_each_get_a_position() {
        let log = Arc::new(DurableLog::open(Arc::new(MemorySegmentStore::new()), options(), []).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let log = Arc::clone(&log);
                thread::spawn(move || log.append_one(rollback(n), owner(n)).unwrap())
            })
            .collect();
        let mut offsets: Vec<_> = handles.into_iter().map(|h| h.join().unwrap().offset).collect();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), 8);
    }

    #[test]
    fn rotation_and_reclaim() {
        let store = MemorySegmentStore::new();
        let frame_len = rollback(1).encode_frame().unwrap().len() as u64;
        let log = DurableLog::open(
            Arc::new(store.clone()),
            LogOptions {
                max_segment_size: frame_len,
                ..options()
            },
            [],
        )
        .unwrap();

        let a = log.append_one(rollback(1), owner(1)).unwrap();
        let b = log.append_one(rollback(2), owner(2)).unwrap();
        assert_eq!((a.segment, b.segment), (1, 2));
        assert_eq!(log.ref_count(1), 1);

        log.release(&owner(1));
        log.close();
        assert!(store.bytes(1).is_none());
        assert!(store.bytes(2).is_some());
    }

    #[test]
    fn unreferenced_segments_reclaimed_at_open() {
        let store = MemorySegmentStore::new();
        store.insert(4, rollback(1).encode_frame().unwrap());
        store.insert(5, rollback(2).encode_frame().unwrap());
        let log = DurableLog::open(Arc::new(store.clone()), options(), [(5, owner(2))]).unwrap();
        assert_eq!(log.active_segment(), 6);
        log.close();
        assert!(store.bytes(4).is_none());
        assert!(store.bytes(5).is_some());
    }

    #[test]
    fn closed_log_rejects_appends() {
        let log = DurableLog::open(Arc::new(MemorySegmentStore::new()), options(), []).unwrap();
        log.close();
        assert!(matches!(
            log.append_one(rollback(1), owner(1)),
            Err(TxError::LogFailure { .. })
        ));
    }
}
