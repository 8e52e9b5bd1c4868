//! The per-segment byte store trait.

use crate::error::StorageResult;

/// An append-only byte store holding one log segment.
///
/// Backends are opaque: they never interpret the framed entries the engine
/// appends. Only the log flusher thread appends to the active segment, so
/// `append`, `sync` and `truncate` take `&mut self`; reads during recovery
/// go through `&self`.
///
/// # Invariants
///
/// - `append` returns the offset where the data starts
/// - `read_at` returns exactly the bytes previously appended at that offset
/// - after `sync` returns, every appended byte survives process termination
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range extends
    /// beyond the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write fails. A failed append may
    /// leave a partial tail; callers roll it back with [`Self::truncate`].
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Returns the current size in bytes, which is where the next append lands.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Forces appended data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails; the appended data must then be
    /// treated as not durable.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the segment back to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::InvalidTruncate`] if `new_size` exceeds
    /// the current size, or an I/O error.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
