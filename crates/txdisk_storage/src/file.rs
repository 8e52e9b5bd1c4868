//! File-backed segments.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A log segment stored in one OS file.
///
/// `sync()` calls `File::sync_all()`, so the segment length is durable
/// together with its bytes. The cached size is the append cursor; it is
/// only moved forward after a write fully succeeds.
///
/// # Example
///
/// ```no_run
/// use txdisk_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut segment = FileBackend::open(Path::new("txlog_00000001")).unwrap();
/// segment.append(b"framed entry").unwrap();
/// segment.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
}

impl FileBackend {
    /// Opens or creates the segment file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        if data.is_empty() {
            return Ok(*self.size.read());
        }

        let mut file = self.file.write();
        let mut size = self.size.write();

        let offset = *size;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        *size += data.len() as u64;

        Ok(offset)
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn sync(&mut self) -> StorageResult<()> {
        let mut file = self.file.write();
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let file = self.file.write();
        let mut size = self.size.write();

        let on_disk = file.metadata()?.len();
        if new_size > on_disk.max(*size) {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size: *size,
            });
        }

        file.set_len(new_size)?;
        file.sync_all()?;
        *size = new_size;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_empty_segment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("txlog_00000001");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(backend.path(), path);
    }

    #[test]
    fn append_then_read_back() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("seg")).unwrap();

        assert_eq!(backend.append(b"prepare").unwrap(), 0);
        assert_eq!(backend.append(b"commit").unwrap(), 7);
        assert_eq!(backend.read_at(7, 6).unwrap(), b"commit");
        assert_eq!(backend.size().unwrap(), 13);
    }

    #[test]
    fn read_past_end_fails() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("seg")).unwrap();
        backend.append(b"hello").unwrap();

        let result = backend.read_at(3, 10);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn synced_bytes_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"durable entry").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 13);
        assert_eq!(backend.read_at(0, 13).unwrap(), b"durable entry");
    }

    #[test]
    fn truncate_rolls_back_a_partial_batch() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("seg")).unwrap();
        backend.append(b"kept").unwrap();
        backend.append(b"torn batch").unwrap();

        backend.truncate(4).unwrap();
        assert_eq!(backend.size().unwrap(), 4);
        assert_eq!(backend.append(b"!").unwrap(), 4);
        assert_eq!(backend.read_at(0, 5).unwrap(), b"kept!");
    }

    #[test]
    fn truncate_cannot_grow() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("seg")).unwrap();
        backend.append(b"abc").unwrap();

        assert!(matches!(
            backend.truncate(10),
            Err(StorageError::InvalidTruncate { requested: 10, .. })
        ));
    }
}
