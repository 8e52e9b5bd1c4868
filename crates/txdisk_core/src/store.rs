//! Access to the committed file tree.
//!
//! Transactions read committed state through a [`FileStore`] and, once
//! their commit is durable, apply their [`Effect`]s through it. Every
//! effect application is idempotent so a crash in the middle of applying
//! can be repaired by applying the same effects again.

use crate::error::{TxError, TxResult};
use crate::log::Effect;
use crate::path::ResourcePath;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

/// What exists at a committed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A regular file of the given length.
    File {
        /// Length in bytes.
        len: u64,
    },
    /// A directory.
    Directory,
}

/// The committed file tree.
pub trait FileStore: Send + Sync + fmt::Debug {
    /// Looks up a path. `None` if it does not exist.
    fn metadata(&self, path: &ResourcePath) -> TxResult<Option<NodeKind>>;

    /// Reads up to `len` bytes at `offset` of a file.
    fn read_at(&self, path: &ResourcePath, offset: u64, len: usize) -> TxResult<Vec<u8>>;

    /// Names of the entries of a directory, sorted.
    fn list(&self, path: &ResourcePath) -> TxResult<Vec<String>>;

    /// Fails with [`TxError::InsufficientPermission`] if the process may
    /// not read (or, with `write`, modify) the path.
    fn check_access(&self, path: &ResourcePath, write: bool) -> TxResult<()>;

    /// Applies one effect. Applying it again must be harmless.
    fn apply(&self, effect: &Effect) -> TxResult<()>;

    /// Forces the content of the given paths (and their parent
    /// directories) to stable storage.
    fn sync(&self, paths: &[ResourcePath]) -> TxResult<()>;
}

/// A [`FileStore`] over a directory of the local file system.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Uses `root` as the managed tree, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> TxResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The physical root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn physical(&self, path: &ResourcePath) -> PathBuf {
        path.to_physical(&self.root)
    }

    fn map_io(path: &ResourcePath, err: io::Error) -> TxError {
        match err.kind() {
            io::ErrorKind::PermissionDenied => TxError::InsufficientPermission(path.clone()),
            io::ErrorKind::NotFound => TxError::FileNotExists(path.clone()),
            _ => TxError::Io(err),
        }
    }

    /// True if some ancestor of `physical` is a regular file, which makes
    /// lookups fail with "not a directory" rather than "not found".
    fn under_file(physical: &Path) -> bool {
        physical.ancestors().skip(1).any(Path::is_file)
    }

    fn remove_any(physical: &Path) -> io::Result<()> {
        match fs::symlink_metadata(physical) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(physical),
            Ok(_) => fs::remove_file(physical),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn apply_inner(&self, effect: &Effect) -> io::Result<()> {
        match effect {
            Effect::CreateFile { path } => {
                let target = self.physical(path);
                if target.is_dir() {
                    fs::remove_dir_all(&target)?;
                }
                File::create(&target)?;
            }
            Effect::CreateDir { path } => {
                let target = self.physical(path);
                if target.is_file() {
                    fs::remove_file(&target)?;
                }
                if !target.is_dir() {
                    fs::create_dir(&target)?;
                }
            }
            Effect::Delete { path } => {
                Self::remove_any(&self.physical(path))?;
            }
            Effect::Move {
                source,
                destination,
            } => {
                let from = self.physical(source);
                if fs::symlink_metadata(&from).is_err() {
                    return Ok(());
                }
                let to = self.physical(destination);
                Self::remove_any(&to)?;
                fs::rename(&from, &to)?;
            }
            Effect::Write { path, offset, data } => {
                let target = self.physical(path);
                let Ok(meta) = fs::metadata(&target) else {
                    return Ok(());
                };
                if !meta.is_file() || *offset > meta.len() {
                    return Ok(());
                }
                let mut file = OpenOptions::new().write(true).open(&target)?;
                file.seek(SeekFrom::Start(*offset))?;
                file.write_all(data)?;
            }
            Effect::Truncate { path, length } => {
                let target = self.physical(path);
                let Ok(meta) = fs::metadata(&target) else {
                    return Ok(());
                };
                if meta.is_file() && *length < meta.len() {
                    OpenOptions::new().write(true).open(&target)?.set_len(*length)?;
                }
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn sync_dir(dir: &Path) -> io::Result<()> {
        match File::open(dir) {
            Ok(handle) => handle.sync_all(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[cfg(not(unix))]
    fn sync_dir(_dir: &Path) -> io::Result<()> {
        Ok(())
    }
}

impl FileStore for DiskStore {
    fn metadata(&self, path: &ResourcePath) -> TxResult<Option<NodeKind>> {
        let physical = self.physical(path);
        match fs::metadata(&physical) {
            Ok(meta) if meta.is_dir() => Ok(Some(NodeKind::Directory)),
            Ok(meta) => Ok(Some(NodeKind::File { len: meta.len() })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(_) if Self::under_file(&physical) => Ok(None),
            Err(e) => Err(Self::map_io(path, e)),
        }
    }

    fn read_at(&self, path: &ResourcePath, offset: u64, len: usize) -> TxResult<Vec<u8>> {
        let mut file = File::open(self.physical(path)).map_err(|e| Self::map_io(path, e))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn list(&self, path: &ResourcePath) -> TxResult<Vec<String>> {
        let entries = fs::read_dir(self.physical(path)).map_err(|e| Self::map_io(path, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn check_access(&self, path: &ResourcePath, write: bool) -> TxResult<()> {
        // the nearest existing path decides: creating a file needs a
        // writable parent
        let mut candidate = Some(path.clone());
        while let Some(current) = candidate {
            match fs::metadata(self.physical(&current)) {
                Ok(meta) => {
                    if write && meta.permissions().readonly() {
                        return Err(TxError::InsufficientPermission(path.clone()));
                    }
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => candidate = current.parent(),
                Err(_) if Self::under_file(&self.physical(&current)) => candidate = current.parent(),
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    return Err(TxError::InsufficientPermission(path.clone()));
                }
                Err(e) => return Err(TxError::Io(e)),
            }
        }
        Ok(())
    }

    fn apply(&self, effect: &Effect) -> TxResult<()> {
        trace!(?effect, "applying effect");
        self.apply_inner(effect).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => {
                TxError::InsufficientPermission(effect.paths()[0].clone())
            }
            _ => TxError::Io(e),
        })
    }

    fn sync(&self, paths: &[ResourcePath]) -> TxResult<()> {
        let mut dirs = std::collections::BTreeSet::new();
        for path in paths {
            let physical = self.physical(path);
            match fs::metadata(&physical) {
                Ok(meta) if meta.is_file() => File::open(&physical)?.sync_all()?,
                Ok(_) => {
                    dirs.insert(physical);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(TxError::Io(e)),
            }
            if let Some(parent) = path.parent() {
                dirs.insert(self.physical(&parent));
            }
        }
        for dir in dirs {
            Self::sync_dir(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn p(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    fn write(path: &str, offset: u64, data: &[u8]) -> Effect {
        Effect::Write {
            path: p(path),
            offset,
            data: data.to_vec(),
        }
    }

    #[test]
    fn create_write_read() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        store.apply(&Effect::CreateFile { path: p("/a") }).unwrap();
        store.apply(&write("/a", 0, b"hello")).unwrap();
        assert_eq!(store.metadata(&p("/a")).unwrap(), Some(NodeKind::File { len: 5 }));
        assert_eq!(store.read_at(&p("/a"), 1, 3).unwrap(), b"ell");
        assert_eq!(store.read_at(&p("/a"), 3, 10).unwrap(), b"lo");
    }

    #[test]
    fn effects_are_idempotent() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        let effects = vec![
            Effect::CreateDir { path: p("/d") },
            Effect::CreateFile { path: p("/d/f") },
            write("/d/f", 0, b"abcdef"),
            Effect::Truncate {
                path: p("/d/f"),
                length: 3,
            },
            write("/d/f", 3, b"XY"),
            Effect::Move {
                source: p("/d/f"),
                destination: p("/g"),
            },
            Effect::Delete { path: p("/d") },
        ];
        for _ in 0..2 {
            for effect in &effects {
                store.apply(effect).unwrap();
            }
        }
        assert_eq!(store.read_at(&p("/g"), 0, 100).unwrap(), b"abcXY");
        assert_eq!(store.metadata(&p("/d")).unwrap(), None);
    }

    #[test]
    fn write_past_end_is_skipped() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        store.apply(&Effect::CreateFile { path: p("/a") }).unwrap();
        store.apply(&write("/a", 10, b"x")).unwrap();
        store.apply(&write("/missing", 0, b"x")).unwrap();
        assert_eq!(store.metadata(&p("/a")).unwrap(), Some(NodeKind::File { len: 0 }));
        assert_eq!(store.metadata(&p("/missing")).unwrap(), None);
    }

    #[test]
    fn move_replaces_destination() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        store.apply(&Effect::CreateFile { path: p("/a") }).unwrap();
        store.apply(&write("/a", 0, b"new")).unwrap();
        store.apply(&Effect::CreateDir { path: p("/b") }).unwrap();
        store
            .apply(&Effect::Move {
                source: p("/a"),
                destination: p("/b"),
            })
            .unwrap();
        assert_eq!(store.read_at(&p("/b"), 0, 10).unwrap(), b"new");
    }

    #[test]
    fn list_is_sorted() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        for name in ["/c", "/a", "/b"] {
            store.apply(&Effect::CreateFile { path: p(name) }).unwrap();
        }
        assert_eq!(store.list(&ResourcePath::root()).unwrap(), vec!["a", "b", "c"]);
        store.sync(&[p("/a"), p("/b")]).unwrap();
    }

    #[test]
    fn missing_file_reads_fail() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.read_at(&p("/nope"), 0, 1),
            Err(TxError::FileNotExists(_))
        ));
        store.check_access(&p("/nope/deeper"), true).unwrap();
    }

    #[test]
    fn paths_below_a_file_do_not_exist() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        store.apply(&Effect::CreateFile { path: p("/f") }).unwrap();
        assert_eq!(store.metadata(&p("/f/x")).unwrap(), None);
    }
}
