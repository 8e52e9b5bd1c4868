//! Per-transaction view of the file tree.
//!
//! A [`Workspace`] holds the pending changes of one transaction as an
//! overlay keyed by path. Lookups consult the overlay first; the nearest
//! overridden ancestor decides what lies beneath it (a moved directory
//! mirrors its committed origin, a new directory starts empty, anything
//! else hides the subtree). Paths with no overridden ancestor fall through
//! to the committed tree.
//!
//! Alongside the overlay the workspace keeps the ordered list of
//! [`Effect`]s that replays the same changes on the committed tree, and
//! the events the changes raise.
//!
//! The caller holds the locks that make the committed state read here
//! stable; the workspace itself does no locking.

use crate::error::{TxError, TxResult};
use crate::events::{EventMask, FileStateChangeEvent};
use crate::log::Effect;
use crate::path::ResourcePath;
use crate::store::{FileStore, NodeKind};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

#[derive(Debug, Clone)]
struct VirtualFile {
    /// Committed file whose prefix is the start of this content.
    base: Option<ResourcePath>,
    base_len: u64,
    appended: Vec<u8>,
}

impl VirtualFile {
    fn empty() -> Self {
        Self {
            base: None,
            base_len: 0,
            appended: Vec::new(),
        }
    }

    fn len(&self) -> u64 {
        self.base_len + self.appended.len() as u64
    }
}

#[derive(Debug, Clone)]
enum Node {
    File(VirtualFile),
    /// `origin` is the committed directory whose entries appear here.
    Dir { origin: Option<ResourcePath> },
    Absent,
}

/// What a path resolves to in a transaction's view.
#[derive(Debug)]
enum View<'a> {
    Missing,
    File {
        base: Option<ResourcePath>,
        base_len: u64,
        appended: &'a [u8],
    },
    Dir {
        origin: Option<ResourcePath>,
    },
}

impl View<'_> {
    fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    fn len(&self) -> Option<u64> {
        match self {
            Self::File {
                base_len, appended, ..
            } => Some(base_len + appended.len() as u64),
            _ => None,
        }
    }
}

/// Kind of an open stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Reads the transaction's view of a file.
    Input,
    /// Appends to a file.
    Output {
        /// Caller hint for large writes.
        heavy_write: bool,
    },
}

#[derive(Debug, Clone)]
struct OpenStream {
    path: ResourcePath,
    kind: StreamKind,
}

/// Pending changes of one transaction.
#[derive(Debug, Default)]
pub struct Workspace {
    nodes: BTreeMap<ResourcePath, Node>,
    effects: Vec<Effect>,
    events: Vec<FileStateChangeEvent>,
    streams: HashMap<u64, OpenStream>,
    next_stream: u64,
    /// Set once an output stream is opened, even if nothing is written.
    opened_for_write: bool,
}

impl Workspace {
    /// Creates an empty workspace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn committed<'a>(store: &dyn FileStore, path: ResourcePath) -> TxResult<View<'a>> {
        Ok(match store.metadata(&path)? {
            None => View::Missing,
            Some(NodeKind::Directory) => View::Dir { origin: Some(path) },
            Some(NodeKind::File { len }) => View::File {
                base: Some(path),
                base_len: len,
                appended: &[],
            },
        })
    }

    fn node_view(node: &Node) -> View<'_> {
        match node {
            Node::Absent => View::Missing,
            Node::Dir { origin } => View::Dir {
                origin: origin.clone(),
            },
            Node::File(file) => View::File {
                base: file.base.clone(),
                base_len: file.base_len,
                appended: &file.appended,
            },
        }
    }

    fn resolve(&self, store: &dyn FileStore, path: &ResourcePath) -> TxResult<View<'_>> {
        if let Some(node) = self.nodes.get(path) {
            return Ok(Self::node_view(node));
        }
        for ancestor in path.ancestors() {
            if let Some(node) = self.nodes.get(&ancestor) {
                return match node {
                    Node::Dir {
                        origin: Some(origin),
                    } => match path.rebase(&ancestor, origin) {
                        Some(committed) => Self::committed(store, committed),
                        None => Ok(View::Missing),
                    },
                    _ => Ok(View::Missing),
                };
            }
        }
        Self::committed(store, path.clone())
    }

    fn require_parent_dir(&self, store: &dyn FileStore, path: &ResourcePath) -> TxResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| TxError::invalid_argument("the root cannot be created, moved or removed"))?;
        match self.resolve(store, &parent)? {
            View::Dir { .. } => Ok(()),
            _ => Err(TxError::FileNotExists(parent)),
        }
    }

    fn subtree_keys(&self, path: &ResourcePath) -> Vec<ResourcePath> {
        let prefix = path.descendant_prefix();
        self.nodes
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(key, _)| key.as_str().starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn check_no_streams_under(&self, path: &ResourcePath) -> TxResult<()> {
        match self.streams.values().find(|s| s.path.starts_with(path)) {
            Some(stream) => Err(TxError::FileUnderUse(stream.path.clone())),
            None => Ok(()),
        }
    }

    fn push_write(&mut self, path: &ResourcePath, offset: u64, data: &[u8]) {
        if let Some(Effect::Write {
            path: last_path,
            offset: last_offset,
            data: last_data,
        }) = self.effects.last_mut()
        {
            if last_path == path && *last_offset + last_data.len() as u64 == offset {
                last_data.extend_from_slice(data);
                return;
            }
        }
        self.effects.push(Effect::Write {
            path: path.clone(),
            offset,
            data: data.to_vec(),
        });
    }

    fn raise(&mut self, path: &ResourcePath, is_directory: bool, event_type: EventMask) {
        self.events
            .push(FileStateChangeEvent::new(path.clone(), is_directory, event_type));
    }

    fn file_mut(&mut self, store: &dyn FileStore, path: &ResourcePath) -> TxResult<&mut VirtualFile> {
        if !matches!(self.nodes.get(path), Some(Node::File(_))) {
            let file = match self.resolve(store, path)? {
                View::File { base, base_len, appended } => VirtualFile {
                    base,
                    base_len,
                    appended: appended.to_vec(),
                },
                View::Dir { .. } => {
                    return Err(TxError::invalid_argument(format!("{path} is a directory")));
                }
                View::Missing => return Err(TxError::FileNotExists(path.clone())),
            };
            self.nodes.insert(path.clone(), Node::File(file));
        }
        match self.nodes.get_mut(path) {
            Some(Node::File(file)) => Ok(file),
            _ => Err(TxError::FileNotExists(path.clone())),
        }
    }

    /// Returns `Some(is_directory)` if the path exists.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn exists(&self, store: &dyn FileStore, path: &ResourcePath) -> TxResult<Option<bool>> {
        Ok(match self.resolve(store, path)? {
            View::Missing => None,
            View::File { .. } => Some(false),
            View::Dir { .. } => Some(true),
        })
    }

    /// Length of a file.
    ///
    /// # Errors
    ///
    /// [`TxError::FileNotExists`] if missing, [`TxError::InvalidArgument`]
    /// for a directory.
    pub fn length(&self, store: &dyn FileStore, path: &ResourcePath) -> TxResult<u64> {
        match self.resolve(store, path)? {
            View::Missing => Err(TxError::FileNotExists(path.clone())),
            View::Dir { .. } => Err(TxError::invalid_argument(format!("{path} is a directory"))),
            view => Ok(view.len().unwrap_or(0)),
        }
    }

    /// Reads up to `len` bytes at `offset` from the transaction's view.
    ///
    /// # Errors
    ///
    /// As for [`length`](Self::length), plus store read errors.
    pub fn read(&self, store: &dyn FileStore, path: &ResourcePath, offset: u64, len: usize) -> TxResult<Vec<u8>> {
        let (base, base_len, appended) = match self.resolve(store, path)? {
            View::File { base, base_len, appended } => (base, base_len, appended),
            View::Dir { .. } => return Err(TxError::invalid_argument(format!("{path} is a directory"))),
            View::Missing => return Err(TxError::FileNotExists(path.clone())),
        };
        let total = base_len + appended.len() as u64;
        if offset >= total || len == 0 {
            return Ok(Vec::new());
        }
        let end = total.min(offset + len as u64);
        let mut out = Vec::with_capacity((end - offset) as usize);
        if offset < base_len {
            if let Some(base) = &base {
                let from_base = (end.min(base_len) - offset) as usize;
                out.extend(store.read_at(base, offset, from_base)?);
            }
        }
        if end > base_len {
            let start = offset.saturating_sub(base_len) as usize;
            let stop = (end - base_len) as usize;
            out.extend_from_slice(&appended[start..stop]);
        }
        Ok(out)
    }

    /// Sorted names of a directory's entries.
    ///
    /// # Errors
    ///
    /// [`TxError::FileNotExists`] if missing, [`TxError::InvalidArgument`]
    /// for a file.
    pub fn list(&self, store: &dyn FileStore, dir: &ResourcePath) -> TxResult<Vec<String>> {
        let origin = match self.resolve(store, dir)? {
            View::Dir { origin } => origin,
            View::File { .. } => return Err(TxError::invalid_argument(format!("{dir} is not a directory"))),
            View::Missing => return Err(TxError::FileNotExists(dir.clone())),
        };
        let mut names: BTreeSet<String> = match origin {
            Some(origin) => store.list(&origin)?.into_iter().collect(),
            None => BTreeSet::new(),
        };
        for key in self.subtree_keys(dir) {
            if key.parent().as_ref() != Some(dir) {
                continue;
            }
            let Some(name) = key.file_name() else { continue };
            match self.nodes.get(&key) {
                Some(Node::Absent) => {
                    names.remove(name);
                }
                Some(_) => {
                    names.insert(name.to_string());
                }
                None => {}
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Creates a file or directory.
    ///
    /// # Errors
    ///
    /// [`TxError::FileAlreadyExists`] if the path exists,
    /// [`TxError::FileNotExists`] if the parent is not a directory.
    pub fn create(&mut self, store: &dyn FileStore, path: &ResourcePath, is_directory: bool) -> TxResult<()> {
        if !self.resolve(store, path)?.is_missing() {
            return Err(TxError::FileAlreadyExists(path.clone()));
        }
        self.require_parent_dir(store, path)?;
        for key in self.subtree_keys(path) {
            self.nodes.remove(&key);
        }
        if is_directory {
            self.nodes.insert(path.clone(), Node::Dir { origin: None });
            self.effects.push(Effect::CreateDir { path: path.clone() });
        } else {
            self.nodes.insert(path.clone(), Node::File(VirtualFile::empty()));
            self.effects.push(Effect::CreateFile { path: path.clone() });
        }
        self.raise(path, is_directory, EventMask::CREATED);
        Ok(())
    }

    /// Deletes a file or an empty directory. Returns whether it was a
    /// directory.
    ///
    /// # Errors
    ///
    /// [`TxError::FileNotExists`], [`TxError::DirectoryNotEmpty`] or
    /// [`TxError::FileUnderUse`] if a stream is open on the path.
    pub fn delete(&mut self, store: &dyn FileStore, path: &ResourcePath) -> TxResult<bool> {
        if path.is_root() {
            return Err(TxError::invalid_argument("the root cannot be removed"));
        }
        let is_directory = match self.resolve(store, path)? {
            View::Missing => return Err(TxError::FileNotExists(path.clone())),
            View::File { .. } => false,
            View::Dir { .. } => true,
        };
        if is_directory && !self.list(store, path)?.is_empty() {
            return Err(TxError::DirectoryNotEmpty(path.clone()));
        }
        self.check_no_streams_under(path)?;

        for key in self.subtree_keys(path) {
            self.nodes.remove(&key);
        }
        self.nodes.insert(path.clone(), Node::Absent);
        self.effects.push(Effect::Delete { path: path.clone() });
        self.raise(path, is_directory, EventMask::DELETED);
        Ok(is_directory)
    }

    /// Renames a file or directory tree. Returns whether it was a
    /// directory.
    ///
    /// # Errors
    ///
    /// [`TxError::FileNotExists`] for a missing source or destination
    /// parent, [`TxError::FileAlreadyExists`] for an existing destination,
    /// [`TxError::InvalidArgument`] when moving a directory into itself,
    /// [`TxError::FileUnderUse`] if a stream is open in the source tree.
    pub fn move_path(&mut self, store: &dyn FileStore, source: &ResourcePath, destination: &ResourcePath) -> TxResult<bool> {
        if source.is_root() || destination.starts_with(source) {
            return Err(TxError::invalid_argument(format!(
                "cannot move {source} to {destination}"
            )));
        }
        let node = match self.resolve(store, source)? {
            View::Missing => return Err(TxError::FileNotExists(source.clone())),
            View::File { base, base_len, appended } => Node::File(VirtualFile {
                base,
                base_len,
                appended: appended.to_vec(),
            }),
            View::Dir { origin } => Node::Dir { origin },
        };
        let is_directory = matches!(node, Node::Dir { .. });
        if !self.resolve(store, destination)?.is_missing() {
            return Err(TxError::FileAlreadyExists(destination.clone()));
        }
        self.require_parent_dir(store, destination)?;
        self.check_no_streams_under(source)?;

        for key in self.subtree_keys(destination) {
            self.nodes.remove(&key);
        }
        for key in self.subtree_keys(source) {
            if let (Some(moved), Some(rebased)) = (self.nodes.remove(&key), key.rebase(source, destination)) {
                self.nodes.insert(rebased, moved);
            }
        }
        self.nodes.insert(source.clone(), Node::Absent);
        self.nodes.insert(destination.clone(), node);

        self.effects.push(Effect::Move {
            source: source.clone(),
            destination: destination.clone(),
        });
        self.raise(source, is_directory, EventMask::DELETED);
        self.raise(destination, is_directory, EventMask::CREATED);
        Ok(is_directory)
    }

    /// Copies a file's current content to a new path.
    ///
    /// # Errors
    ///
    /// [`TxError::FileNotExists`] for a missing source or destination
    /// parent, [`TxError::FileAlreadyExists`] for an existing destination,
    /// [`TxError::InvalidArgument`] if the source is a directory.
    pub fn copy(&mut self, store: &dyn FileStore, source: &ResourcePath, destination: &ResourcePath) -> TxResult<()> {
        let len = match self.resolve(store, source)? {
            View::Missing => return Err(TxError::FileNotExists(source.clone())),
            View::Dir { .. } => {
                return Err(TxError::invalid_argument(format!("cannot copy directory {source}")));
            }
            view => view.len().unwrap_or(0),
        };
        if !self.resolve(store, destination)?.is_missing() {
            return Err(TxError::FileAlreadyExists(destination.clone()));
        }
        self.require_parent_dir(store, destination)?;

        let snapshot = self.read(store, source, 0, len as usize)?;
        for key in self.subtree_keys(destination) {
            self.nodes.remove(&key);
        }
        self.effects.push(Effect::CreateFile {
            path: destination.clone(),
        });
        if !snapshot.is_empty() {
            self.push_write(destination, 0, &snapshot);
        }
        self.nodes.insert(
            destination.clone(),
            Node::File(VirtualFile {
                base: None,
                base_len: 0,
                appended: snapshot,
            }),
        );
        self.raise(destination, false, EventMask::CREATED | EventMask::MODIFIED);
        Ok(())
    }

    /// Shrinks a file.
    ///
    /// # Errors
    ///
    /// [`TxError::InvalidArgument`] if `length` exceeds the current length
    /// or the path is a directory, [`TxError::FileNotExists`] if missing.
    pub fn truncate(&mut self, store: &dyn FileStore, path: &ResourcePath, length: u64) -> TxResult<()> {
        let file = self.file_mut(store, path)?;
        if length > file.len() {
            return Err(TxError::invalid_argument(format!(
                "cannot truncate {path} to {length}: file is {} bytes",
                file.len()
            )));
        }
        if length <= file.base_len {
            file.base_len = length;
            file.appended.clear();
        } else {
            file.appended.truncate((length - file.base_len) as usize);
        }
        self.effects.push(Effect::Truncate {
            path: path.clone(),
            length,
        });
        self.raise(path, false, EventMask::MODIFIED);
        Ok(())
    }

    /// Appends bytes to a file.
    ///
    /// # Errors
    ///
    /// [`TxError::FileNotExists`] if missing, [`TxError::InvalidArgument`]
    /// for a directory.
    pub fn append(&mut self, store: &dyn FileStore, path: &ResourcePath, data: &[u8]) -> TxResult<()> {
        let file = self.file_mut(store, path)?;
        let offset = file.len();
        file.appended.extend_from_slice(data);
        if !data.is_empty() {
            self.push_write(path, offset, data);
        }
        Ok(())
    }

    /// Registers an open stream and returns its id.
    ///
    /// # Errors
    ///
    /// [`TxError::FileUnderUse`] when opening an output stream while
    /// another output stream with a different `heavy_write` flag is open
    /// on the same path.
    pub fn open_stream(&mut self, store: &dyn FileStore, path: &ResourcePath, kind: StreamKind) -> TxResult<u64> {
        match self.resolve(store, path)? {
            View::Missing => return Err(TxError::FileNotExists(path.clone())),
            View::Dir { .. } => return Err(TxError::invalid_argument(format!("{path} is a directory"))),
            View::File { .. } => {}
        }
        if let StreamKind::Output { heavy_write } = kind {
            let conflict = self.streams.values().any(|s| {
                s.path == *path && matches!(s.kind, StreamKind::Output { heavy_write: other } if other != heavy_write)
            });
            if conflict {
                return Err(TxError::FileUnderUse(path.clone()));
            }
            self.raise(path, false, EventMask::MODIFIED);
            self.opened_for_write = true;
        }
        self.next_stream += 1;
        let id = self.next_stream;
        self.streams.insert(
            id,
            OpenStream {
                path: path.clone(),
                kind,
            },
        );
        Ok(id)
    }

    /// Forgets a stream. Returns false if it was not open.
    pub fn close_stream(&mut self, id: u64) -> bool {
        self.streams.remove(&id).is_some()
    }

    /// True if the stream is open.
    #[must_use]
    pub fn is_stream_open(&self, id: u64) -> bool {
        self.streams.contains_key(&id)
    }

    /// Closes every stream.
    pub fn close_all_streams(&mut self) {
        self.streams.clear();
    }

    /// Effects recorded so far, in order.
    #[must_use]
    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    /// Events raised so far, in order.
    #[must_use]
    pub fn events(&self) -> &[FileStateChangeEvent] {
        &self.events
    }

    /// True if nothing was changed and no output stream was opened.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.effects.is_empty() && !self.opened_for_write
    }

    /// Takes the recorded effects and events, leaving the workspace empty.
    pub fn take(&mut self) -> (Vec<Effect>, Vec<FileStateChangeEvent>) {
        self.nodes.clear();
        self.streams.clear();
        self.opened_for_write = false;
        (std::mem::take(&mut self.effects), std::mem::take(&mut self.events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DiskStore;
    use tempfile::{tempdir, TempDir};

    fn p(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    fn store_with(files: &[(&str, &[u8])], dirs: &[&str]) -> (TempDir, DiskStore) {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        for d in dirs {
            store.apply(&Effect::CreateDir { path: p(d) }).unwrap();
        }
        for (path, content) in files {
            store.apply(&Effect::CreateFile { path: p(path) }).unwrap();
            store
                .apply(&Effect::Write {
                    path: p(path),
                    offset: 0,
                    data: content.to_vec(),
                })
                .unwrap();
        }
        (dir, store)
    }

    fn commit(ws: &mut Workspace, store: &DiskStore) {
        let (effects, _) = ws.take();
        for effect in &effects {
            store.apply(effect).unwrap();
        }
    }

    #[test]
    fn read_your_own_writes() {
        let (_dir, store) = store_with(&[], &[]);
        let mut ws = Workspace::new();
        ws.create(&store, &p("/a.txt"), false).unwrap();
        ws.append(&store, &p("/a.txt"), b"hello").unwrap();
        assert_eq!(ws.read(&store, &p("/a.txt"), 0, 100).unwrap(), b"hello");
        assert_eq!(ws.length(&store, &p("/a.txt")).unwrap(), 5);
        // committed tree is untouched
        assert_eq!(store.metadata(&p("/a.txt")).unwrap(), None);
        commit(&mut ws, &store);
        assert_eq!(store.read_at(&p("/a.txt"), 0, 100).unwrap(), b"hello");
    }

    #[test]
    fn appends_extend_committed_content() {
        let (_dir, store) = store_with(&[("/f", b"abc")], &[]);
        let mut ws = Workspace::new();
        ws.append(&store, &p("/f"), b"de").unwrap();
        ws.append(&store, &p("/f"), b"f").unwrap();
        assert_eq!(ws.read(&store, &p("/f"), 1, 4).unwrap(), b"bcde");
        assert_eq!(ws.effects().len(), 1);
        commit(&mut ws, &store);
        assert_eq!(store.read_at(&p("/f"), 0, 10).unwrap(), b"abcdef");
    }

    #[test]
    fn truncate_then_append() {
        let (_dir, store) = store_with(&[("/f", b"abcdef")], &[]);
        let mut ws = Workspace::new();
        assert!(matches!(
            ws.truncate(&store, &p("/f"), 10),
            Err(TxError::InvalidArgument { .. })
        ));
        ws.truncate(&store, &p("/f"), 2).unwrap();
        ws.append(&store, &p("/f"), b"XY").unwrap();
        assert_eq!(ws.read(&store, &p("/f"), 0, 10).unwrap(), b"abXY");
        commit(&mut ws, &store);
        assert_eq!(store.read_at(&p("/f"), 0, 10).unwrap(), b"abXY");
    }

    #[test]
    fn create_requires_parent_and_absence() {
        let (_dir, store) = store_with(&[("/f", b"")], &[]);
        let mut ws = Workspace::new();
        assert!(matches!(
            ws.create(&store, &p("/f"), false),
            Err(TxError::FileAlreadyExists(_))
        ));
        assert!(matches!(
            ws.create(&store, &p("/nodir/x"), false),
            Err(TxError::FileNotExists(parent)) if parent == p("/nodir")
        ));
        ws.create(&store, &p("/nodir"), true).unwrap();
        ws.create(&store, &p("/nodir/x"), false).unwrap();
        assert_eq!(ws.list(&store, &p("/nodir")).unwrap(), vec!["x"]);
    }

    #[test]
    fn delete_non_empty_directory_fails() {
        let (_dir, store) = store_with(&[("/d/x", b"1")], &["/d"]);
        let mut ws = Workspace::new();
        assert!(matches!(ws.delete(&store, &p("/d")), Err(TxError::DirectoryNotEmpty(_))));
        ws.delete(&store, &p("/d/x")).unwrap();
        assert!(ws.delete(&store, &p("/d")).unwrap());
        assert_eq!(ws.exists(&store, &p("/d")).unwrap(), None);
        assert_eq!(ws.exists(&store, &p("/d/x")).unwrap(), None);
    }

    #[test]
    fn directory_move_carries_children_and_overrides() {
        let (_dir, store) = store_with(&[("/src/a", b"A"), ("/src/b", b"B")], &["/src"]);
        let mut ws = Workspace::new();
        ws.append(&store, &p("/src/a"), b"!").unwrap();
        ws.delete(&store, &p("/src/b")).unwrap();
        ws.create(&store, &p("/src/c"), false).unwrap();

        assert!(ws.move_path(&store, &p("/src"), &p("/dst")).unwrap());
        assert_eq!(ws.exists(&store, &p("/src")).unwrap(), None);
        assert_eq!(ws.list(&store, &p("/dst")).unwrap(), vec!["a", "c"]);
        assert_eq!(ws.read(&store, &p("/dst/a"), 0, 10).unwrap(), b"A!");
        assert!(ws.list(&store, &ResourcePath::root()).unwrap().contains(&"dst".to_string()));

        commit(&mut ws, &store);
        assert_eq!(store.read_at(&p("/dst/a"), 0, 10).unwrap(), b"A!");
        assert_eq!(store.list(&p("/dst")).unwrap(), vec!["a", "c"]);
        assert_eq!(store.metadata(&p("/src")).unwrap(), None);
    }

    #[test]
    fn move_into_itself_is_rejected() {
        let (_dir, store) = store_with(&[], &["/d"]);
        let mut ws = Workspace::new();
        assert!(matches!(
            ws.move_path(&store, &p("/d"), &p("/d/e")),
            Err(TxError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn copy_snapshots_content() {
        let (_dir, store) = store_with(&[("/a", b"data")], &[]);
        let mut ws = Workspace::new();
        ws.copy(&store, &p("/a"), &p("/b")).unwrap();
        ws.append(&store, &p("/a"), b"-more").unwrap();
        assert_eq!(ws.read(&store, &p("/b"), 0, 100).unwrap(), b"data");
        commit(&mut ws, &store);
        assert_eq!(store.read_at(&p("/b"), 0, 100).unwrap(), b"data");
        assert_eq!(store.read_at(&p("/a"), 0, 100).unwrap(), b"data-more");
    }

    #[test]
    fn output_stream_marks_workspace_written() {
        let (_dir, store) = store_with(&[("/f", b"x")], &[]);
        let mut ws = Workspace::new();
        ws.open_stream(&store, &p("/f"), StreamKind::Input).unwrap();
        assert!(ws.is_read_only());
        ws.open_stream(&store, &p("/f"), StreamKind::Output { heavy_write: false })
            .unwrap();
        assert!(!ws.is_read_only());
        assert!(ws.effects().is_empty());
        ws.take();
        assert!(ws.is_read_only());
    }

    #[test]
    fn streams_block_delete_and_move() {
        let (_dir, store) = store_with(&[("/d/f", b"")], &["/d"]);
        let mut ws = Workspace::new();
        let id = ws
            .open_stream(&store, &p("/d/f"), StreamKind::Output { heavy_write: false })
            .unwrap();
        assert!(matches!(ws.delete(&store, &p("/d/f")), Err(TxError::FileUnderUse(_))));
        assert!(matches!(
            ws.move_path(&store, &p("/d"), &p("/e")),
            Err(TxError::FileUnderUse(_))
        ));
        assert!(matches!(
            ws.open_stream(&store, &p("/d/f"), StreamKind::Output { heavy_write: true }),
            Err(TxError::FileUnderUse(_))
        ));
        ws.open_stream(&store, &p("/d/f"), StreamKind::Output { heavy_write: false })
            .unwrap();
        assert!(ws.close_stream(id));
        assert!(!ws.close_stream(id));
    }

    #[test]
    fn events_follow_operations() {
        let (_dir, store) = store_with(&[], &[]);
        let mut ws = Workspace::new();
        ws.create(&store, &p("/x"), false).unwrap();
        ws.move_path(&store, &p("/x"), &p("/y")).unwrap();
        ws.truncate(&store, &p("/y"), 0).unwrap();
        let kinds: Vec<_> = ws.events().iter().map(|e| (e.path.to_string(), e.event_type)).collect();
        assert_eq!(
            kinds,
            vec![
                ("/x".to_string(), EventMask::CREATED),
                ("/x".to_string(), EventMask::DELETED),
                ("/y".to_string(), EventMask::CREATED),
                ("/y".to_string(), EventMask::MODIFIED),
            ]
        );
    }

    #[test]
    fn recreate_after_delete_starts_empty() {
        let (_dir, store) = store_with(&[("/d/old", b"x")], &["/d"]);
        let mut ws = Workspace::new();
        ws.delete(&store, &p("/d/old")).unwrap();
        ws.delete(&store, &p("/d")).unwrap();
        ws.create(&store, &p("/d"), true).unwrap();
        assert!(ws.list(&store, &p("/d")).unwrap().is_empty());
        commit(&mut ws, &store);
        assert!(store.list(&p("/d")).unwrap().is_empty());
    }
}
