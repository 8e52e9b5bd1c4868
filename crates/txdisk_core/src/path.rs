//! Normalized resource paths.
//!
//! Every file or directory the engine manages is named by a
//! [`ResourcePath`]: an absolute, `/`-separated path relative to the
//! engine's data root. Normalization resolves `.` and `..`, collapses
//! repeated separators and drops trailing slashes, so two spellings of
//! the same resource always map to the same lock table entry.

use crate::error::{TxError, TxResult};
use std::borrow::Borrow;
use std::fmt;
use std::path::{Path, PathBuf};

/// A normalized absolute resource path such as `/a/b.txt`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourcePath(String);

impl ResourcePath {
    /// Parses and normalizes a path.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::InvalidPath`] if the path is relative, contains a
    /// NUL byte, or climbs above the root with `..`.
    pub fn parse(raw: &str) -> TxResult<Self> {
        if !raw.starts_with('/') {
            return Err(TxError::InvalidPath(raw.to_string()));
        }
        if raw.contains('\0') {
            return Err(TxError::InvalidPath(raw.to_string()));
        }
        let mut parts: Vec<&str> = Vec::new();
        for part in raw.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if parts.pop().is_none() {
                        return Err(TxError::InvalidPath(raw.to_string()));
                    }
                }
                name => parts.push(name),
            }
        }
        if parts.is_empty() {
            return Ok(Self::root());
        }
        let mut normalized = String::with_capacity(raw.len());
        for part in parts {
            normalized.push('/');
            normalized.push_str(part);
        }
        Ok(Self(normalized))
    }

    /// The root of the managed tree.
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Returns the path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for `/`.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Returns the parent directory, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Returns the last component, or `None` for the root.
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Appends one component.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::InvalidPath`] if `name` is empty or contains a separator.
    pub fn join(&self, name: &str) -> TxResult<Self> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(TxError::InvalidPath(format!("{}/{name}", self.0)));
        }
        if self.is_root() {
            Ok(Self(format!("/{name}")))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }

    /// The string every strict descendant starts with.
    #[must_use]
    pub fn descendant_prefix(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("{}/", self.0)
        }
    }

    /// Returns true if `self` is a strict ancestor of `other`.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &ResourcePath) -> bool {
        self != other && other.0.starts_with(&self.descendant_prefix())
    }

    /// Returns true if `self` equals `other` or lies beneath it.
    #[must_use]
    pub fn starts_with(&self, other: &ResourcePath) -> bool {
        self == other || other.is_ancestor_of(self)
    }

    /// Moves `self` from under `from` to under `to`.
    ///
    /// Returns `None` if `self` is not `from` or one of its descendants.
    #[must_use]
    pub fn rebase(&self, from: &ResourcePath, to: &ResourcePath) -> Option<Self> {
        if self == from {
            return Some(to.clone());
        }
        let rest = self.0.strip_prefix(&from.descendant_prefix())?;
        if to.is_root() {
            Some(Self(format!("/{rest}")))
        } else {
            Some(Self(format!("{}/{rest}", to.0)))
        }
    }

    /// Iterates over strict ancestors, nearest first, ending with the root.
    pub fn ancestors(&self) -> impl Iterator<Item = ResourcePath> {
        std::iter::successors(self.parent(), ResourcePath::parent)
    }

    /// Resolves the path under a physical root directory.
    #[must_use]
    pub fn to_physical(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for part in self.0.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ResourcePath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ResourcePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ResourcePath {
    type Error = TxError;

    fn try_from(value: &str) -> TxResult<Self> {
        Self::parse(value)
    }
}
