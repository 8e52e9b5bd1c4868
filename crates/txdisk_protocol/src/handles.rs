//! Handle arena for objects that live on the serving side.

use std::collections::HashMap;

/// Opaque reference to a hosted object.
pub type Handle = u32;

/// Objects held on behalf of a remote client, keyed by handle.
///
/// Handles start at 1 and are not reused until the counter wraps.
#[derive(Debug)]
pub struct HostedObjects<T> {
    next: Handle,
    items: HashMap<Handle, T>,
}

impl<T> Default for HostedObjects<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HostedObjects<T> {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self {
            next: 1,
            items: HashMap::new(),
        }
    }

    /// Stores `item` and returns its handle.
    pub fn insert(&mut self, item: T) -> Handle {
        while self.next == 0 || self.items.contains_key(&self.next) {
            self.next = self.next.wrapping_add(1);
        }
        let handle = self.next;
        self.next = self.next.wrapping_add(1);
        self.items.insert(handle, item);
        handle
    }

    /// Looks up a handle.
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.items.get(&handle)
    }

    /// Looks up a handle for mutation.
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.items.get_mut(&handle)
    }

    /// Drops the object behind a handle.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        self.items.remove(&handle)
    }

    /// Removes every object matching `pred`.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(|_, item| !pred(item));
        before - self.items.len()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing is hosted.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_distinct_and_nonzero() {
        let mut arena = HostedObjects::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.remove(a), Some("a"));
        assert!(arena.get(a).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn wrap_skips_live_handles() {
        let mut arena = HostedObjects::new();
        arena.next = u32::MAX;
        let last = arena.insert(1);
        assert_eq!(last, u32::MAX);
        let first = arena.insert(2);
        assert_eq!(first, 1);
        arena.next = 1;
        assert_eq!(arena.insert(3), 2);
    }

    #[test]
    fn remove_where_filters() {
        let mut arena = HostedObjects::new();
        for n in 0..6 {
            arena.insert(n);
        }
        assert_eq!(arena.remove_where(|n| n % 2 == 0), 3);
        assert_eq!(arena.len(), 3);
    }
}
