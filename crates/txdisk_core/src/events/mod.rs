//! File-state-change events.
//!
//! Sessions with publication enabled record an event for every change they
//! make. The events are logged with the commit and handed to subscribers
//! only once that commit is durable. Each delivery runs in its own
//! transaction whose commit durably dequeues the event.

mod dead_letter;
mod queue;

pub use dead_letter::{DeadLetter, DeadLetterWriter, DEAD_LETTER_ROTATE_BYTES};
pub use queue::{DeliverFn, EventQueue};

use crate::path::ResourcePath;
use crate::session::Session;
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bitmask of change kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u8);

impl EventMask {
    /// Content or metadata changed.
    pub const MODIFIED: Self = Self(1);
    /// The path was removed.
    pub const DELETED: Self = Self(2);
    /// The path was created.
    pub const CREATED: Self = Self(4);
    /// Every kind.
    pub const ALL: Self = Self(7);

    /// Wraps raw bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit is shared with `other`.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A change to one path made by a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStateChangeEvent {
    /// The changed path.
    pub path: ResourcePath,
    /// Whether the path is a directory.
    pub is_directory: bool,
    /// What happened.
    pub event_type: EventMask,
}

impl FileStateChangeEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(path: ResourcePath, is_directory: bool, event_type: EventMask) -> Self {
        Self {
            path,
            is_directory,
            event_type,
        }
    }
}

impl fmt::Display for FileStateChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_directory { "dir" } else { "file" };
        write!(f, "{kind} {} [{:#05b}]", self.path, self.event_type.bits())
    }
}

/// Which events a subscriber wants: a mask per exact path.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    interests: HashMap<ResourcePath, EventMask>,
}

impl EventFilter {
    /// An empty filter that matches nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds interest in `mask` on `path`.
    #[must_use]
    pub fn watch(mut self, path: ResourcePath, mask: EventMask) -> Self {
        *self.interests.entry(path).or_default() |= mask;
        self
    }

    /// True if the event's path is watched for any of its kinds.
    #[must_use]
    pub fn matches(&self, event: &FileStateChangeEvent) -> bool {
        self.interests
            .get(&event.path)
            .is_some_and(|mask| mask.intersects(event.event_type))
    }
}

/// Error a subscriber returns to reject an event.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Receives events.
///
/// `session` is bound to the delivery transaction: work done through it
/// commits together with the dequeue when `on_event` returns `Ok`, and is
/// rolled back when it returns `Err`, in which case the event goes to the
/// dead-letter files.
pub trait EventSubscriber: Send + Sync {
    /// Handles one event.
    ///
    /// # Errors
    ///
    /// Any error rejects the event.
    fn on_event(&self, event: &FileStateChangeEvent, session: &Session) -> Result<(), SubscriberError>;
}

impl<F> EventSubscriber for F
where
    F: Fn(&FileStateChangeEvent, &Session) -> Result<(), SubscriberError> + Send + Sync,
{
    fn on_event(&self, event: &FileStateChangeEvent, session: &Session) -> Result<(), SubscriberError> {
        self(event, session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    #[test]
    fn mask_operations() {
        let mask = EventMask::CREATED | EventMask::MODIFIED;
        assert_eq!(mask.bits(), 5);
        assert!(mask.contains(EventMask::CREATED));
        assert!(!mask.contains(EventMask::DELETED));
        assert!(mask.intersects(EventMask::MODIFIED | EventMask::DELETED));
    }

    #[test]
    fn filter_matches_exact_path_and_kind() {
        let filter = EventFilter::new().watch(p("/inbox"), EventMask::CREATED);
        assert!(filter.matches(&FileStateChangeEvent::new(p("/inbox"), true, EventMask::CREATED)));
        assert!(!filter.matches(&FileStateChangeEvent::new(p("/inbox"), true, EventMask::DELETED)));
        assert!(!filter.matches(&FileStateChangeEvent::new(p("/inbox/a"), false, EventMask::CREATED)));
    }
}
