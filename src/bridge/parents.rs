//! Per-node store of incoming directory edges.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::node::Node;

/// Logical clock for displacement stamps. Only the relative order of stamps
/// is ever consulted, so a process-wide counter is enough.
static STAMP: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_stamp() -> u64 {
    STAMP.fetch_add(1, Ordering::Relaxed)
}

/// One `(parent directory, name)` edge pointing at a node.
///
/// Holds the parent weakly: the child-to-parent direction is a back edge,
/// and the bridge's node map plus the parent's own `children` entry keep the
/// parent strongly alive for as long as this entry exists.
#[derive(Clone)]
pub(crate) struct ParentEntry {
    pub(crate) name: String,
    pub(crate) parent: Weak<Node>,
}

impl ParentEntry {
    pub(crate) fn new(name: impl Into<String>, parent: &Arc<Node>) -> Self {
        Self {
            name: name.into(),
            parent: Arc::downgrade(parent),
        }
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<Node>> {
        self.parent.upgrade()
    }
}

impl PartialEq for ParentEntry {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && Weak::ptr_eq(&self.parent, &other.parent)
    }
}

impl Eq for ParentEntry {}

/// Stores zero or more parents of a node, remembering which one is the most
/// recent.
///
/// No internal locking: the owning node's lock protects all access.
#[derive(Default)]
pub(crate) struct ParentSet {
    /// The most-recently `add`ed parent. `None` when there are no parents.
    newest: Option<ParentEntry>,
    /// Parents in addition to `newest`, each with the stamp at which it was
    /// displaced from `newest`. Empty when there are <= 1 parents.
    other: Vec<(ParentEntry, u64)>,
}

impl ParentSet {
    /// Adds a parent to the store, making it the newest.
    pub(crate) fn add(&mut self, entry: ParentEntry) {
        let Some(newest) = self.newest.take() else {
            self.newest = Some(entry);
            return;
        };
        if newest == entry {
            self.newest = Some(newest);
            return;
        }
        // The old newest gets displaced; the new parent moves up from
        // `other` if it was already known.
        self.other.push((newest, next_stamp()));
        self.other.retain(|(e, _)| *e != entry);
        self.newest = Some(entry);
    }

    /// The most recent parent, or `None` if there is no parent at all.
    pub(crate) fn get(&self) -> Option<&ParentEntry> {
        self.newest.as_ref()
    }

    /// All known parents, in unspecified order.
    pub(crate) fn all(&self) -> Vec<ParentEntry> {
        let mut out = Vec::with_capacity(self.count());
        if let Some(newest) = &self.newest {
            out.push(newest.clone());
        }
        out.extend(self.other.iter().map(|(e, _)| e.clone()));
        out
    }

    /// All known parents ordered oldest to newest; the `newest` entry is
    /// last. This is the order the serializer emits.
    pub(crate) fn sorted(&self) -> Vec<ParentEntry> {
        let mut displaced: Vec<_> = self.other.clone();
        displaced.sort_by_key(|&(_, stamp)| stamp);
        let mut out: Vec<_> = displaced.into_iter().map(|(e, _)| e).collect();
        out.extend(self.newest.iter().cloned());
        out
    }

    /// All known parents with their stamps, oldest to newest, for the
    /// serializer. The `newest` entry comes last and is stamped fresh, which
    /// keeps it newest when the stream is replayed through [`add`] on the
    /// receiving side.
    ///
    /// [`add`]: ParentSet::add
    pub(crate) fn dump_entries(&self) -> Vec<(ParentEntry, u64)> {
        let mut out: Vec<_> = self.other.clone();
        out.sort_by_key(|&(_, stamp)| stamp);
        out.extend(self.newest.iter().map(|e| (e.clone(), next_stamp())));
        out
    }

    pub(crate) fn delete(&mut self, entry: &ParentEntry) {
        let Some(newest) = &self.newest else {
            return;
        };
        // If it's not the newest it must be in `other` (or nowhere).
        if newest != entry {
            self.other.retain(|(e, _)| e != entry);
            return;
        }
        // Deleting the newest: the most recently displaced entry takes over.
        let Some(promoted) = self
            .other
            .iter()
            .enumerate()
            .max_by_key(|&(_, &(_, stamp))| stamp)
            .map(|(i, _)| i)
        else {
            self.newest = None;
            return;
        };
        self.newest = Some(self.other.swap_remove(promoted).0);
    }

    pub(crate) fn clear(&mut self) {
        self.newest = None;
        self.other = Vec::new();
    }

    pub(crate) fn count(&self) -> usize {
        if self.newest.is_none() {
            return 0;
        }
        1 + self.other.len()
    }
}
