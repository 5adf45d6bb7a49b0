//! Pathname reconstruction.

use std::sync::Arc;

use tracing::warn;

use super::node::Node;
use super::{Bridge, FileEntry};

/// Joins a child name onto a parent path. The root's path is the empty
/// string, so its children are bare names.
#[must_use]
pub fn child_path_of(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        return child.to_owned();
    }
    format!("{parent}/{child}")
}

impl<B> Bridge<B> {
    /// Builds the path of `node` relative to the root by walking the newest
    /// parent edges upward.
    ///
    /// A node with no chain to the root gets a synthetic placeholder path
    /// instead, so the backend can fail the request with an ordinary
    /// not-found status.
    pub(crate) fn path_of(&self, node: &Arc<Node>) -> String {
        let root = self.root();
        if Arc::ptr_eq(node, &root) {
            return String::new();
        }

        let mut segments = Vec::new();
        let mut it = Arc::clone(node);
        while !Arc::ptr_eq(&it, &root) {
            // Upgrading under the lock: while the entry exists the parent is
            // live and strongly held by the node map.
            let next = {
                let state = it.lock();
                state.parents.get().map(|pe| (pe.name.clone(), pe.upgrade()))
            };
            let Some((name, Some(parent))) = next else {
                let placeholder = format!(".pathfs.orphaned/{}.{}", node.ino, rand::random::<u64>());
                warn!(
                    ino = node.ino,
                    placeholder, "inode is orphaned, replacing path"
                );
                return placeholder;
            };
            segments.push(name);
            it = parent;
        }

        segments.reverse();
        segments.join("/")
    }

    /// The path for a request that carries a file handle: the path captured
    /// at open time when there is one, else a fresh graph walk.
    pub(crate) fn fpath_of(&self, node: &Arc<Node>, file: &FileEntry) -> String {
        if file.path.is_empty() {
            self.path_of(node)
        } else {
            file.path.clone()
        }
    }
}
