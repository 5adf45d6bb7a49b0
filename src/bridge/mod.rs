//! The inode bridge: a concurrent graph of nodes keyed by inode number that
//! reconstructs pathnames on demand and keeps itself in sync with the
//! kernel's view of the tree.

mod file_table;
mod lifecycle;
mod node;
mod ops;
mod parents;
mod path;
mod serialize;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) use file_table::FileEntry;
pub(crate) use node::Node;

pub use ops::{CreateReply, EntryReply, OpenReply, SetAttrs};
pub use path::child_path_of;
pub use serialize::{
    DumpBridge, DumpFileEntry, DumpInode, DumpParentEntry, InodeDumper, InodeFiller, RestoreError,
};

use crate::backend::PathFs;
use crate::context::Context;
use crate::options::Options;

/// The inode number of the root directory, fixed by the kernel protocol.
pub const ROOT_INO: u64 = 1;

/// State shared across all requests, guarded by one mutex.
///
/// Lock order: any per-node locks first, this lock last.
pub(crate) struct GraphState {
    pub(crate) root: Arc<Node>,
    /// The authoritative index. A node is present exactly when it is
    /// referenced by the kernel, has at least one child, or is the root.
    pub(crate) nodes: HashMap<u64, Arc<Node>>,
    /// High-water mark of `nodes.len()` since the last compaction.
    pub(crate) node_count_high: usize,
    /// File handle table. Slot 0 is permanently the null handle.
    pub(crate) files: Vec<Arc<FileEntry>>,
    /// LIFO free-list of vacated handle indices.
    pub(crate) free_files: Vec<u32>,
}

/// Path-oriented adapter over the kernel filesystem protocol.
///
/// Maintains the inode graph, translates each kernel request into a path
/// string relative to the root, invokes the path-keyed backend, and updates
/// the graph from the outcome. One request-adapter method per kernel
/// operation lives in this type; the [`PathFuse`](crate::PathFuse) wrapper
/// exposes them as a mountable `fuser` filesystem.
pub struct Bridge<B> {
    fs: B,
    options: Options,
    graph: Mutex<GraphState>,
}

#[expect(
    clippy::expect_used,
    reason = "mutex poisoning is unrecoverable; panicking is the correct behavior"
)]
impl<B> Bridge<B> {
    /// Creates a bridge over `fs` with an empty tree: just the root
    /// directory (ino 1, one kernel reference) and the null file slot.
    pub fn new(fs: B, options: Options) -> Self {
        let root = Node::new(ROOT_INO, true);
        root.lock().lookup_count = 1;
        let nodes = HashMap::from([(ROOT_INO, Arc::clone(&root))]);
        Self {
            fs,
            options,
            graph: Mutex::new(GraphState {
                root,
                nodes,
                node_count_high: 1,
                files: vec![FileEntry::unused()],
                free_files: Vec::new(),
            }),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The backend this bridge serves.
    pub fn backend(&self) -> &B {
        &self.fs
    }

    pub(crate) fn graph(&self) -> MutexGuard<'_, GraphState> {
        self.graph.lock().expect("poisoned")
    }

    pub(crate) fn root(&self) -> Arc<Node> {
        Arc::clone(&self.graph().root)
    }

    /// Number of nodes currently in the graph.
    pub fn node_count(&self) -> usize {
        self.graph().nodes.len()
    }

    /// Resolves an inode number the kernel handed us. The kernel can only
    /// ever send numbers we issued, so an unknown one is a protocol
    /// violation and fatal.
    pub(crate) fn inode(&self, ino: u64) -> Arc<Node> {
        self.graph()
            .nodes
            .get(&ino)
            .map(Arc::clone)
            .unwrap_or_else(|| panic!("unknown node {ino}"))
    }

    /// Non-panicking lookup, for paths where absence is an answer.
    pub(crate) fn try_inode(&self, ino: u64) -> Option<Arc<Node>> {
        self.graph().nodes.get(&ino).map(Arc::clone)
    }

    /// Resolves an `(ino, fh)` pair and stamps the file's opener into the
    /// request context. Both must be known; `fh` 0 is the null slot.
    pub(crate) fn inode_and_file(
        &self,
        ino: u64,
        fh: u64,
        ctx: &mut Context,
    ) -> (Arc<Node>, Arc<FileEntry>) {
        let graph = self.graph();
        let node = graph
            .nodes
            .get(&ino)
            .map(Arc::clone)
            .unwrap_or_else(|| panic!("unknown node {ino}"));
        let file = graph
            .files
            .get(usize::try_from(fh).expect("file handle exceeds table range"))
            .map(Arc::clone)
            .unwrap_or_else(|| panic!("unknown file {fh}"));
        if fh != 0 {
            ctx.opener = Some(file.opener);
        }
        (node, file)
    }

    /// Rebuilds the node map after a surge of deletions, releasing the
    /// capacity the surge grew. Cheap no-op unless the high-water mark is
    /// more than 100x the current population.
    pub fn compact_memory(&self) {
        let mut graph = self.graph();
        if graph.node_count_high <= graph.nodes.len() * 100 {
            return;
        }

        let mut fresh = HashMap::with_capacity(graph.nodes.len());
        fresh.extend(graph.nodes.iter().map(|(&ino, n)| (ino, Arc::clone(n))));
        graph.nodes = fresh;
        graph.node_count_high = graph.nodes.len();
    }
}

impl<B: PathFs> Bridge<B> {
    /// Transport start-of-session hook. Nothing to do.
    pub fn init(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullFs;

    pub(crate) fn test_bridge() -> Bridge<NullFs> {
        Bridge::new(NullFs, Options::default())
    }

    #[test]
    fn new_bridge_has_root_and_null_slot() {
        let b = test_bridge();
        assert_eq!(b.node_count(), 1);
        let root = b.inode(ROOT_INO);
        let state = root.lock();
        assert_eq!(state.lookup_count, 1);
        assert!(state.is_dir());
        assert_eq!(b.graph().files.len(), 1);
    }

    #[test]
    #[should_panic(expected = "unknown node")]
    fn unknown_ino_is_fatal() {
        let b = test_bridge();
        let _ = b.inode(42);
    }

    #[test]
    fn compaction_is_a_noop_below_threshold() {
        let b = test_bridge();
        b.graph().node_count_high = 50;
        b.compact_memory();
        assert_eq!(b.graph().node_count_high, 50);
    }

    #[test]
    fn compaction_resets_high_water_mark() {
        let b = test_bridge();
        b.graph().node_count_high = 1_000_000;
        b.compact_memory();
        assert_eq!(b.graph().node_count_high, 1);
        assert_eq!(b.node_count(), 1);
    }
}
