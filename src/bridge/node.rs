//! Inode nodes and the ordered multi-lock primitive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::parents::ParentSet;

/// Lock-ordering keys, assigned once per node at creation. Node identity is
/// what the total lock order is derived from; a stable counter survives map
/// rehashing, which addresses would not.
static NODE_SEQ: AtomicU64 = AtomicU64::new(1);

/// A single inode.
///
/// All mutable state lives behind the per-node mutex; `ino` and `seq` are
/// fixed for the node's lifetime.
pub(crate) struct Node {
    pub(crate) ino: u64,
    pub(crate) seq: u64,
    state: Mutex<NodeState>,
}

pub(crate) struct NodeState {
    /// Incremented on every mutation of the state protected by the node
    /// lock. Snapshot-and-recheck against this counter is what lets
    /// multi-node operations drop and reacquire locks safely.
    pub(crate) revision: u32,
    /// References held by the kernel; balanced by forget.
    pub(crate) lookup_count: u32,
    pub(crate) parents: ParentSet,
    /// Present iff the node is a directory.
    pub(crate) children: Option<HashMap<String, Arc<Node>>>,
}

impl NodeState {
    pub(crate) fn is_live(&self) -> bool {
        self.lookup_count > 0 || self.children.as_ref().is_some_and(|c| !c.is_empty())
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.children.is_some()
    }

    pub(crate) fn child(&self, name: &str) -> Option<&Arc<Node>> {
        self.children.as_ref().and_then(|c| c.get(name))
    }

    /// The children map of a directory node. Calling this on a non-directory
    /// is a caller bug.
    pub(crate) fn children_mut(&mut self) -> &mut HashMap<String, Arc<Node>> {
        self.children
            .as_mut()
            .unwrap_or_else(|| unreachable!("children access on non-directory node"))
    }
}

#[expect(
    clippy::expect_used,
    reason = "mutex poisoning is unrecoverable; panicking is the correct behavior"
)]
impl Node {
    pub(crate) fn new(ino: u64, is_dir: bool) -> Arc<Self> {
        assert!(ino != u64::MAX, "using reserved ID for inode number");
        Arc::new(Self {
            ino,
            seq: NODE_SEQ.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(NodeState {
                revision: 0,
                lookup_count: 0,
                parents: ParentSet::default(),
                children: is_dir.then(HashMap::new),
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().expect("poisoned")
    }
}

/// A group of nodes locked together.
///
/// Locks are taken in ascending `seq` order with duplicates skipped (the
/// same node can be handed in twice, e.g. when `dir/a` and `dir/b` are hard
/// links of one inode), and are released in reverse acquisition order when
/// the group is dropped. Taking groups this way is what keeps multi-node
/// transactions deadlock-free.
pub(crate) struct NodeGroup<'a> {
    members: Vec<&'a Arc<Node>>,
    guards: Vec<MutexGuard<'a, NodeState>>,
}

impl<'a> NodeGroup<'a> {
    pub(crate) fn lock(mut members: Vec<&'a Arc<Node>>) -> Self {
        members.sort_by_key(|n| n.seq);
        members.dedup_by(|a, b| a.seq == b.seq);
        let guards = members.iter().map(|n| n.lock()).collect();
        Self { members, guards }
    }

    /// Adds a freshly created, not-yet-shared node to the group. Locking it
    /// out of order is fine: no other thread can hold or request its lock.
    pub(crate) fn adopt(&mut self, node: &'a Arc<Node>) {
        self.members.push(node);
        self.guards.push(node.lock());
    }

    /// The locked state of a member node.
    pub(crate) fn state(&mut self, node: &Node) -> &mut NodeState {
        let idx = self
            .members
            .iter()
            .position(|m| m.seq == node.seq)
            .unwrap_or_else(|| unreachable!("node {} is not part of the locked group", node.ino));
        &mut self.guards[idx]
    }
}

impl Drop for NodeGroup<'_> {
    fn drop(&mut self) {
        // Reverse acquisition order.
        while self.guards.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_is_strictly_increasing() {
        let a = Node::new(100, false);
        let b = Node::new(101, false);
        assert!(a.seq < b.seq);
    }

    #[test]
    fn fresh_node_shape() {
        let dir = Node::new(7, true);
        let file = Node::new(8, false);
        let ds = dir.lock();
        let fs = file.lock();
        assert!(ds.is_dir());
        assert!(!fs.is_dir());
        assert!(!ds.is_live());
        assert_eq!(ds.revision, 0);
        assert_eq!(ds.lookup_count, 0);
    }

    #[test]
    #[should_panic(expected = "reserved ID")]
    fn reserved_ino_is_rejected() {
        let _ = Node::new(u64::MAX, false);
    }

    #[test]
    fn group_locks_duplicates_once() {
        let a = Node::new(200, true);
        let b = Node::new(201, false);
        let mut group = NodeGroup::lock(vec![&a, &b, &a, &b]);
        group.state(&a).lookup_count = 3;
        group.state(&b).lookup_count = 4;
        drop(group);
        assert_eq!(a.lock().lookup_count, 3);
        assert_eq!(b.lock().lookup_count, 4);
    }
}
