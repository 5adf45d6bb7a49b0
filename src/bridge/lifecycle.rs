//! Graph mutators: the lookup/forget lifecycle protocol.
//!
//! All four mutators share one shape: snapshot what you need under a small
//! set of locks, drop them, reacquire the full group in the global order,
//! and commit only if the revision counters prove the snapshot still holds.
//! The visible graph changes only while every involved lock is held.

use std::sync::Arc;

use super::Bridge;
use super::node::{Node, NodeGroup};
use super::parents::ParentEntry;

impl<B> Bridge<B> {
    /// Inserts `ino` as child `name` of `parent`, creating the node if the
    /// graph has never seen this inode, and counts one kernel reference.
    ///
    /// Calling twice with the same arguments yields the same node with its
    /// lookup count incremented; calling with the same `ino` under a
    /// different `(parent, name)` records a hard link.
    pub(crate) fn add_child(
        &self,
        parent: &Arc<Node>,
        name: &str,
        ino: u64,
        is_dir: bool,
    ) -> Arc<Node> {
        assert!(
            name != "." && name != "..",
            "BUG: tried to add virtual entry {name:?} to the actual tree"
        );

        let mut child: Option<Arc<Node>> = None;
        loop {
            let fresh: Arc<Node>;
            let mut members: Vec<&Arc<Node>> = vec![parent];
            if let Some(c) = &child {
                members.push(c);
            }
            let mut group = NodeGroup::lock(members);
            let mut graph = self.graph();

            let existing = graph.nodes.get(&ino).map(Arc::clone);
            match (&existing, &child) {
                // We will install a brand new node below.
                (None, None) => {}
                // The inode disappeared while we were looping here; go back
                // to square one.
                (None, Some(_)) => {
                    drop(graph);
                    drop(group);
                    child = None;
                    continue;
                }
                // We have the right node locked.
                (Some(e), Some(c)) if Arc::ptr_eq(e, c) => {}
                // Someone else installed (or replaced) the node; retry with
                // the current occupant so the next round locks it.
                (Some(e), _) => {
                    let e = Arc::clone(e);
                    drop(graph);
                    drop(group);
                    child = Some(e);
                    continue;
                }
            }

            let node = match &child {
                Some(c) => Arc::clone(c),
                None => {
                    fresh = Node::new(ino, is_dir);
                    group.adopt(&fresh);
                    Arc::clone(&fresh)
                }
            };

            {
                let ns = group.state(&node);
                ns.lookup_count += 1;
                ns.revision += 1;
            }

            graph.nodes.insert(ino, Arc::clone(&node));
            if graph.nodes.len() > graph.node_count_high {
                graph.node_count_high = graph.nodes.len();
            }

            group
                .state(parent)
                .children_mut()
                .insert(name.to_owned(), Arc::clone(&node));
            {
                let ns = group.state(&node);
                ns.parents.add(ParentEntry::new(name, parent));
                ns.revision += 1;
            }
            group.state(parent).revision += 1;

            return node;
        }
    }

    /// Balances `nlookup` kernel references against `node`. Returns true if
    /// this call destroyed the node (removed it from the graph and detached
    /// it from every parent).
    ///
    /// Former parents of a destroyed node get a zero-decrement `remove_ref`
    /// themselves, which is how an entire dead subtree unwinds.
    pub(crate) fn remove_ref(&self, node: &Arc<Node>, nlookup: u32) -> bool {
        let mut state = node.lock();
        assert!(
            nlookup <= state.lookup_count,
            "n{} lookup count underflow: lookup_count={}, decrement={}",
            node.ino,
            state.lookup_count,
            nlookup
        );
        if nlookup > 0 {
            state.lookup_count -= nlookup;
            state.revision += 1;
        }

        if state.is_live() {
            return false;
        }

        // First (and only) remover: no later request can reach this node.
        self.graph().nodes.remove(&node.ino);

        loop {
            let rev = state.revision;
            let parents: Vec<(ParentEntry, Arc<Node>)> = state
                .parents
                .all()
                .into_iter()
                .filter_map(|pe| {
                    let parent = pe.upgrade()?;
                    Some((pe, parent))
                })
                .collect();
            drop(state);

            let mut members: Vec<&Arc<Node>> = vec![node];
            members.extend(parents.iter().map(|(_, p)| p));
            let mut group = NodeGroup::lock(members);

            if group.state(node).revision != rev {
                drop(group);
                state = node.lock();
                continue;
            }

            for (pe, parent) in &parents {
                let ps = group.state(parent);
                if !ps.child(&pe.name).is_some_and(|c| Arc::ptr_eq(c, node)) {
                    // another node has replaced us already
                    continue;
                }
                ps.children_mut().remove(&pe.name);
                ps.revision += 1;
            }

            {
                let ns = group.state(node);
                ns.parents.clear();
                ns.revision += 1;
                assert!(
                    ns.lookup_count == 0,
                    "n{} lookup count resurrected during removal: {}",
                    node.ino,
                    ns.lookup_count
                );
            }

            drop(group);

            for (_, parent) in &parents {
                self.remove_ref(parent, 0);
            }
            return true;
        }
    }

    /// Removes the `name` edge under `parent`, if present. The child node
    /// itself stays in the graph until its kernel references drain.
    pub(crate) fn rm_child(&self, parent: &Arc<Node>, name: &str) -> bool {
        loop {
            let (rev, child) = {
                let state = parent.lock();
                (state.revision, state.child(name).map(Arc::clone))
            };
            let Some(child) = child else {
                return false;
            };

            let mut group = NodeGroup::lock(vec![parent, &child]);
            if group.state(parent).revision != rev {
                continue;
            }

            {
                let ps = group.state(parent);
                ps.children_mut().remove(name);
                ps.revision += 1;
            }
            {
                let cs = group.state(&child);
                cs.parents.delete(&ParentEntry::new(name, parent));
                cs.revision += 1;
            }

            let live = group.state(parent).is_live();
            drop(group);

            if !live {
                self.remove_ref(parent, 0);
            }
            return true;
        }
    }

    /// Executes a rename: detaches `(parent, name)` and any overwritten
    /// `(new_parent, new_name)` edge, then reattaches the source child at
    /// the destination. Returns false only when the destination is occupied
    /// and `overwrite` is not set.
    ///
    /// A missing source is allowed: the destination edge (if any) is still
    /// detached and the call reports true.
    pub(crate) fn mv_child(
        &self,
        parent: &Arc<Node>,
        name: &str,
        new_parent: &Arc<Node>,
        new_name: &str,
        overwrite: bool,
    ) -> bool {
        loop {
            let (rev, new_rev, child, dest_child) = {
                let mut group = NodeGroup::lock(vec![parent, new_parent]);
                let rev = group.state(parent).revision;
                let new_rev = group.state(new_parent).revision;
                let child = group.state(parent).child(name).map(Arc::clone);
                let dest_child = group.state(new_parent).child(new_name).map(Arc::clone);
                (rev, new_rev, child, dest_child)
            };

            if dest_child.is_some() && !overwrite {
                return false;
            }

            let mut members: Vec<&Arc<Node>> = vec![parent, new_parent];
            if let Some(c) = &child {
                members.push(c);
            }
            if let Some(c) = &dest_child {
                members.push(c);
            }
            let mut group = NodeGroup::lock(members);

            if group.state(parent).revision != rev || group.state(new_parent).revision != new_rev {
                continue;
            }

            if let Some(c) = &child {
                group.state(parent).children_mut().remove(name);
                group.state(c).parents.delete(&ParentEntry::new(name, parent));
                group.state(parent).revision += 1;
                group.state(c).revision += 1;
            }

            if let Some(d) = &dest_child {
                group.state(new_parent).children_mut().remove(new_name);
                group
                    .state(d)
                    .parents
                    .delete(&ParentEntry::new(new_name, new_parent));
                group.state(new_parent).revision += 1;
                group.state(d).revision += 1;
            }

            if let Some(c) = &child {
                group
                    .state(new_parent)
                    .children_mut()
                    .insert(new_name.to_owned(), Arc::clone(c));
                group
                    .state(c)
                    .parents
                    .add(ParentEntry::new(new_name, new_parent));
                group.state(new_parent).revision += 1;
                group.state(c).revision += 1;
            }

            let live = group.state(parent).is_live();
            let new_live = group.state(new_parent).is_live();
            drop(group);

            if !live {
                self.remove_ref(parent, 0);
            }
            if !new_live {
                self.remove_ref(new_parent, 0);
            }
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;

    use crate::Options;
    use crate::backend::NullFs;
    use crate::bridge::{Bridge, ROOT_INO};

    fn test_bridge() -> Bridge<NullFs> {
        Bridge::new(NullFs, Options::default())
    }

    struct FileInfo {
        name: &'static str,
        ino: u64,
        is_dir: bool,
    }

    const fn f(name: &'static str, ino: u64, is_dir: bool) -> FileInfo {
        FileInfo { name, ino, is_dir }
    }

    fn children_len(b: &Bridge<NullFs>, ino: u64) -> usize {
        b.inode(ino)
            .lock()
            .children
            .as_ref()
            .map_or(0, std::collections::HashMap::len)
    }

    fn parents_count(b: &Bridge<NullFs>, ino: u64) -> usize {
        b.inode(ino).lock().parents.count()
    }

    #[test]
    #[should_panic(expected = "virtual entry")]
    fn dot_entries_are_rejected() {
        let b = test_bridge();
        let root = b.root();
        let _ = b.add_child(&root, ".", 2, true);
    }

    #[test]
    fn add_child_is_idempotent_and_counts_lookups() {
        let b = test_bridge();
        let root = b.root();
        let first = b.add_child(&root, "f1", 2, false);
        let second = b.add_child(&root, "f1", 2, false);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.lock().lookup_count, 2);
        assert!(Arc::ptr_eq(&b.inode(2), &first));
        assert_eq!(b.node_count(), 2);
    }

    /// Scenario: two directories hard-linking the same file; the path goes
    /// through whichever parent was added last.
    #[test]
    fn hard_links_collect_parents_newest_wins() {
        let b = test_bridge();
        let root = b.root();
        for info in [
            f("l1_d1", 2, true),
            f("l1_d2", 3, true),
            f("l1_d3", 4, true),
            f("l1_r1", 5, false),
        ] {
            b.add_child(&root, info.name, info.ino, info.is_dir);
        }
        let d1 = b.inode(2);
        let d2 = b.inode(3);
        b.add_child(&d1, "l2_d1", 6, true);
        b.add_child(&d1, "l2_r1", 7, false);
        b.add_child(&d2, "l2_r1", 7, false);

        assert_eq!(parents_count(&b, 7), 2);
        let file = b.inode(7);
        assert_eq!(b.path_of(&file), "l1_d2/l2_r1", "newest parent wins");

        // Re-adding through the first parent flips the preferred path back.
        b.add_child(&d1, "l2_r1", 7, false);
        assert_eq!(b.path_of(&file), "l1_d1/l2_r1");
        assert_eq!(parents_count(&b, 7), 2);
    }

    /// Scenario: removing one hard link and forgetting the remaining
    /// references destroys the node.
    #[test]
    fn rm_child_then_forgets_destroy_the_node() {
        let b = test_bridge();
        let root = b.root();
        b.add_child(&root, "l1_d1", 2, true);
        b.add_child(&root, "l1_d2", 3, true);
        let d1 = b.inode(2);
        let d2 = b.inode(3);
        b.add_child(&d1, "l2_r1", 7, false);
        b.add_child(&d2, "l2_r1", 7, false);

        assert!(b.rm_child(&d2, "l2_r1"));
        let file = b.inode(7);
        assert!(!b.remove_ref(&file, 1));
        assert!(b.remove_ref(&file, 1));
        assert!(b.try_inode(7).is_none());
        assert_eq!(children_len(&b, 2), 0);
    }

    #[test]
    #[should_panic(expected = "lookup count underflow")]
    fn forgetting_more_than_looked_up_is_fatal() {
        let b = test_bridge();
        let root = b.root();
        let file = b.add_child(&root, "f", 2, false);
        let _ = b.remove_ref(&file, 2);
    }

    /// Parallel sibling insertion, hard-link fan-in, then concurrent unlink
    /// of the links.
    #[test]
    fn add_and_rm_child_walk() {
        let b = test_bridge();
        let root = b.root();
        let files = [
            f("", 0, false),
            f("", 0, false),
            f("l1_d1", 2, true),
            f("l1_d2", 3, true),
            f("l1_d3", 4, true),
            f("l1_r1", 5, false),
            f("l2_d1", 6, true),
            f("l2_r1", 7, false),
            f("l2_d2", 8, true),
            f("l2_f2", 9, false),
        ];

        std::thread::scope(|s| {
            for info in &files[2..=5] {
                let b = &b;
                let root = &root;
                s.spawn(move || {
                    b.add_child(root, info.name, info.ino, info.is_dir);
                });
            }
        });

        assert_eq!(children_len(&b, ROOT_INO), 4);
        let newest = b.inode(4).lock().parents.get().unwrap().upgrade().unwrap();
        assert!(Arc::ptr_eq(&newest, &root));

        let d1 = b.inode(2);
        for info in &files[6..=7] {
            b.add_child(&d1, info.name, info.ino, info.is_dir);
        }

        // [parent ino, child index] pairs, fanned out in parallel.
        let tasks = [(3, 7), (4, 7), (3, 8), (6, 7), (3, 9)];
        std::thread::scope(|s| {
            for &(parent, i) in &tasks {
                let b = &b;
                let files = &files;
                s.spawn(move || {
                    let parent = b.inode(parent);
                    b.add_child(&parent, files[i].name, files[i].ino, files[i].is_dir);
                });
            }
        });

        assert_eq!(b.node_count(), 9);
        assert_eq!(children_len(&b, 3), 3);
        assert_eq!(parents_count(&b, 7), 4);

        // Drop inode 3's kernel reference so unlinking its children can
        // reap it through the dead-ancestor unwind.
        b.inode(3).lock().lookup_count = 0;
        let rm_tasks = [(3, 7), (4, 7), (3, 8), (6, 7), (3, 9), (2, 7)];
        std::thread::scope(|s| {
            for &(parent, i) in &rm_tasks {
                let b = &b;
                let files = &files;
                s.spawn(move || {
                    let parent = b.inode(parent);
                    b.rm_child(&parent, files[i].name);
                });
            }
        });

        assert_eq!(b.node_count(), 8);
        assert!(b.try_inode(3).is_none());
        assert_eq!(children_len(&b, 2), 1);
        assert_eq!(parents_count(&b, 7), 0);
    }

    /// Concurrent unlink+forget pairs reap a whole subtree.
    #[test]
    fn remove_ref_reaps_forgotten_subtree() {
        let b = test_bridge();
        let root = b.root();
        let files = [
            f("", 0, false),
            f("", 0, false),
            f("l1_d1", 2, true),
            f("l1_d2", 3, true),
            f("l1_d3", 4, true),
            f("l1_r1", 5, false),
            f("l2_d1", 6, true),
            f("l2_r1", 7, false),
            f("l2_d2", 8, true),
            f("l2_r2", 9, false),
        ];

        for info in &files[2..=5] {
            b.add_child(&root, info.name, info.ino, info.is_dir);
        }
        let add_tasks = [(2, 6), (2, 7), (3, 7), (3, 8), (3, 9), (4, 7)];
        for &(parent, i) in &add_tasks {
            let parent = b.inode(parent);
            b.add_child(&parent, files[i].name, files[i].ino, files[i].is_dir);
        }

        // inode 7 was looked up three times; leave one reference
        // outstanding on the unlink below and drop one up front so the
        // final forget kills it.
        b.inode(7).lock().lookup_count -= 1;

        let forget_tasks = [(6, 1), (7, 1), (7, 1), (8, 1), (9, 1)];
        std::thread::scope(|s| {
            for (i, &(ino, nlookup)) in forget_tasks.iter().enumerate() {
                let b = &b;
                let files = &files;
                s.spawn(move || {
                    let (parent, child) = add_tasks[i];
                    let parent = b.inode(parent);
                    b.rm_child(&parent, files[child].name);
                    // simulate the forget that follows the unlink
                    if let Some(node) = b.try_inode(ino) {
                        b.remove_ref(&node, nlookup);
                    }
                });
            }
        });

        assert_eq!(b.node_count(), 5);
        assert_eq!(children_len(&b, 3), 0);
        assert_eq!(children_len(&b, 4), 0);
        assert!(b.try_inode(7).is_none());
    }

    /// A refused overwrite, then three concurrent moves into one directory.
    #[test]
    fn mv_child_walk() {
        let b = test_bridge();
        let root = b.root();
        let files = [
            f("", 0, false),
            f("", 0, false),
            f("f1", 2, true),
            f("f2", 3, true),
            f("f3", 4, true),
            f("f4", 5, false),
            f("f5", 6, true),
            f("f6", 7, true),
            f("f6", 8, true),
            f("f5", 9, false),
        ];

        let add_tasks = [
            (1, 2),
            (1, 3),
            (1, 4),
            (1, 5),
            (2, 6),
            (2, 7),
            (3, 8),
            (8, 9),
        ];
        for &(parent, i) in &add_tasks {
            let parent = b.inode(parent);
            b.add_child(&parent, files[i].name, files[i].ino, files[i].is_dir);
        }

        // Destination "f5" under inode 8 is occupied and overwrite is off.
        let dest = b.inode(8);
        assert!(!b.mv_child(&root, files[5].name, &dest, files[9].name, false));

        // (source parent, destination parent, moved child index)
        let mv_tasks = [(1, 2, 4), (1, 2, 5), (3, 2, 8)];
        std::thread::scope(|s| {
            for &(from, to, i) in &mv_tasks {
                let b = &b;
                let files = &files;
                s.spawn(move || {
                    let from = b.inode(from);
                    let to = b.inode(to);
                    b.mv_child(&from, files[i].name, &to, files[i].name, true);
                });
            }
        });

        assert_eq!(children_len(&b, ROOT_INO), 2);
        assert_eq!(children_len(&b, 2), 4);
        assert_eq!(children_len(&b, 3), 0);
        // inode 7 ("f6" under f1) was overwritten by the move of inode 8.
        assert_eq!(parents_count(&b, 7), 0);
    }

    /// Law: moving an edge away and back restores the original shape.
    #[test]
    fn mv_child_round_trip_restores_graph() {
        let b = test_bridge();
        let root = b.root();
        b.add_child(&root, "d1", 2, true);
        b.add_child(&root, "d2", 3, true);
        let d1 = b.inode(2);
        let d2 = b.inode(3);
        b.add_child(&d1, "f", 4, false);

        assert!(b.mv_child(&d1, "f", &d2, "g", true));
        assert_eq!(children_len(&b, 2), 0);
        assert_eq!(b.path_of(&b.inode(4)), "d2/g");

        assert!(b.mv_child(&d2, "g", &d1, "f", true));
        assert_eq!(children_len(&b, 3), 0);
        assert_eq!(children_len(&b, 2), 1);
        assert_eq!(b.path_of(&b.inode(4)), "d1/f");
        assert_eq!(parents_count(&b, 4), 1);
    }

    #[test]
    fn mv_child_missing_source_still_detaches_destination() {
        let b = test_bridge();
        let root = b.root();
        b.add_child(&root, "d1", 2, true);
        b.add_child(&root, "d2", 3, true);
        let d1 = b.inode(2);
        let d2 = b.inode(3);
        b.add_child(&d2, "victim", 4, false);

        assert!(b.mv_child(&d1, "missing", &d2, "victim", true));
        assert_eq!(children_len(&b, 3), 0);
        assert_eq!(parents_count(&b, 4), 0);
    }

    #[test]
    fn mv_child_onto_itself_keeps_the_edge() {
        let b = test_bridge();
        let root = b.root();
        b.add_child(&root, "f", 2, false);
        assert!(b.mv_child(&root, "f", &root, "f", true));
        assert_eq!(children_len(&b, ROOT_INO), 1);
        assert_eq!(b.path_of(&b.inode(2)), "f");
    }

    /// Fifty threads inserting distinct names while fifty more insert and
    /// immediately unlink: no panics, consistent survivors.
    #[test]
    fn concurrent_add_and_remove_fuzz() {
        let b = test_bridge();
        let root = b.root();

        std::thread::scope(|s| {
            for i in 0u64..50 {
                let b = &b;
                let root = &root;
                s.spawn(move || {
                    let name = format!("keep{i}");
                    b.add_child(root, &name, i + 100, false);
                });
                s.spawn(move || {
                    let name = format!("churn{i}");
                    b.add_child(root, &name, i + 200, false);
                    b.rm_child(root, &name);
                });
            }
        });

        assert!(b.node_count() >= 1);
        // Every surviving child edge must be mirrored by a parent entry.
        let root_state = root.lock();
        for (name, child) in root_state.children.as_ref().unwrap() {
            let cs = child.lock();
            assert!(
                cs.parents.all().iter().any(|pe| {
                    pe.name == *name && pe.upgrade().is_some_and(|p| Arc::ptr_eq(&p, &root))
                }),
                "child {name} lost its back edge"
            );
        }
    }

    /// Parallel lookups of the same `(parent, name, ino)` must converge on
    /// one node whose lookup count equals the number of calls.
    #[test]
    fn parallel_lookups_converge() {
        let b = test_bridge();
        let root = b.root();
        let calls = 64;

        std::thread::scope(|s| {
            for _ in 0..calls {
                let b = &b;
                let root = &root;
                s.spawn(move || {
                    b.add_child(root, "shared", 77, false);
                });
            }
        });

        let node = b.inode(77);
        assert_eq!(node.lock().lookup_count, calls);
        assert_eq!(children_len(&b, ROOT_INO), 1);
        assert_eq!(parents_count(&b, 77), 1);
    }
}
