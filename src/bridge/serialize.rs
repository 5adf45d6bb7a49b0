//! Streaming dump and restore of the inode graph.
//!
//! A running process hands its tree to a successor by sending the
//! [`DumpBridge`] header followed by one [`DumpInode`] record per node. The
//! records carry no framing of their own (every type here derives serde, so
//! the caller picks the encoding) and may be delivered in any order: the
//! filler creates directory placeholders for parents it has not seen yet
//! and fills them in when their own record arrives.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::Owner;
use crate::types::DirEntry;

use super::node::Node;
use super::parents::ParentEntry;
use super::{Bridge, FileEntry, GraphState, ROOT_INO};

/// Snapshot of one file-handle slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpFileEntry {
    pub opener: Owner,
    pub path: String,
    pub u_fh: u64,
    pub stream: Option<Vec<DirEntry>>,
}

/// The dump header: everything except the per-node stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpBridge {
    /// Number of [`DumpInode`] records the receiver should expect.
    pub node_count: usize,
    /// Dense snapshot of the handle table, slot 0 included.
    pub files: Vec<DumpFileEntry>,
    pub free_files: Vec<u32>,
}

/// One incoming edge of a dumped node. Records are ordered oldest to newest
/// within [`DumpInode::parents`]; `stamp` preserves the displacement order
/// for consumers that want it, the filler relies on the record order alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpParentEntry {
    pub name: String,
    pub parent_ino: u64,
    pub stamp: u64,
}

/// One node of the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpInode {
    pub ino: u64,
    pub revision: u32,
    pub lookup_count: u32,
    pub parents: Vec<DumpParentEntry>,
    pub is_dir: bool,
}

/// Why a restore could not complete.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RestoreError {
    #[error("root inode not found")]
    RootMissing,
    #[error("expected {expected} inodes, but only got {got} inodes")]
    MissingInodes { expected: usize, got: usize },
}

/// Lazy stream of per-node records, snapshotted at dump start.
pub struct InodeDumper {
    inodes: Vec<Arc<Node>>,
    off: usize,
}

impl Iterator for InodeDumper {
    type Item = DumpInode;

    fn next(&mut self) -> Option<DumpInode> {
        let node = self.inodes.get(self.off)?;
        self.off += 1;

        let state = node.lock();
        let parents = state
            .parents
            .dump_entries()
            .into_iter()
            .filter_map(|(pe, stamp)| {
                let Some(parent) = pe.upgrade() else {
                    warn!(ino = node.ino, name = %pe.name, "dropping dangling parent edge from dump");
                    return None;
                };
                Some(DumpParentEntry {
                    name: pe.name,
                    parent_ino: parent.ino,
                    stamp,
                })
            })
            .collect();

        Some(DumpInode {
            ino: node.ino,
            revision: state.revision,
            lookup_count: state.lookup_count,
            parents,
            is_dir: state.is_dir(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.inodes.len() - self.off;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for InodeDumper {}

/// Rebuilds a graph from a dump stream, in any record order.
pub struct InodeFiller<'a, B> {
    bridge: &'a Bridge<B>,
    expected: usize,
    added: usize,
}

impl<B> Bridge<B> {
    /// Starts a dump: returns the header and the record stream. The caller
    /// must have quiesced request traffic; records are snapshotted now but
    /// serialized lazily as the iterator is drained.
    pub fn dump(&self) -> (DumpBridge, InodeDumper) {
        let graph = self.graph();

        let files = graph
            .files
            .iter()
            .map(|entry| DumpFileEntry {
                opener: entry.opener,
                path: entry.path.clone(),
                u_fh: entry.u_fh,
                stream: match entry.stream.try_lock() {
                    Ok(stream) => stream.clone(),
                    // A reader still holds the slot; the stream is only a
                    // cache, so the restored handle just refetches.
                    Err(_) => {
                        debug!("directory stream busy during dump, dropping cache");
                        None
                    }
                },
            })
            .collect();

        let header = DumpBridge {
            node_count: graph.nodes.len(),
            files,
            free_files: graph.free_files.clone(),
        };

        let dumper = InodeDumper {
            inodes: graph.nodes.values().map(Arc::clone).collect(),
            off: 0,
        };

        (header, dumper)
    }

    /// Begins a restore from `data`: drops the current graph, installs the
    /// restored handle table, and returns the filler that consumes the node
    /// records. The bridge must not serve requests until
    /// [`InodeFiller::finished`] succeeds.
    pub fn restore(&self, data: DumpBridge) -> InodeFiller<'_, B> {
        let mut graph = self.graph();
        graph.nodes = HashMap::new();
        graph.files = data
            .files
            .into_iter()
            .map(|f| FileEntry::new(f.opener, f.path, f.u_fh, f.stream))
            .collect();
        graph.free_files = data.free_files;
        debug_assert!(!graph.files.is_empty(), "dump lost the null handle slot");

        InodeFiller {
            bridge: self,
            expected: data.node_count,
            added: 0,
        }
    }
}

impl<B> InodeFiller<'_, B> {
    /// Looks up `ino`, inserting a directory-shaped placeholder if the
    /// record for it has not arrived yet. An already-known node is upgraded
    /// in place if it was created without a children map.
    fn get_or_create_dir(graph: &mut GraphState, ino: u64) -> Arc<Node> {
        if let Some(node) = graph.nodes.get(&ino) {
            let node = Arc::clone(node);
            let mut state = node.lock();
            if state.children.is_none() {
                state.children = Some(HashMap::new());
            }
            drop(state);
            return node;
        }
        let node = Node::new(ino, true);
        graph.nodes.insert(ino, Arc::clone(&node));
        node
    }

    /// Installs one node record. Parent edges are replayed oldest to
    /// newest, so the stream's last entry ends up the node's newest parent.
    pub fn add_inode(&mut self, record: DumpInode) {
        // Restore has exclusive access to the graph; the node locks taken
        // below are uncontended and only satisfy the state accessors.
        let mut graph = self.bridge.graph();

        let cur = if let Some(existing) = graph.nodes.get(&record.ino) {
            Arc::clone(existing)
        } else {
            let node = Node::new(record.ino, record.is_dir);
            graph.nodes.insert(record.ino, Arc::clone(&node));
            node
        };

        {
            let mut state = cur.lock();
            state.revision = record.revision;
            state.lookup_count = record.lookup_count;
            if record.is_dir && state.children.is_none() {
                state.children = Some(HashMap::new());
            }
        }

        for pe in record.parents {
            let parent = Self::get_or_create_dir(&mut graph, pe.parent_ino);
            parent
                .lock()
                .children_mut()
                .insert(pe.name.clone(), Arc::clone(&cur));
            cur.lock().parents.add(ParentEntry::new(pe.name, &parent));
        }

        self.added += 1;
    }

    /// Ends the restore: installs the root and verifies that every promised
    /// record arrived. Nodes that were only ever seen as somebody's parent
    /// placeholder still have revision 0 and are logged as lost.
    pub fn finished(self) -> Result<(), RestoreError> {
        let mut graph = self.bridge.graph();

        let root = graph
            .nodes
            .get(&ROOT_INO)
            .map(Arc::clone)
            .ok_or(RestoreError::RootMissing)?;
        graph.root = root;

        if self.added < self.expected {
            for node in graph.nodes.values() {
                if node.lock().revision == 0 {
                    warn!(ino = node.ino, "inode lost in transfer");
                }
            }
            return Err(RestoreError::MissingInodes {
                expected: self.expected,
                got: self.added,
            });
        }

        graph.node_count_high = graph.nodes.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::Options;
    use crate::backend::NullFs;
    use crate::bridge::{Bridge, ROOT_INO};

    use super::RestoreError;

    fn test_bridge() -> Bridge<NullFs> {
        Bridge::new(NullFs, Options::default())
    }

    /// Builds the reference tree: three levels, two hard links, and one
    /// orphan (ino 9: looked up, then unlinked).
    fn construct_dir_tree(b: &Bridge<NullFs>) {
        let root = b.root();
        b.add_child(&root, "l1_d1", 2, true);
        b.add_child(&root, "l1_d2", 3, true);
        b.add_child(&root, "l1_d3", 4, true);
        b.add_child(&root, "l1_r1", 5, false);

        let d1 = b.inode(2);
        b.add_child(&d1, "l2_d1", 6, true);
        b.add_child(&d1, "l2_r1", 7, false);

        let l2d1 = b.inode(6);
        b.add_child(&l2d1, "l3_d1", 8, true);
        b.add_child(&l2d1, "l3_r1", 9, false);

        // hard links
        let d2 = b.inode(3);
        b.add_child(&d2, "l2_d1", 6, true);
        let d3 = b.inode(4);
        b.add_child(&d3, "l2_r1", 7, false);
        let l3d1 = b.inode(8);
        b.add_child(&l3d1, "l1_r1", 5, false);

        // let inode 9 become an orphan
        b.rm_child(&l2d1, "l3_r1");
    }

    /// `(lookup_count, revision, children names->inos, parents oldest->newest)`
    /// of every node, keyed by ino.
    type GraphShape = BTreeMap<u64, (u32, u32, BTreeMap<String, u64>, Vec<(String, u64)>)>;

    fn shape_of(b: &Bridge<NullFs>) -> GraphShape {
        let graph = b.graph();
        graph
            .nodes
            .iter()
            .map(|(&ino, node)| {
                let state = node.lock();
                let children = state
                    .children
                    .as_ref()
                    .map(|c| {
                        c.iter()
                            .map(|(name, child)| (name.clone(), child.ino))
                            .collect()
                    })
                    .unwrap_or_default();
                let parents = state
                    .parents
                    .sorted()
                    .into_iter()
                    .map(|pe| {
                        let parent = pe.upgrade().unwrap();
                        (pe.name, parent.ino)
                    })
                    .collect();
                (ino, (state.lookup_count, state.revision, children, parents))
            })
            .collect()
    }

    fn dir_count(b: &Bridge<NullFs>) -> usize {
        let graph = b.graph();
        graph
            .nodes
            .values()
            .filter(|n| n.lock().is_dir())
            .count()
    }

    #[test]
    fn round_trip_preserves_the_graph() {
        let sender = test_bridge();
        construct_dir_tree(&sender);
        let before = shape_of(&sender);

        let (header, dumper) = sender.dump();
        assert_eq!(header.node_count, sender.node_count());

        let receiver = test_bridge();
        let mut filler = receiver.restore(header);
        for record in dumper {
            filler.add_inode(record);
        }
        filler.finished().unwrap();

        assert_eq!(shape_of(&receiver), before);
        assert_eq!(dir_count(&receiver), dir_count(&sender));

        // The orphan survived the trip: referenced, but unreachable.
        let orphan = receiver.inode(9);
        let state = orphan.lock();
        assert_eq!(state.lookup_count, 1);
        assert_eq!(state.parents.count(), 0);
    }

    #[test]
    fn round_trip_keeps_newest_parent_of_hard_links() {
        let sender = test_bridge();
        construct_dir_tree(&sender);

        let (header, dumper) = sender.dump();
        let receiver = test_bridge();
        let mut filler = receiver.restore(header);
        for record in dumper {
            filler.add_inode(record);
        }
        filler.finished().unwrap();

        // ino 5 was hard-linked under l3_d1 last, and l2_d1's own newest
        // parent is the l1_d2 hard link; both sides must rebuild the same
        // preferred path.
        let sender_path = sender.path_of(&sender.inode(5));
        let receiver_path = receiver.path_of(&receiver.inode(5));
        assert_eq!(sender_path, "l1_d2/l2_d1/l3_d1/l1_r1");
        assert_eq!(receiver_path, sender_path);
    }

    #[test]
    fn round_trip_restores_the_handle_table() {
        let sender = test_bridge();
        construct_dir_tree(&sender);
        let fh = sender.register_file(
            crate::context::Owner { uid: 1, gid: 2 },
            "l1_d1/l2_r1".into(),
            17,
            None,
        );
        let dropped = sender.register_file(crate::context::Owner::default(), "x".into(), 9, None);
        sender.unregister_file(dropped);

        let (header, dumper) = sender.dump();
        let receiver = test_bridge();
        let mut filler = receiver.restore(header);
        for record in dumper {
            filler.add_inode(record);
        }
        filler.finished().unwrap();

        let graph = receiver.graph();
        assert_eq!(graph.files.len(), 3);
        let slot = &graph.files[usize::try_from(fh).unwrap()];
        assert_eq!(slot.u_fh, 17);
        assert_eq!(slot.path, "l1_d1/l2_r1");
        assert_eq!(graph.free_files, vec![u32::try_from(dropped).unwrap()]);
    }

    #[test]
    fn missing_records_fail_the_restore() {
        let sender = test_bridge();
        construct_dir_tree(&sender);

        let (header, dumper) = sender.dump();
        let expected = header.node_count;
        let receiver = test_bridge();
        let mut filler = receiver.restore(header);
        for record in dumper.take(expected - 2) {
            filler.add_inode(record);
        }
        let err = filler.finished().unwrap_err();
        match err {
            RestoreError::MissingInodes {
                expected: want,
                got,
            } => {
                assert_eq!(want, expected);
                assert_eq!(got, expected - 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn restore_without_root_fails() {
        let sender = test_bridge();
        construct_dir_tree(&sender);

        let (header, dumper) = sender.dump();
        let receiver = test_bridge();
        let mut filler = receiver.restore(header);
        let mut skipped = 0usize;
        for record in dumper {
            if record.ino == ROOT_INO {
                skipped += 1;
                continue;
            }
            // Strip edges hanging off the root so no placeholder for it is
            // created either.
            let mut record = record;
            record.parents.retain(|pe| pe.parent_ino != ROOT_INO);
            filler.add_inode(record);
        }
        assert_eq!(skipped, 1);
        assert_eq!(filler.finished().unwrap_err(), RestoreError::RootMissing);
    }

    #[test]
    fn dumper_reports_remaining_len() {
        let sender = test_bridge();
        construct_dir_tree(&sender);
        let (_, dumper) = sender.dump();
        assert_eq!(dumper.len(), sender.node_count());
        let records: Vec<_> = dumper.collect();
        let inos: std::collections::BTreeSet<u64> = records.iter().map(|r| r.ino).collect();
        assert!(inos.contains(&ROOT_INO));
        assert_eq!(inos.len(), records.len(), "each node dumped exactly once");
    }

    /// Restoring into a bridge that already served a different tree fully
    /// replaces it.
    #[test]
    fn restore_replaces_previous_state() {
        let sender = test_bridge();
        construct_dir_tree(&sender);

        let receiver = test_bridge();
        let root = receiver.root();
        receiver.add_child(&root, "stale", 40, false);

        let (header, dumper) = sender.dump();
        let mut filler = receiver.restore(header);
        for record in dumper {
            filler.add_inode(record);
        }
        filler.finished().unwrap();

        assert!(receiver.try_inode(40).is_none());
        assert_eq!(shape_of(&receiver), shape_of(&sender));
        assert_eq!(
            receiver.graph().node_count_high,
            receiver.node_count(),
            "high-water mark reset after restore"
        );
    }
}
