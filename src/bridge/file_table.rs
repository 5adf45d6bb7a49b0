//! The open file-handle table.

use std::sync::Arc;

use crate::context::Owner;
use crate::types::DirEntry;

use super::Bridge;

/// One slot of the handle table.
///
/// `opener`, `path` and `u_fh` are fixed when the slot is filled; the
/// directory stream cache has its own lock because it is populated lazily,
/// with the fetching backend call made while the lock is held so the fetch
/// happens exactly once per open.
pub(crate) struct FileEntry {
    /// Credentials captured at open time.
    pub(crate) opener: Owner,
    /// Path captured at open time; used instead of a graph walk while the
    /// handle stays open.
    pub(crate) path: String,
    /// Backend-supplied opaque handle.
    pub(crate) u_fh: u64,
    /// Buffered directory listing, for directory handles.
    pub(crate) stream: tokio::sync::Mutex<Option<Vec<DirEntry>>>,
}

impl FileEntry {
    pub(crate) fn new(
        opener: Owner,
        path: String,
        u_fh: u64,
        stream: Option<Vec<DirEntry>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            opener,
            path,
            u_fh,
            stream: tokio::sync::Mutex::new(stream),
        })
    }

    /// An empty slot: the state of slot 0 and of every vacated slot.
    pub(crate) fn unused() -> Arc<Self> {
        Self::new(Owner::default(), String::new(), 0, None)
    }
}

impl<B> Bridge<B> {
    /// Fills a handle slot and returns its index. Vacated slots are reused
    /// most-recently-freed first; otherwise the table grows by one.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "handle indices fit u32 by construction; the table never grows past u32::MAX"
    )]
    pub(crate) fn register_file(
        &self,
        opener: Owner,
        path: String,
        u_fh: u64,
        stream: Option<Vec<DirEntry>>,
    ) -> u64 {
        let mut graph = self.graph();
        let entry = FileEntry::new(opener, path, u_fh, stream);
        let fh = if let Some(fh) = graph.free_files.pop() {
            graph.files[fh as usize] = entry;
            fh
        } else {
            let fh = graph.files.len() as u32;
            graph.files.push(entry);
            fh
        };
        u64::from(fh)
    }

    /// Vacates a handle slot. The null handle 0 is reserved and ignored.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "handles are issued from u32 indices, see register_file"
    )]
    pub(crate) fn unregister_file(&self, fh: u64) {
        if fh == 0 {
            return;
        }
        let mut graph = self.graph();
        graph.files[fh as usize] = FileEntry::unused();
        graph.free_files.push(fh as u32);
    }
}
