//! An in-memory path backend that records every call it receives.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use pathfs::backend::{CreatedFile, OpenedFile, PathFs};
use pathfs::types::{
    CommonAttr, DirEntry, DirEntryType, FileAttr, FilesystemStats, OpenFlags, Permissions,
};
use pathfs::{Context, Errno};

#[derive(Debug, Clone, Copy)]
pub struct MockNode {
    pub ino: u64,
    pub is_dir: bool,
}

#[derive(Debug, Default)]
pub struct MockState {
    /// Path (relative, `/`-separated) to node. The root is implicit.
    pub entries: BTreeMap<String, MockNode>,
    pub next_ino: u64,
    pub next_ufh: u64,
    /// Every operation in arrival order, e.g. `"chmod d1/f1"`.
    pub ops: Vec<String>,
    pub lsdir_calls: usize,
    pub released: Vec<u64>,
}

pub struct MockFs {
    pub state: Mutex<MockState>,
}

pub fn attr_for(node: MockNode) -> FileAttr {
    let mut common = CommonAttr::zeroed(node.ino);
    if node.is_dir {
        common.perm = Permissions::from_bits_truncate(0o755);
        FileAttr::Directory { common }
    } else {
        common.perm = Permissions::from_bits_truncate(0o644);
        FileAttr::RegularFile {
            common,
            size: 0,
            blocks: 0,
        }
    }
}

impl MockFs {
    /// A backend pre-populated with `(path, ino, is_dir)` rows.
    pub fn with_entries(rows: &[(&str, u64, bool)]) -> Self {
        let entries = rows
            .iter()
            .map(|&(path, ino, is_dir)| (path.to_owned(), MockNode { ino, is_dir }))
            .collect();
        Self {
            state: Mutex::new(MockState {
                entries,
                next_ino: 1000,
                // Distinct from the bridge's dense slot indices, so tests
                // can tell the two handle spaces apart.
                next_ufh: 100,
                ..MockState::default()
            }),
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn lsdir_calls(&self) -> usize {
        self.state.lock().unwrap().lsdir_calls
    }

    pub fn released(&self) -> Vec<u64> {
        self.state.lock().unwrap().released.clone()
    }

    pub fn remove_entry(&self, path: &str) {
        self.state.lock().unwrap().entries.remove(path);
    }

    fn lookup_node(state: &MockState, path: &str) -> Result<MockNode, Errno> {
        if path.is_empty() {
            return Ok(MockNode {
                ino: 1,
                is_dir: true,
            });
        }
        state.entries.get(path).copied().ok_or(Errno::ENOENT)
    }
}

#[async_trait]
impl PathFs for MockFs {
    async fn getattr(&self, _ctx: &Context, path: &str, u_fh: u64) -> Result<FileAttr, Errno> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("getattr {path} fh={u_fh}"));
        Self::lookup_node(&state, path).map(attr_for)
    }

    async fn lsdir(&self, _ctx: &Context, path: &str) -> Result<Vec<DirEntry>, Errno> {
        let mut state = self.state.lock().unwrap();
        state.lsdir_calls += 1;
        state.ops.push(format!("lsdir {path}"));
        Self::lookup_node(&state, path)?;

        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{path}/")
        };
        let entries = state
            .entries
            .iter()
            .filter_map(|(entry_path, node)| {
                let name = entry_path.strip_prefix(&prefix)?;
                if name.is_empty() || name.contains('/') {
                    return None;
                }
                Some(DirEntry {
                    ino: node.ino,
                    name: name.to_owned(),
                    kind: if node.is_dir {
                        DirEntryType::Directory
                    } else {
                        DirEntryType::RegularFile
                    },
                })
            })
            .collect();
        Ok(entries)
    }

    async fn create(
        &self,
        _ctx: &Context,
        path: &str,
        _flags: OpenFlags,
        _mode: u32,
    ) -> Result<CreatedFile, Errno> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("create {path}"));
        let ino = state.next_ino;
        state.next_ino += 1;
        state
            .entries
            .insert(path.to_owned(), MockNode { ino, is_dir: false });
        let u_fh = state.next_ufh;
        state.next_ufh += 1;
        Ok(CreatedFile {
            u_fh,
            force_direct_io: false,
        })
    }

    async fn open(&self, _ctx: &Context, path: &str, _flags: OpenFlags) -> Result<OpenedFile, Errno> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("open {path}"));
        Self::lookup_node(&state, path)?;
        let u_fh = state.next_ufh;
        state.next_ufh += 1;
        Ok(OpenedFile {
            u_fh,
            keep_cache: false,
            force_direct_io: false,
        })
    }

    async fn read(
        &self,
        _ctx: &Context,
        path: &str,
        u_fh: u64,
        offset: u64,
        _size: u32,
    ) -> Result<Bytes, Errno> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("read {path} fh={u_fh} off={offset}"));
        Ok(Bytes::new())
    }

    async fn release(&self, _ctx: &Context, path: &str, u_fh: u64) {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("release {path}"));
        state.released.push(u_fh);
    }

    async fn mkdir(&self, _ctx: &Context, path: &str, _mode: u32) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("mkdir {path}"));
        let ino = state.next_ino;
        state.next_ino += 1;
        state
            .entries
            .insert(path.to_owned(), MockNode { ino, is_dir: true });
        Ok(())
    }

    async fn unlink(&self, _ctx: &Context, path: &str) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("unlink {path}"));
        state.entries.remove(path).map(|_| ()).ok_or(Errno::ENOENT)
    }

    async fn rmdir(&self, _ctx: &Context, path: &str) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("rmdir {path}"));
        state.entries.remove(path).map(|_| ()).ok_or(Errno::ENOENT)
    }

    async fn rename(&self, _ctx: &Context, path: &str, new_path: &str) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("rename {path} -> {new_path}"));
        let moved = state.entries.remove(path).ok_or(Errno::ENOENT)?;
        state.entries.insert(new_path.to_owned(), moved);

        // Carry nested entries along with a moved directory.
        let old_prefix = format!("{path}/");
        let nested: Vec<String> = state
            .entries
            .keys()
            .filter(|k| k.starts_with(&old_prefix))
            .cloned()
            .collect();
        for old_key in nested {
            let node = state.entries.remove(&old_key).unwrap();
            let new_key = format!("{new_path}/{}", &old_key[old_prefix.len()..]);
            state.entries.insert(new_key, node);
        }
        Ok(())
    }

    async fn chmod(&self, _ctx: &Context, path: &str, _u_fh: u64, mode: u32) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("chmod {path} mode={mode:o}"));
        Ok(())
    }

    async fn chown(
        &self,
        _ctx: &Context,
        path: &str,
        _u_fh: u64,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        state
            .ops
            .push(format!("chown {path} uid={uid:?} gid={gid:?}"));
        Ok(())
    }

    async fn truncate(&self, _ctx: &Context, path: &str, _u_fh: u64, size: u64) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("truncate {path} size={size}"));
        Ok(())
    }

    async fn utimens(
        &self,
        _ctx: &Context,
        path: &str,
        _u_fh: u64,
        _atime: Option<std::time::SystemTime>,
        _mtime: Option<std::time::SystemTime>,
    ) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("utimens {path}"));
        Ok(())
    }

    async fn listxattr(&self, _ctx: &Context, path: &str) -> Result<Vec<String>, Errno> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("listxattr {path}"));
        Ok(vec!["user.alpha".to_owned(), "user.beta".to_owned()])
    }

    async fn statfs(&self, _ctx: &Context, _path: &str) -> Result<FilesystemStats, Errno> {
        Ok(FilesystemStats {
            block_size: 4096,
            total_blocks: 42,
            ..FilesystemStats::default()
        })
    }
}
