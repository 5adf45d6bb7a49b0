//! Request adapter: one entry point per kernel operation.
//!
//! Every method follows the same shape: resolve the inode (and handle) the
//! kernel named, build the path, call the backend, and on success fold the
//! outcome back into the graph.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tracing::warn;

use crate::backend::PathFs;
use crate::context::Context;
use crate::errno::Errno;
use crate::types::{
    DirEntry, DirEntryType, FileAttr, FileLock, FilesystemStats, OpenFlags, Permissions,
};

use super::node::Node;
use super::path::child_path_of;
use super::Bridge;

/// A successful lookup-style reply: the child's identity plus its
/// (post-processed) attributes.
#[derive(Debug, Clone, Copy)]
pub struct EntryReply {
    pub ino: u64,
    pub generation: u64,
    pub attr: FileAttr,
}

/// A successful open.
#[derive(Debug, Clone, Copy)]
pub struct OpenReply {
    pub fh: u64,
    pub keep_cache: bool,
    pub force_direct_io: bool,
}

/// A successful create: entry plus the freshly registered handle.
#[derive(Debug, Clone, Copy)]
pub struct CreateReply {
    pub entry: EntryReply,
    pub fh: u64,
    pub force_direct_io: bool,
}

/// The attribute changes a `setattr` request may carry. Only the present
/// fields are forwarded to the backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl<B> Bridge<B> {
    /// Applies the configured attribute rewrites before a reply goes back
    /// to the kernel: null permission bits become 0644/0755 unless
    /// configured off, and zero uid/gid are substituted.
    fn rewrite_attr(&self, attr: &mut FileAttr) {
        let opts = self.options();
        let is_dir = attr.is_dir();
        let common = attr.common_mut();
        if !opts.null_permissions && common.perm.is_empty() {
            common.perm = Permissions::from_bits_truncate(0o644);
            if is_dir {
                common.perm |= Permissions::from_bits_truncate(0o111);
            }
        }
        if opts.uid != 0 && common.uid == 0 {
            common.uid = opts.uid;
        }
        if opts.gid != 0 && common.gid == 0 {
            common.gid = opts.gid;
        }
    }
}

impl<B: PathFs> Bridge<B> {
    /// Queries the backend for `path` and, on success, installs the result
    /// as child `name` of `parent`. Shared by lookup, mknod, mkdir,
    /// symlink, link, create and readdirplus.
    async fn lookup_installing(
        &self,
        ctx: &Context,
        path: &str,
        parent: &Arc<Node>,
        name: &str,
    ) -> Result<EntryReply, Errno> {
        let mut attr = self.backend().getattr(ctx, path, 0).await?;
        let child = self.add_child(parent, name, attr.ino(), attr.is_dir());
        self.rewrite_attr(&mut attr);
        Ok(EntryReply {
            ino: child.ino,
            generation: 1,
            attr,
        })
    }

    /// Kernel lookup of `name` under the directory `parent_ino`.
    ///
    /// A failed lookup also drops any stale `(parent, name)` edge: the
    /// kernel is telling us it expects the name to resolve, and the backend
    /// says it no longer does.
    pub async fn lookup(
        &self,
        ctx: Context,
        parent_ino: u64,
        name: &str,
    ) -> Result<EntryReply, Errno> {
        let parent = self.inode(parent_ino);
        let path = child_path_of(&self.path_of(&parent), name);

        let looked_up = self.lookup_installing(&ctx, &path, &parent, name).await;
        if looked_up.is_err() {
            self.rm_child(&parent, name);
        }
        looked_up
    }

    /// Balances `nlookup` references from the kernel, compacting the node
    /// map when the node was destroyed.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        let node = self.inode(ino);
        let nlookup = u32::try_from(nlookup).unwrap_or(u32::MAX);
        if self.remove_ref(&node, nlookup) {
            self.compact_memory();
        }
    }

    pub async fn getattr(
        &self,
        mut ctx: Context,
        ino: u64,
        fh: Option<u64>,
    ) -> Result<FileAttr, Errno> {
        let (node, file) = self.inode_and_file(ino, fh.unwrap_or(0), &mut ctx);
        let path = self.fpath_of(&node, &file);

        let mut attr = self.backend().getattr(&ctx, &path, file.u_fh).await?;
        self.rewrite_attr(&mut attr);
        Ok(attr)
    }

    /// Applies the present attribute changes in order (chmod, chown,
    /// truncate, utimens), stopping at the first failure, then re-stats.
    pub async fn setattr(
        &self,
        mut ctx: Context,
        ino: u64,
        fh: Option<u64>,
        changes: SetAttrs,
    ) -> Result<FileAttr, Errno> {
        let (node, file) = self.inode_and_file(ino, fh.unwrap_or(0), &mut ctx);
        let path = self.fpath_of(&node, &file);
        let u_fh = file.u_fh;

        if let Some(mode) = changes.mode {
            self.backend().chmod(&ctx, &path, u_fh, mode).await?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            self.backend()
                .chown(&ctx, &path, u_fh, changes.uid, changes.gid)
                .await?;
        }
        if let Some(size) = changes.size {
            self.backend().truncate(&ctx, &path, u_fh, size).await?;
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            self.backend()
                .utimens(&ctx, &path, u_fh, changes.atime, changes.mtime)
                .await?;
        }

        let mut attr = self.backend().getattr(&ctx, &path, u_fh).await?;
        self.rewrite_attr(&mut attr);
        Ok(attr)
    }

    pub async fn access(&self, ctx: Context, ino: u64, mask: u32) -> Result<(), Errno> {
        let node = self.inode(ino);
        let path = self.path_of(&node);
        self.backend().access(&ctx, &path, mask).await
    }

    pub async fn mknod(
        &self,
        ctx: Context,
        parent_ino: u64,
        name: &str,
        mode: u32,
        rdev: u32,
    ) -> Result<EntryReply, Errno> {
        let parent = self.inode(parent_ino);
        let path = child_path_of(&self.path_of(&parent), name);

        self.backend().mknod(&ctx, &path, mode, rdev).await?;
        self.lookup_installing(&ctx, &path, &parent, name).await
    }

    pub async fn mkdir(
        &self,
        ctx: Context,
        parent_ino: u64,
        name: &str,
        mode: u32,
    ) -> Result<EntryReply, Errno> {
        let parent = self.inode(parent_ino);
        let path = child_path_of(&self.path_of(&parent), name);

        self.backend().mkdir(&ctx, &path, mode).await?;
        self.lookup_installing(&ctx, &path, &parent, name).await
    }

    pub async fn unlink(&self, ctx: Context, parent_ino: u64, name: &str) -> Result<(), Errno> {
        let parent = self.inode(parent_ino);
        let path = child_path_of(&self.path_of(&parent), name);

        self.backend().unlink(&ctx, &path).await?;
        self.rm_child(&parent, name);
        Ok(())
    }

    pub async fn rmdir(&self, ctx: Context, parent_ino: u64, name: &str) -> Result<(), Errno> {
        let parent = self.inode(parent_ino);
        let path = child_path_of(&self.path_of(&parent), name);

        self.backend().rmdir(&ctx, &path).await?;
        self.rm_child(&parent, name);
        Ok(())
    }

    /// Rename. Exchange/noreplace flags are not supported; the graph-side
    /// move always overwrites, mirroring the backend's plain rename.
    pub async fn rename(
        &self,
        ctx: Context,
        parent_ino: u64,
        name: &str,
        new_parent_ino: u64,
        new_name: &str,
        flags: u32,
    ) -> Result<(), Errno> {
        if flags != 0 {
            return Err(Errno::ENOSYS);
        }

        let parent = self.inode(parent_ino);
        let path = child_path_of(&self.path_of(&parent), name);
        let new_parent = self.inode(new_parent_ino);
        let new_path = child_path_of(&self.path_of(&new_parent), new_name);

        self.backend().rename(&ctx, &path, &new_path).await?;
        self.mv_child(&parent, name, &new_parent, new_name, true);
        Ok(())
    }

    pub async fn link(
        &self,
        ctx: Context,
        ino: u64,
        new_parent_ino: u64,
        new_name: &str,
    ) -> Result<EntryReply, Errno> {
        let old = self.inode(ino);
        let old_path = self.path_of(&old);
        let parent = self.inode(new_parent_ino);
        let path = child_path_of(&self.path_of(&parent), new_name);

        self.backend().link(&ctx, &old_path, &path).await?;
        self.lookup_installing(&ctx, &path, &parent, new_name).await
    }

    pub async fn symlink(
        &self,
        ctx: Context,
        parent_ino: u64,
        name: &str,
        target: &str,
    ) -> Result<EntryReply, Errno> {
        let parent = self.inode(parent_ino);
        let path = child_path_of(&self.path_of(&parent), name);

        self.backend().symlink(&ctx, &path, target).await?;
        self.lookup_installing(&ctx, &path, &parent, name).await
    }

    pub async fn readlink(&self, ctx: Context, ino: u64) -> Result<String, Errno> {
        let node = self.inode(ino);
        let path = self.path_of(&node);
        self.backend().readlink(&ctx, &path).await
    }

    pub async fn getxattr(&self, ctx: Context, ino: u64, name: &str) -> Result<Vec<u8>, Errno> {
        let node = self.inode(ino);
        let path = self.path_of(&node);
        self.backend().getxattr(&ctx, &path, name).await
    }

    /// Lists extended attribute names, already encoded for the kernel:
    /// each name NUL-terminated, concatenated.
    pub async fn listxattr(&self, ctx: Context, ino: u64) -> Result<Vec<u8>, Errno> {
        let node = self.inode(ino);
        let path = self.path_of(&node);

        let names = self.backend().listxattr(&ctx, &path).await?;
        let mut encoded = Vec::with_capacity(names.iter().map(|n| n.len() + 1).sum());
        for name in names {
            encoded.extend_from_slice(name.as_bytes());
            encoded.push(0);
        }
        Ok(encoded)
    }

    pub async fn setxattr(
        &self,
        ctx: Context,
        ino: u64,
        name: &str,
        value: &[u8],
        flags: u32,
    ) -> Result<(), Errno> {
        let node = self.inode(ino);
        let path = self.path_of(&node);
        self.backend().setxattr(&ctx, &path, name, value, flags).await
    }

    pub async fn removexattr(&self, ctx: Context, ino: u64, name: &str) -> Result<(), Errno> {
        let node = self.inode(ino);
        let path = self.path_of(&node);
        self.backend().removexattr(&ctx, &path, name).await
    }

    pub async fn create(
        &self,
        ctx: Context,
        parent_ino: u64,
        name: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<CreateReply, Errno> {
        let parent = self.inode(parent_ino);
        let path = child_path_of(&self.path_of(&parent), name);

        let created = self.backend().create(&ctx, &path, flags, mode).await?;
        let entry = self.lookup_installing(&ctx, &path, &parent, name).await?;
        let fh = self.register_file(ctx.caller.into(), path, created.u_fh, None);
        Ok(CreateReply {
            entry,
            fh,
            force_direct_io: created.force_direct_io,
        })
    }

    pub async fn open(&self, ctx: Context, ino: u64, flags: OpenFlags) -> Result<OpenReply, Errno> {
        let node = self.inode(ino);
        let path = self.path_of(&node);

        let opened = self.backend().open(&ctx, &path, flags).await?;
        let fh = self.register_file(ctx.caller.into(), path, opened.u_fh, None);
        Ok(OpenReply {
            fh,
            keep_cache: opened.keep_cache,
            force_direct_io: opened.force_direct_io,
        })
    }

    pub async fn read(
        &self,
        mut ctx: Context,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, Errno> {
        let (node, file) = self.inode_and_file(ino, fh, &mut ctx);
        let path = self.fpath_of(&node, &file);
        self.backend().read(&ctx, &path, file.u_fh, offset, size).await
    }

    pub async fn write(
        &self,
        mut ctx: Context,
        ino: u64,
        fh: u64,
        data: &[u8],
        offset: u64,
    ) -> Result<u32, Errno> {
        let (node, file) = self.inode_and_file(ino, fh, &mut ctx);
        let path = self.fpath_of(&node, &file);
        self.backend().write(&ctx, &path, file.u_fh, data, offset).await
    }

    pub async fn fallocate(
        &self,
        mut ctx: Context,
        ino: u64,
        fh: u64,
        offset: u64,
        length: u64,
        mode: u32,
    ) -> Result<(), Errno> {
        let (node, file) = self.inode_and_file(ino, fh, &mut ctx);
        let path = self.fpath_of(&node, &file);
        self.backend()
            .fallocate(&ctx, &path, file.u_fh, offset, length, mode)
            .await
    }

    pub async fn fsync(
        &self,
        mut ctx: Context,
        ino: u64,
        fh: u64,
        datasync: bool,
    ) -> Result<(), Errno> {
        let (node, file) = self.inode_and_file(ino, fh, &mut ctx);
        let path = self.fpath_of(&node, &file);
        self.backend().fsync(&ctx, &path, file.u_fh, datasync).await
    }

    pub async fn flush(
        &self,
        mut ctx: Context,
        ino: u64,
        fh: u64,
        lock_owner: u64,
    ) -> Result<(), Errno> {
        let (node, file) = self.inode_and_file(ino, fh, &mut ctx);
        let path = self.fpath_of(&node, &file);
        self.backend().flush(&ctx, &path, file.u_fh, lock_owner).await
    }

    /// Backend release plus slot teardown. The null handle 0 unregisters to
    /// a no-op.
    pub async fn release(&self, mut ctx: Context, ino: u64, fh: u64) {
        let (node, file) = self.inode_and_file(ino, fh, &mut ctx);
        let path = self.fpath_of(&node, &file);

        self.backend().release(&ctx, &path, file.u_fh).await;
        self.unregister_file(fh);
    }

    pub async fn getlk(
        &self,
        mut ctx: Context,
        ino: u64,
        fh: u64,
        owner: u64,
        lock: FileLock,
    ) -> Result<FileLock, Errno> {
        let (node, file) = self.inode_and_file(ino, fh, &mut ctx);
        let path = self.fpath_of(&node, &file);
        self.backend().getlk(&ctx, &path, file.u_fh, owner, &lock).await
    }

    pub async fn setlk(
        &self,
        mut ctx: Context,
        ino: u64,
        fh: u64,
        owner: u64,
        lock: FileLock,
        sleep: bool,
    ) -> Result<(), Errno> {
        let (node, file) = self.inode_and_file(ino, fh, &mut ctx);
        let path = self.fpath_of(&node, &file);
        self.backend()
            .setlk(&ctx, &path, file.u_fh, owner, &lock, sleep)
            .await
    }

    /// Opens a directory handle. No backend call: the listing is fetched
    /// lazily on the first readdir against the handle.
    pub fn opendir(&self, ctx: &Context, ino: u64) -> u64 {
        let node = self.inode(ino);
        let path = self.path_of(&node);
        self.register_file(ctx.caller.into(), path, 0, None)
    }

    /// Streams directory entries from `offset`, fetching and caching the
    /// backend listing on first use. Offset 0 forces a refetch, so a
    /// rewound handle behaves as if reopened; an offset past the end is a
    /// benign EOF. `fill` receives each entry with the offset of its
    /// successor and returns false when the reply buffer is full.
    pub async fn readdir(
        &self,
        mut ctx: Context,
        ino: u64,
        fh: u64,
        offset: u64,
        mut fill: impl FnMut(&DirEntry, u64) -> bool + Send,
    ) -> Result<(), Errno> {
        let (node, file) = self.inode_and_file(ino, fh, &mut ctx);
        let path = self.fpath_of(&node, &file);

        let mut stream = file.stream.lock().await;
        if stream.is_none() || offset == 0 {
            *stream = Some(self.fetch_dir_stream(&ctx, &path, &node).await?);
        }
        let entries = stream.as_deref().unwrap_or_default();

        let Some(pending) = entries.get(usize::try_from(offset).unwrap_or(usize::MAX)..) else {
            // Offsets past the end can arrive e.g. through NFS re-exports;
            // reinforcing EOF is harmless.
            return Ok(());
        };
        for (i, entry) in pending.iter().enumerate() {
            if entry.name.is_empty() {
                warn!(ino, "got empty directory entry from backend");
                continue;
            }
            if !fill(entry, offset + i as u64 + 1) {
                break;
            }
        }
        Ok(())
    }

    /// Like [`readdir`](Bridge::readdir), but performs the lookup protocol
    /// per entry: `fill` additionally receives the installed entry, or
    /// `None` for the synthesized `.`/`..` entries and for names whose
    /// lookup failed between listing and stat.
    pub async fn readdirplus(
        &self,
        mut ctx: Context,
        ino: u64,
        fh: u64,
        offset: u64,
        mut fill: impl FnMut(&DirEntry, u64, Option<EntryReply>) -> bool + Send,
    ) -> Result<(), Errno> {
        let (node, file) = self.inode_and_file(ino, fh, &mut ctx);
        let path = self.fpath_of(&node, &file);

        let mut stream = file.stream.lock().await;
        if stream.is_none() || offset == 0 {
            *stream = Some(self.fetch_dir_stream(&ctx, &path, &node).await?);
        }
        let entries = stream.as_deref().unwrap_or_default();

        let Some(pending) = entries.get(usize::try_from(offset).unwrap_or(usize::MAX)..) else {
            return Ok(());
        };
        for (i, entry) in pending.iter().enumerate() {
            if entry.name.is_empty() {
                warn!(ino, "got empty directory entry from backend");
                continue;
            }
            let next_offset = offset + i as u64 + 1;

            // No attributes (and no lookup count) for the dot entries.
            if entry.name == "." || entry.name == ".." {
                if !fill(entry, next_offset, None) {
                    break;
                }
                continue;
            }

            let child_path = child_path_of(&path, &entry.name);
            let looked_up = self
                .lookup_installing(&ctx, &child_path, &node, &entry.name)
                .await
                .ok();
            if !fill(entry, next_offset, looked_up) {
                break;
            }
        }
        Ok(())
    }

    /// Fetches a directory listing and appends the synthesized dot entries.
    async fn fetch_dir_stream(
        &self,
        ctx: &Context,
        path: &str,
        node: &Arc<Node>,
    ) -> Result<Vec<DirEntry>, Errno> {
        let mut entries = self.backend().lsdir(ctx, path).await?;

        let parent_ino = {
            let state = node.lock();
            state
                .parents
                .get()
                .and_then(super::parents::ParentEntry::upgrade)
                .map_or(node.ino, |p| p.ino)
        };
        entries.push(DirEntry {
            ino: node.ino,
            name: ".".to_owned(),
            kind: DirEntryType::Directory,
        });
        entries.push(DirEntry {
            ino: parent_ino,
            name: "..".to_owned(),
            kind: DirEntryType::Directory,
        });
        Ok(entries)
    }

    pub fn releasedir(&self, fh: u64) {
        self.unregister_file(fh);
    }

    pub fn fsyncdir(&self) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    pub fn lseek(&self) -> Result<u64, Errno> {
        Err(Errno::ENOSYS)
    }

    pub fn copy_file_range(&self) -> Result<u32, Errno> {
        Err(Errno::ENOSYS)
    }

    pub async fn statfs(&self, ctx: Context, ino: u64) -> Result<FilesystemStats, Errno> {
        let node = self.inode(ino);
        let path = self.path_of(&node);
        self.backend().statfs(&ctx, &path).await
    }
}
