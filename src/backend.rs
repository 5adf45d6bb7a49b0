//! The path-keyed backend trait.

use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::Context;
use crate::errno::Errno;
use crate::types::{DirEntry, FileAttr, FileLock, FilesystemStats, OpenFlags};

/// Result of a successful backend `create`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreatedFile {
    /// Backend-chosen opaque handle, echoed back on every handle-keyed call.
    pub u_fh: u64,
    /// Ask the kernel to bypass the page cache for this handle.
    pub force_direct_io: bool,
}

/// Result of a successful backend `open`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenedFile {
    pub u_fh: u64,
    /// Keep previously cached pages for this file.
    pub keep_cache: bool,
    pub force_direct_io: bool,
}

/// A filesystem API expressed in pathnames.
///
/// Every method receives a forward-slash path relative to the mount root;
/// the empty string names the root itself. A minimal filesystem needs at
/// least a functional [`getattr`](PathFs::getattr) returning attributes with
/// a valid, stable `ino`, since the bridge keys its inode graph on it.
///
/// Each call may run concurrently with any other, so implementations must be
/// thread-safe. All default method bodies return
/// [`Errno::ENOSYS`] ("not implemented"), except [`statfs`](PathFs::statfs)
/// which reports zeros; a unit struct implementing `PathFs` with no overrides
/// is therefore a valid stub backend.
#[async_trait]
pub trait PathFs: Send + Sync {
    /// Attribute query. `u_fh` is the backend handle when the kernel holds
    /// the file open, `0` otherwise.
    async fn getattr(&self, _ctx: &Context, _path: &str, _u_fh: u64) -> Result<FileAttr, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn access(&self, _ctx: &Context, _path: &str, _mask: u32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    // Tree structure

    async fn mknod(&self, _ctx: &Context, _path: &str, _mode: u32, _rdev: u32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn mkdir(&self, _ctx: &Context, _path: &str, _mode: u32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn unlink(&self, _ctx: &Context, _path: &str) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn rmdir(&self, _ctx: &Context, _path: &str) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn rename(&self, _ctx: &Context, _path: &str, _new_path: &str) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Hard-link `path` to `new_path`.
    async fn link(&self, _ctx: &Context, _path: &str, _new_path: &str) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    // Symlinks

    /// Create a symlink at `path` pointing at `target`.
    async fn symlink(&self, _ctx: &Context, _path: &str, _target: &str) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn readlink(&self, _ctx: &Context, _path: &str) -> Result<String, Errno> {
        Err(Errno::ENOSYS)
    }

    // Extended attributes

    async fn getxattr(&self, _ctx: &Context, _path: &str, _name: &str) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn listxattr(&self, _ctx: &Context, _path: &str) -> Result<Vec<String>, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn setxattr(
        &self,
        _ctx: &Context,
        _path: &str,
        _name: &str,
        _value: &[u8],
        _flags: u32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn removexattr(&self, _ctx: &Context, _path: &str, _name: &str) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    // Files

    async fn create(
        &self,
        _ctx: &Context,
        _path: &str,
        _flags: OpenFlags,
        _mode: u32,
    ) -> Result<CreatedFile, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn open(
        &self,
        _ctx: &Context,
        _path: &str,
        _flags: OpenFlags,
    ) -> Result<OpenedFile, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn read(
        &self,
        _ctx: &Context,
        _path: &str,
        _u_fh: u64,
        _offset: u64,
        _size: u32,
    ) -> Result<Bytes, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn write(
        &self,
        _ctx: &Context,
        _path: &str,
        _u_fh: u64,
        _data: &[u8],
        _offset: u64,
    ) -> Result<u32, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn fallocate(
        &self,
        _ctx: &Context,
        _path: &str,
        _u_fh: u64,
        _offset: u64,
        _length: u64,
        _mode: u32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn fsync(
        &self,
        _ctx: &Context,
        _path: &str,
        _u_fh: u64,
        _datasync: bool,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn flush(
        &self,
        _ctx: &Context,
        _path: &str,
        _u_fh: u64,
        _lock_owner: u64,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Called when the kernel closes a handle. Has no way to fail.
    async fn release(&self, _ctx: &Context, _path: &str, _u_fh: u64) {}

    // Advisory locks

    async fn getlk(
        &self,
        _ctx: &Context,
        _path: &str,
        _u_fh: u64,
        _owner: u64,
        _lock: &FileLock,
    ) -> Result<FileLock, Errno> {
        Err(Errno::ENOSYS)
    }

    /// `sleep` distinguishes the blocking (`SETLKW`) from the non-blocking
    /// (`SETLK`) variant.
    async fn setlk(
        &self,
        _ctx: &Context,
        _path: &str,
        _u_fh: u64,
        _owner: u64,
        _lock: &FileLock,
        _sleep: bool,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    // Metadata mutation. `u_fh` may be 0 on all of these.

    async fn chmod(&self, _ctx: &Context, _path: &str, _u_fh: u64, _mode: u32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn chown(
        &self,
        _ctx: &Context,
        _path: &str,
        _u_fh: u64,
        _uid: Option<u32>,
        _gid: Option<u32>,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn truncate(
        &self,
        _ctx: &Context,
        _path: &str,
        _u_fh: u64,
        _size: u64,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn utimens(
        &self,
        _ctx: &Context,
        _path: &str,
        _u_fh: u64,
        _atime: Option<SystemTime>,
        _mtime: Option<SystemTime>,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    // Directories

    async fn lsdir(&self, _ctx: &Context, _path: &str) -> Result<Vec<DirEntry>, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn statfs(&self, _ctx: &Context, _path: &str) -> Result<FilesystemStats, Errno> {
        Ok(FilesystemStats::default())
    }
}

/// The do-nothing backend: every operation at its default. Useful as a
/// placeholder during bring-up and in tests that only exercise the graph.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFs;

#[async_trait]
impl PathFs for NullFs {}
