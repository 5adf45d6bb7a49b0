//! `fuser` transport adapter.
//!
//! [`PathFuse`] implements [`fuser::Filesystem`] by spawning every kernel
//! callback onto a tokio runtime handle and forwarding it to the
//! [`Bridge`]. Replies happen from inside the spawned task; the fuser
//! session thread never blocks on the backend.

use std::ffi::OsStr;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;
use tracing::debug;

use crate::backend::PathFs;
use crate::bridge::Bridge;
use crate::context::{Caller, Context};
use crate::errno::Errno;
use crate::types::{CommonAttr, DirEntryType, FileAttr, FileLock, OpenFlags};

impl From<FileAttr> for fuser::FileAttr {
    fn from(val: FileAttr) -> Self {
        fn common_to_fuser(common: CommonAttr) -> fuser::FileAttr {
            fuser::FileAttr {
                ino: common.ino,
                size: 0,
                blocks: 0,
                atime: common.atime,
                mtime: common.mtime,
                ctime: common.ctime,
                crtime: common.crtime,
                kind: fuser::FileType::RegularFile,
                perm: common.perm.bits(),
                nlink: common.nlink,
                uid: common.uid,
                gid: common.gid,
                rdev: 0,
                blksize: common.blksize,
                flags: 0,
            }
        }

        #[expect(
            clippy::cast_possible_truncation,
            reason = "rdev narrowing mirrors what the kernel ABI carries"
        )]
        fn rdev_to_u32(rdev: u64) -> u32 {
            rdev as u32
        }

        match val {
            FileAttr::RegularFile {
                common,
                size,
                blocks,
            } => {
                let mut attr = common_to_fuser(common);
                attr.size = size;
                attr.blocks = blocks;
                attr.kind = fuser::FileType::RegularFile;
                attr
            }
            FileAttr::Directory { common } => {
                let mut attr = common_to_fuser(common);
                attr.kind = fuser::FileType::Directory;
                attr
            }
            FileAttr::Symlink { common, size } => {
                let mut attr = common_to_fuser(common);
                attr.size = size;
                attr.kind = fuser::FileType::Symlink;
                attr
            }
            FileAttr::CharDevice { common, rdev } => {
                let mut attr = common_to_fuser(common);
                attr.rdev = rdev_to_u32(rdev);
                attr.kind = fuser::FileType::CharDevice;
                attr
            }
            FileAttr::BlockDevice { common, rdev } => {
                let mut attr = common_to_fuser(common);
                attr.rdev = rdev_to_u32(rdev);
                attr.kind = fuser::FileType::BlockDevice;
                attr
            }
            FileAttr::NamedPipe { common } => {
                let mut attr = common_to_fuser(common);
                attr.kind = fuser::FileType::NamedPipe;
                attr
            }
            FileAttr::Socket { common } => {
                let mut attr = common_to_fuser(common);
                attr.kind = fuser::FileType::Socket;
                attr
            }
        }
    }
}

impl From<DirEntryType> for fuser::FileType {
    fn from(val: DirEntryType) -> Self {
        match val {
            DirEntryType::RegularFile => Self::RegularFile,
            DirEntryType::Directory => Self::Directory,
            DirEntryType::Symlink => Self::Symlink,
            DirEntryType::CharDevice => Self::CharDevice,
            DirEntryType::BlockDevice => Self::BlockDevice,
            DirEntryType::NamedPipe => Self::NamedPipe,
            DirEntryType::Socket => Self::Socket,
        }
    }
}

/// The attribute payload of a cacheable negative entry: ino 0 tells the
/// kernel the name does not resolve.
fn negative_attr() -> fuser::FileAttr {
    fuser::FileAttr {
        ino: 0,
        size: 0,
        blocks: 0,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: fuser::FileType::RegularFile,
        perm: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

/// A minimal directory attribute for the synthesized `.`/`..` entries of
/// readdirplus, which carry no lookup reference.
fn dot_entry_attr(ino: u64) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        kind: fuser::FileType::Directory,
        perm: 0o755,
        nlink: 1,
        ..negative_attr()
    }
}

/// Mountable adapter: forwards `fuser::Filesystem` callbacks to a
/// [`Bridge`] on a tokio runtime.
pub struct PathFuse<B: PathFs + 'static> {
    bridge: Arc<Bridge<B>>,
    runtime: tokio::runtime::Handle,
}

impl<B: PathFs + 'static> PathFuse<B> {
    pub fn new(bridge: Arc<Bridge<B>>, runtime: tokio::runtime::Handle) -> Self {
        Self { bridge, runtime }
    }

    /// The bridge being served, e.g. for dump/restore around a handoff.
    pub fn bridge(&self) -> &Arc<Bridge<B>> {
        &self.bridge
    }

    fn spawn_for<Fut>(
        &self,
        req: &fuser::Request<'_>,
        span: tracing::Span,
        f: impl FnOnce(Arc<Bridge<B>>, Context) -> Fut,
    ) where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let bridge = Arc::clone(&self.bridge);
        // fuser has no per-request interrupt hook today; the token is part
        // of the backend contract and stays unfired.
        let ctx = Self::ctx_for(req);
        self.runtime.spawn(f(bridge, ctx).instrument(span));
    }

    fn ctx_for(req: &fuser::Request<'_>) -> Context {
        Context::new(
            Caller {
                uid: req.uid(),
                gid: req.gid(),
                pid: req.pid(),
            },
            CancellationToken::new(),
        )
    }
}

/// Extracts a UTF-8 name from the kernel or replies `EINVAL` and bails out.
/// Paths in this crate are strings; names that cannot join one are
/// rejected at the boundary.
macro_rules! utf8_name {
    ($name:expr, $reply:expr) => {
        match $name.to_str() {
            Some(name) => name.to_owned(),
            None => {
                $reply.error(libc::EINVAL);
                return;
            }
        }
    };
}

impl<B: PathFs + 'static> fuser::Filesystem for PathFuse<B> {
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        self.bridge.init();
        Ok(())
    }

    fn lookup(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let name = utf8_name!(name, reply);
        let span = tracing::debug_span!("pathfs::lookup", parent, name);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.lookup(ctx, parent, &name).await {
                Ok(entry) => {
                    let opts = bridge.options();
                    let ttl = opts.entry_timeout.unwrap_or(Duration::ZERO);
                    reply.entry(&ttl, &entry.attr.into(), entry.generation);
                }
                Err(e) => {
                    debug!(error = %e, "lookup failed");
                    match bridge.options().negative_timeout {
                        Some(ttl) if e == Errno::ENOENT => {
                            reply.entry(&ttl, &negative_attr(), 0);
                        }
                        _ => reply.error(e.raw()),
                    }
                }
            }
        });
    }

    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.bridge.forget(ino, nlookup);
    }

    fn getattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let span = tracing::debug_span!("pathfs::getattr", ino);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.getattr(ctx, ino, fh).await {
                Ok(attr) => {
                    let ttl = bridge.options().attr_timeout.unwrap_or(Duration::ZERO);
                    reply.attr(&ttl, &attr.into());
                }
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the fuser setattr API")]
    fn setattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        fn resolve(t: fuser::TimeOrNow) -> SystemTime {
            match t {
                fuser::TimeOrNow::SpecificTime(t) => t,
                fuser::TimeOrNow::Now => SystemTime::now(),
            }
        }

        let changes = crate::bridge::SetAttrs {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(resolve),
            mtime: mtime.map(resolve),
        };
        let span = tracing::debug_span!("pathfs::setattr", ino);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.setattr(ctx, ino, fh, changes).await {
                Ok(attr) => {
                    let ttl = bridge.options().attr_timeout.unwrap_or(Duration::ZERO);
                    reply.attr(&ttl, &attr.into());
                }
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn readlink(&mut self, req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        let span = tracing::debug_span!("pathfs::readlink", ino);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.readlink(ctx, ino).await {
                Ok(target) => reply.data(target.as_bytes()),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn mknod(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        let name = utf8_name!(name, reply);
        let span = tracing::debug_span!("pathfs::mknod", parent, name);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.mknod(ctx, parent, &name, mode, rdev).await {
                Ok(entry) => {
                    let ttl = bridge.options().entry_timeout.unwrap_or(Duration::ZERO);
                    reply.entry(&ttl, &entry.attr.into(), entry.generation);
                }
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn mkdir(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        let name = utf8_name!(name, reply);
        let span = tracing::debug_span!("pathfs::mkdir", parent, name);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.mkdir(ctx, parent, &name, mode).await {
                Ok(entry) => {
                    let ttl = bridge.options().entry_timeout.unwrap_or(Duration::ZERO);
                    reply.entry(&ttl, &entry.attr.into(), entry.generation);
                }
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn unlink(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let name = utf8_name!(name, reply);
        let span = tracing::debug_span!("pathfs::unlink", parent, name);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.unlink(ctx, parent, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn rmdir(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let name = utf8_name!(name, reply);
        let span = tracing::debug_span!("pathfs::rmdir", parent, name);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.rmdir(ctx, parent, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn symlink(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: fuser::ReplyEntry,
    ) {
        let name = utf8_name!(link_name, reply);
        let target = utf8_name!(target.as_os_str(), reply);
        let span = tracing::debug_span!("pathfs::symlink", parent, name);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.symlink(ctx, parent, &name, &target).await {
                Ok(entry) => {
                    let ttl = bridge.options().entry_timeout.unwrap_or(Duration::ZERO);
                    reply.entry(&ttl, &entry.attr.into(), entry.generation);
                }
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn rename(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        let name = utf8_name!(name, reply);
        let newname = utf8_name!(newname, reply);
        let span = tracing::debug_span!("pathfs::rename", parent, name, newparent, newname);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge
                .rename(ctx, parent, &name, newparent, &newname, flags)
                .await
            {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn link(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let newname = utf8_name!(newname, reply);
        let span = tracing::debug_span!("pathfs::link", ino, newparent, newname);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.link(ctx, ino, newparent, &newname).await {
                Ok(entry) => {
                    let ttl = bridge.options().entry_timeout.unwrap_or(Duration::ZERO);
                    reply.entry(&ttl, &entry.attr.into(), entry.generation);
                }
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn open(&mut self, req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let span = tracing::debug_span!("pathfs::open", ino);
        let flags = OpenFlags::from_bits_truncate(flags);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.open(ctx, ino, flags).await {
                Ok(opened) => {
                    let mut open_flags = 0;
                    if opened.force_direct_io {
                        open_flags |= fuser::consts::FOPEN_DIRECT_IO;
                    } else if opened.keep_cache {
                        open_flags |= fuser::consts::FOPEN_KEEP_CACHE;
                    }
                    reply.opened(opened.fh, open_flags);
                }
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn create(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let name = utf8_name!(name, reply);
        let flags = OpenFlags::from_bits_truncate(flags);
        let span = tracing::debug_span!("pathfs::create", parent, name);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.create(ctx, parent, &name, flags, mode).await {
                Ok(created) => {
                    let ttl = bridge.options().entry_timeout.unwrap_or(Duration::ZERO);
                    let open_flags = if created.force_direct_io {
                        fuser::consts::FOPEN_DIRECT_IO
                    } else {
                        0
                    };
                    reply.created(
                        &ttl,
                        &created.entry.attr.into(),
                        created.entry.generation,
                        created.fh,
                        open_flags,
                    );
                }
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn read(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let span = tracing::debug_span!("pathfs::read", ino, fh, offset, size);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.read(ctx, ino, fh, offset, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn write(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let data = data.to_vec();
        let span = tracing::debug_span!("pathfs::write", ino, fh, offset, len = data.len());
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.write(ctx, ino, fh, &data, offset).await {
                Ok(written) => reply.written(written),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn flush(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        let span = tracing::debug_span!("pathfs::flush", ino, fh);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.flush(ctx, ino, fh, lock_owner).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn release(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let span = tracing::debug_span!("pathfs::release", ino, fh);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            bridge.release(ctx, ino, fh).await;
            reply.ok();
        });
    }

    fn fsync(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let span = tracing::debug_span!("pathfs::fsync", ino, fh);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.fsync(ctx, ino, fh, datasync).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn opendir(&mut self, req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        let ctx = Self::ctx_for(req);
        let fh = self.bridge.opendir(&ctx, ino);
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: fuser::ReplyDirectory,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let span = tracing::debug_span!("pathfs::readdir", ino, fh, offset);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            let mut reply = reply;
            let filled = bridge
                .readdir(ctx, ino, fh, offset, |entry, next_offset| {
                    let full = reply.add(
                        entry.ino,
                        i64::try_from(next_offset).unwrap_or(i64::MAX),
                        entry.kind.into(),
                        &entry.name,
                    );
                    !full
                })
                .await;
            match filled {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn readdirplus(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: fuser::ReplyDirectoryPlus,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let span = tracing::debug_span!("pathfs::readdirplus", ino, fh, offset);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            let entry_ttl = bridge.options().entry_timeout.unwrap_or(Duration::ZERO);
            let mut reply = reply;
            let filled = bridge
                .readdirplus(ctx, ino, fh, offset, |entry, next_offset, looked_up| {
                    let next_offset = i64::try_from(next_offset).unwrap_or(i64::MAX);
                    match looked_up {
                        Some(installed) => {
                            let full = reply.add(
                                installed.ino,
                                next_offset,
                                &entry.name,
                                &entry_ttl,
                                &installed.attr.into(),
                                installed.generation,
                            );
                            !full
                        }
                        None if entry.name == "." || entry.name == ".." => {
                            let full = reply.add(
                                entry.ino,
                                next_offset,
                                &entry.name,
                                &Duration::ZERO,
                                &dot_entry_attr(entry.ino),
                                0,
                            );
                            !full
                        }
                        // The name disappeared between listing and stat;
                        // leave it out and keep going.
                        None => true,
                    }
                })
                .await;
            match filled {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        self.bridge.releasedir(fh);
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        match self.bridge.fsyncdir() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.raw()),
        }
    }

    fn statfs(&mut self, req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyStatfs) {
        let span = tracing::debug_span!("pathfs::statfs", ino);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.statfs(ctx, ino).await {
                Ok(stats) => reply.statfs(
                    stats.total_blocks,
                    stats.free_blocks,
                    stats.available_blocks,
                    stats.total_inodes,
                    stats.free_inodes,
                    stats.block_size,
                    stats.max_filename_length,
                    stats.fragment_size,
                ),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn setxattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: fuser::ReplyEmpty,
    ) {
        let name = utf8_name!(name, reply);
        let value = value.to_vec();
        let span = tracing::debug_span!("pathfs::setxattr", ino, name);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            let flags = flags.cast_unsigned();
            match bridge.setxattr(ctx, ino, &name, &value, flags).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn getxattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        let name = utf8_name!(name, reply);
        let span = tracing::debug_span!("pathfs::getxattr", ino, name);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.getxattr(ctx, ino, &name).await {
                Ok(data) => reply_xattr(&data, size, reply),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn listxattr(&mut self, req: &fuser::Request<'_>, ino: u64, size: u32, reply: fuser::ReplyXattr) {
        let span = tracing::debug_span!("pathfs::listxattr", ino);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.listxattr(ctx, ino).await {
                Ok(encoded) => reply_xattr(&encoded, size, reply),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn removexattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let name = utf8_name!(name, reply);
        let span = tracing::debug_span!("pathfs::removexattr", ino, name);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.removexattr(ctx, ino, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn access(&mut self, req: &fuser::Request<'_>, ino: u64, mask: i32, reply: fuser::ReplyEmpty) {
        let span = tracing::debug_span!("pathfs::access", ino);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.access(ctx, ino, mask.cast_unsigned()).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn getlk(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: fuser::ReplyLock,
    ) {
        let lock = FileLock {
            typ,
            start,
            end,
            pid,
        };
        let span = tracing::debug_span!("pathfs::getlk", ino, fh);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.getlk(ctx, ino, fh, lock_owner, lock).await {
                Ok(found) => reply.locked(found.start, found.end, found.typ, found.pid),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the fuser setlk API")]
    fn setlk(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let lock = FileLock {
            typ,
            start,
            end,
            pid,
        };
        let span = tracing::debug_span!("pathfs::setlk", ino, fh);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge.setlk(ctx, ino, fh, lock_owner, lock, sleep).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn fallocate(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: fuser::ReplyEmpty,
    ) {
        let (Ok(offset), Ok(length)) = (u64::try_from(offset), u64::try_from(length)) else {
            reply.error(libc::EINVAL);
            return;
        };
        let span = tracing::debug_span!("pathfs::fallocate", ino, fh);
        self.spawn_for(req, span, move |bridge, ctx| async move {
            match bridge
                .fallocate(ctx, ino, fh, offset, length, mode.cast_unsigned())
                .await
            {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw()),
            }
        });
    }

    fn lseek(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _whence: i32,
        reply: fuser::ReplyLseek,
    ) {
        match self.bridge.lseek() {
            Ok(offset) => reply.offset(i64::try_from(offset).unwrap_or(i64::MAX)),
            Err(e) => reply.error(e.raw()),
        }
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the fuser API")]
    fn copy_file_range(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino_in: u64,
        _fh_in: u64,
        _offset_in: i64,
        _ino_out: u64,
        _fh_out: u64,
        _offset_out: i64,
        _len: u64,
        _flags: u32,
        reply: fuser::ReplyWrite,
    ) {
        match self.bridge.copy_file_range() {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.raw()),
        }
    }
}

/// The xattr size protocol: a zero-size probe gets the length, a buffer
/// that fits gets the data, a short buffer gets `ERANGE`.
#[expect(
    clippy::cast_possible_truncation,
    reason = "xattr payloads are bounded far below u32::MAX by the kernel"
)]
fn reply_xattr(data: &[u8], size: u32, reply: fuser::ReplyXattr) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() <= size as usize {
        reply.data(data);
    } else {
        reply.error(libc::ERANGE);
    }
}
