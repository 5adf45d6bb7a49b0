//! A backend that overlays a host directory.
//!
//! Forwards every operation to the native filesystem under a configured
//! root, for exercising the bridge without building a real filesystem.
//! Extended attributes, advisory locks and fallocate stay at their
//! not-implemented defaults.

use std::collections::HashMap;
use std::os::unix::ffi::OsStringExt as _;
use std::os::unix::fs::{FileExt as _, PermissionsExt as _};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::statvfs::statvfs;
use tracing::warn;

use crate::backend::{CreatedFile, OpenedFile, PathFs};
use crate::context::Context;
use crate::errno::Errno;
use crate::types::{DirEntry, FileAttr, FilesystemStats, OpenFlags};

/// Path-keyed loopback over `root`.
pub struct LoopbackFs {
    root: PathBuf,
    open_files: Mutex<HashMap<u64, std::fs::File>>,
    next_fh: AtomicU64,
}

#[expect(
    clippy::expect_used,
    reason = "mutex poisoning is unrecoverable; panicking is the correct behavior"
)]
impl LoopbackFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open_files: Mutex::new(HashMap::new()),
            // Handle 0 means "no handle" to the bridge.
            next_fh: AtomicU64::new(1),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn stash_file(&self, file: std::fs::File) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.open_files.lock().expect("poisoned").insert(fh, file);
        fh
    }

    /// A duplicated handle for positioned I/O, so reads and writes do not
    /// serialize on the table lock.
    fn dup_file(&self, u_fh: u64) -> Result<std::fs::File, Errno> {
        let files = self.open_files.lock().expect("poisoned");
        let file = files.get(&u_fh).ok_or(Errno::EBADF)?;
        file.try_clone().map_err(Errno::from)
    }

    fn drop_file(&self, u_fh: u64) -> Option<std::fs::File> {
        self.open_files.lock().expect("poisoned").remove(&u_fh)
    }

    async fn open_options(&self, path: &str, flags: OpenFlags, mode: Option<u32>) -> Result<std::fs::File, Errno> {
        let mut options = tokio::fs::OpenOptions::new();
        options
            .read(true)
            .write(flags.writable())
            .append(flags.contains(OpenFlags::APPEND))
            .truncate(flags.contains(OpenFlags::TRUNC))
            .create(flags.contains(OpenFlags::CREAT));
        if let Some(mode) = mode {
            options.mode(mode);
        }
        let file = options.open(self.full_path(path)).await?;
        Ok(file.into_std().await)
    }

    async fn parse_dirent(entry: &tokio::fs::DirEntry) -> Result<Option<DirEntry>, Errno> {
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            warn!(name = ?entry.file_name(), "skipping non-utf8 directory entry");
            return Ok(None);
        };
        let Ok(kind) = entry.file_type().await?.try_into() else {
            return Ok(None);
        };
        Ok(Some(DirEntry {
            ino: entry.ino(),
            name,
            kind,
        }))
    }
}

#[async_trait]
impl PathFs for LoopbackFs {
    async fn getattr(&self, _ctx: &Context, path: &str, u_fh: u64) -> Result<FileAttr, Errno> {
        let meta = if u_fh == 0 {
            tokio::fs::symlink_metadata(self.full_path(path)).await?
        } else {
            self.dup_file(u_fh)?.metadata()?
        };
        FileAttr::try_from(meta).map_err(|()| Errno::EINVAL)
    }

    async fn access(&self, _ctx: &Context, path: &str, mask: u32) -> Result<(), Errno> {
        let flags = nix::unistd::AccessFlags::from_bits_truncate(mask.cast_signed());
        nix::unistd::access(&self.full_path(path), flags)?;
        Ok(())
    }

    async fn mknod(&self, _ctx: &Context, path: &str, mode: u32, rdev: u32) -> Result<(), Errno> {
        let kind = nix::sys::stat::SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = nix::sys::stat::Mode::from_bits_truncate(mode & 0o7777);
        nix::sys::stat::mknod(&self.full_path(path), kind, perm, u64::from(rdev))?;
        Ok(())
    }

    async fn mkdir(&self, _ctx: &Context, path: &str, mode: u32) -> Result<(), Errno> {
        let full = self.full_path(path);
        tokio::fs::create_dir(&full).await?;
        tokio::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    async fn unlink(&self, _ctx: &Context, path: &str) -> Result<(), Errno> {
        tokio::fs::remove_file(self.full_path(path)).await?;
        Ok(())
    }

    async fn rmdir(&self, _ctx: &Context, path: &str) -> Result<(), Errno> {
        tokio::fs::remove_dir(self.full_path(path)).await?;
        Ok(())
    }

    async fn rename(&self, _ctx: &Context, path: &str, new_path: &str) -> Result<(), Errno> {
        tokio::fs::rename(self.full_path(path), self.full_path(new_path)).await?;
        Ok(())
    }

    async fn link(&self, _ctx: &Context, path: &str, new_path: &str) -> Result<(), Errno> {
        tokio::fs::hard_link(self.full_path(path), self.full_path(new_path)).await?;
        Ok(())
    }

    async fn symlink(&self, _ctx: &Context, path: &str, target: &str) -> Result<(), Errno> {
        tokio::fs::symlink(target, self.full_path(path)).await?;
        Ok(())
    }

    async fn readlink(&self, _ctx: &Context, path: &str) -> Result<String, Errno> {
        let target = tokio::fs::read_link(self.full_path(path)).await?;
        target
            .into_os_string()
            .into_string()
            .map_err(|_| Errno::EINVAL)
    }

    async fn create(
        &self,
        _ctx: &Context,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<CreatedFile, Errno> {
        let file = self
            .open_options(path, flags | OpenFlags::CREAT, Some(mode))
            .await?;
        Ok(CreatedFile {
            u_fh: self.stash_file(file),
            force_direct_io: false,
        })
    }

    async fn open(&self, _ctx: &Context, path: &str, flags: OpenFlags) -> Result<OpenedFile, Errno> {
        let file = self.open_options(path, flags, None).await?;
        Ok(OpenedFile {
            u_fh: self.stash_file(file),
            keep_cache: false,
            force_direct_io: false,
        })
    }

    async fn read(
        &self,
        _ctx: &Context,
        _path: &str,
        u_fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, Errno> {
        let file = self.dup_file(u_fh)?;
        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;
        // read_at is not guaranteed to fill the buffer in one call.
        while filled < buffer.len() {
            let n = file.read_at(&mut buffer[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(Bytes::from(buffer))
    }

    async fn write(
        &self,
        _ctx: &Context,
        _path: &str,
        u_fh: u64,
        data: &[u8],
        offset: u64,
    ) -> Result<u32, Errno> {
        let file = self.dup_file(u_fh)?;
        file.write_all_at(data, offset)?;
        u32::try_from(data.len()).map_err(|_| Errno::EINVAL)
    }

    async fn fsync(
        &self,
        _ctx: &Context,
        _path: &str,
        u_fh: u64,
        datasync: bool,
    ) -> Result<(), Errno> {
        let file = self.dup_file(u_fh)?;
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    async fn flush(
        &self,
        _ctx: &Context,
        _path: &str,
        _u_fh: u64,
        _lock_owner: u64,
    ) -> Result<(), Errno> {
        Ok(())
    }

    async fn release(&self, _ctx: &Context, _path: &str, u_fh: u64) {
        if self.drop_file(u_fh).is_none() && u_fh != 0 {
            warn!(u_fh, "release of unknown backend handle");
        }
    }

    async fn chmod(&self, _ctx: &Context, path: &str, _u_fh: u64, mode: u32) -> Result<(), Errno> {
        tokio::fs::set_permissions(self.full_path(path), std::fs::Permissions::from_mode(mode))
            .await?;
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
        nix::unistd::chown(
            &self.full_path(path),
            uid.map(nix::unistd::Uid::from_raw),
            gid.map(nix::unistd::Gid::from_raw),
        )?;
        Ok(())
    }

    async fn truncate(
        &self,
        _ctx: &Context,
        path: &str,
        u_fh: u64,
        size: u64,
    ) -> Result<(), Errno> {
        let file = if u_fh == 0 {
            self.open_options(path, OpenFlags::WRONLY, None).await?
        } else {
            self.dup_file(u_fh)?
        };
        file.set_len(size)?;
        Ok(())
    }

    async fn utimens(
        &self,
        _ctx: &Context,
        path: &str,
        _u_fh: u64,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), Errno> {
        fn to_timespec(t: Option<SystemTime>) -> libc::timespec {
            match t.map(|t| t.duration_since(SystemTime::UNIX_EPOCH)) {
                Some(Ok(d)) => libc::timespec {
                    tv_sec: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                    tv_nsec: i64::from(d.subsec_nanos()),
                },
                // Pre-epoch times collapse to the epoch; omitted fields
                // stay untouched.
                Some(Err(_)) => libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 0,
                },
                None => libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_OMIT,
                },
            }
        }

        let c_path = std::ffi::CString::new(self.full_path(path).into_os_string().into_vec())
            .map_err(|_| Errno::EINVAL)?;
        let times = [to_timespec(atime), to_timespec(mtime)];
        // SAFETY: c_path and times are valid for the duration of the call.
        let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
        if rc != 0 {
            return Err(Errno::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    async fn lsdir(&self, _ctx: &Context, path: &str) -> Result<Vec<DirEntry>, Errno> {
        let mut read_dir = tokio::fs::read_dir(self.full_path(path)).await?;
        let mut entries = Vec::new();
        while let Some(dirent) = read_dir.next_entry().await? {
            if let Some(entry) = Self::parse_dirent(&dirent).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "block and fragment sizes and name_max always fit u32 in practice"
    )]
    async fn statfs(&self, _ctx: &Context, path: &str) -> Result<FilesystemStats, Errno> {
        let stat = statvfs(&self.full_path(path))?;

        Ok(FilesystemStats {
            block_size: stat.block_size() as u32,
            fragment_size: stat.fragment_size() as u32,
            #[allow(clippy::allow_attributes)]
            #[allow(clippy::useless_conversion)]
            total_blocks: u64::from(stat.blocks()),
            #[allow(clippy::allow_attributes)]
            #[allow(clippy::useless_conversion)]
            free_blocks: u64::from(stat.blocks_free()),
            #[allow(clippy::allow_attributes)]
            #[allow(clippy::useless_conversion)]
            available_blocks: u64::from(stat.blocks_available()),
            #[allow(clippy::allow_attributes)]
            #[allow(clippy::useless_conversion)]
            total_inodes: u64::from(stat.files()),
            #[allow(clippy::allow_attributes)]
            #[allow(clippy::useless_conversion)]
            free_inodes: u64::from(stat.files_free()),
            max_filename_length: stat.name_max() as u32,
        })
    }
}
