//! Strongly-typed values exchanged between the kernel adapter and backends.
//!
//! These are deliberately transport-neutral: the `fuse` module converts them
//! to the `fuser` wire types at the boundary.

use std::time::{Duration, SystemTime};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::error;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u16 {
        // Other
        const OTHER_EXECUTE = 1 << 0;
        const OTHER_WRITE   = 1 << 1;
        const OTHER_READ    = 1 << 2;

        // Group
        const GROUP_EXECUTE = 1 << 3;
        const GROUP_WRITE   = 1 << 4;
        const GROUP_READ    = 1 << 5;

        // Owner
        const OWNER_EXECUTE = 1 << 6;
        const OWNER_WRITE   = 1 << 7;
        const OWNER_READ    = 1 << 8;

        // Special bits
        const STICKY        = 1 << 9;
        const SETGID        = 1 << 10;
        const SETUID        = 1 << 11;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        // Access modes (mutually exclusive)
        const RDONLY = libc::O_RDONLY;
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;

        // Creation/status flags
        const APPEND = libc::O_APPEND;
        const TRUNC = libc::O_TRUNC;
        const CREAT = libc::O_CREAT;
        const EXCL = libc::O_EXCL;

        // Behavior flags
        const NONBLOCK = libc::O_NONBLOCK;
        const SYNC = libc::O_SYNC;
        const DSYNC = libc::O_DSYNC;
        const NOFOLLOW = libc::O_NOFOLLOW;
        const CLOEXEC = libc::O_CLOEXEC;
        const DIRECTORY = libc::O_DIRECTORY;

        #[cfg(target_os = "linux")]
        const NOATIME = libc::O_NOATIME;
    }
}

impl OpenFlags {
    /// True if the flags request write access of any kind.
    #[must_use]
    pub fn writable(self) -> bool {
        self.contains(Self::WRONLY) || self.contains(Self::RDWR)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommonAttr {
    pub ino: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub perm: Permissions,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
}

impl CommonAttr {
    /// A zeroed attribute for the given inode, epoch timestamps.
    #[must_use]
    pub fn zeroed(ino: u64) -> Self {
        Self {
            ino,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            perm: Permissions::empty(),
            nlink: 1,
            uid: 0,
            gid: 0,
            blksize: 4096,
        }
    }
}

/// Attributes of a filesystem object, as reported by a backend.
///
/// The variant carries the object kind; a backend's attribute query is how
/// the bridge learns whether a looked-up name is a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileAttr {
    RegularFile {
        common: CommonAttr,
        size: u64,
        blocks: u64,
    },
    Directory {
        common: CommonAttr,
    },
    Symlink {
        common: CommonAttr,
        size: u64,
    },
    CharDevice {
        common: CommonAttr,
        rdev: u64,
    },
    BlockDevice {
        common: CommonAttr,
        rdev: u64,
    },
    NamedPipe {
        common: CommonAttr,
    },
    Socket {
        common: CommonAttr,
    },
}

impl FileAttr {
    pub fn common(&self) -> &CommonAttr {
        match self {
            Self::RegularFile { common, .. }
            | Self::Directory { common }
            | Self::Symlink { common, .. }
            | Self::CharDevice { common, .. }
            | Self::BlockDevice { common, .. }
            | Self::NamedPipe { common }
            | Self::Socket { common } => common,
        }
    }

    pub fn common_mut(&mut self) -> &mut CommonAttr {
        match self {
            Self::RegularFile { common, .. }
            | Self::Directory { common }
            | Self::Symlink { common, .. }
            | Self::CharDevice { common, .. }
            | Self::BlockDevice { common, .. }
            | Self::NamedPipe { common }
            | Self::Socket { common } => common,
        }
    }

    #[must_use]
    pub fn ino(&self) -> u64 {
        self.common().ino
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirEntryType {
    RegularFile,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    NamedPipe,
    Socket,
}

impl From<&FileAttr> for DirEntryType {
    fn from(attr: &FileAttr) -> Self {
        match attr {
            FileAttr::RegularFile { .. } => Self::RegularFile,
            FileAttr::Directory { .. } => Self::Directory,
            FileAttr::Symlink { .. } => Self::Symlink,
            FileAttr::CharDevice { .. } => Self::CharDevice,
            FileAttr::BlockDevice { .. } => Self::BlockDevice,
            FileAttr::NamedPipe { .. } => Self::NamedPipe,
            FileAttr::Socket { .. } => Self::Socket,
        }
    }
}

impl TryFrom<std::fs::FileType> for DirEntryType {
    type Error = ();

    fn try_from(ft: std::fs::FileType) -> Result<Self, ()> {
        use std::os::unix::fs::FileTypeExt as _;

        if ft.is_file() {
            Ok(Self::RegularFile)
        } else if ft.is_dir() {
            Ok(Self::Directory)
        } else if ft.is_symlink() {
            Ok(Self::Symlink)
        } else if ft.is_char_device() {
            Ok(Self::CharDevice)
        } else if ft.is_block_device() {
            Ok(Self::BlockDevice)
        } else if ft.is_fifo() {
            Ok(Self::NamedPipe)
        } else if ft.is_socket() {
            Ok(Self::Socket)
        } else {
            error!(ft = ?ft, "unknown file type in DirEntryType conversion");
            Err(())
        }
    }
}

/// One entry of a backend directory listing.
///
/// Names are plain path segments; the bridge joins them onto the directory's
/// path with `/` when it needs a child path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    pub kind: DirEntryType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FilesystemStats {
    pub block_size: u32,
    pub fragment_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub available_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub max_filename_length: u32,
}

/// An advisory lock range as exchanged with `getlk`/`setlk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileLock {
    /// One of `libc::F_RDLCK`, `libc::F_WRLCK`, `libc::F_UNLCK`.
    pub typ: i32,
    pub start: u64,
    pub end: u64,
    pub pid: u32,
}

impl TryFrom<std::fs::Metadata> for FileAttr {
    type Error = ();

    #[expect(
        clippy::cast_possible_truncation,
        reason = "metadata mode/nlink/blksize narrowing is intentional"
    )]
    #[expect(
        clippy::cast_sign_loss,
        reason = "nsecs from MetadataExt is always in [0, 999_999_999]"
    )]
    fn try_from(meta: std::fs::Metadata) -> Result<Self, Self::Error> {
        use std::os::unix::fs::FileTypeExt as _;
        use std::os::unix::fs::MetadataExt as _;

        fn to_systime(secs: i64, nsecs: i64) -> SystemTime {
            if secs >= 0 {
                SystemTime::UNIX_EPOCH + Duration::new(secs.cast_unsigned(), nsecs as u32)
            } else {
                // nsecs is always in [0, 999_999_999] from MetadataExt.
                // For negative secs, subtract whole seconds then add back nsecs.
                SystemTime::UNIX_EPOCH - Duration::from_secs((-secs).cast_unsigned())
                    + Duration::from_nanos(nsecs.cast_unsigned())
            }
        }

        let common = CommonAttr {
            ino: meta.ino(),
            atime: to_systime(meta.atime(), meta.atime_nsec()),
            mtime: to_systime(meta.mtime(), meta.mtime_nsec()),
            ctime: to_systime(meta.ctime(), meta.ctime_nsec()),
            crtime: to_systime(0, 0), // Not available in std::fs::Metadata
            perm: Permissions::from_bits_truncate(meta.mode() as u16),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            blksize: meta.blksize() as u32,
        };

        let ft = meta.file_type();
        if ft.is_file() {
            Ok(Self::RegularFile {
                common,
                size: meta.len(),
                blocks: meta.blocks(),
            })
        } else if ft.is_dir() {
            Ok(Self::Directory { common })
        } else if ft.is_symlink() {
            Ok(Self::Symlink {
                common,
                size: meta.len(),
            })
        } else if ft.is_char_device() {
            Ok(Self::CharDevice {
                common,
                rdev: meta.rdev(),
            })
        } else if ft.is_block_device() {
            Ok(Self::BlockDevice {
                common,
                rdev: meta.rdev(),
            })
        } else if ft.is_fifo() {
            Ok(Self::NamedPipe { common })
        } else if ft.is_socket() {
            Ok(Self::Socket { common })
        } else {
            error!(ft = ?meta.file_type(), "unknown file type in FileAttr conversion");
            Err(())
        }
    }
}
