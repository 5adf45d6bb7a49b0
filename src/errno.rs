//! OS error codes as returned by path backends.

use std::fmt;

/// An error number from the operating-system error-code space.
///
/// Backends report failures as `Errno` values and the bridge propagates them
/// to the kernel verbatim. [`Errno::ENOSYS`] ("not implemented") is the
/// distinguished code the default backend methods return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

impl Errno {
    pub const EPERM: Self = Self(libc::EPERM);
    pub const ENOENT: Self = Self(libc::ENOENT);
    pub const EINTR: Self = Self(libc::EINTR);
    pub const EIO: Self = Self(libc::EIO);
    pub const EBADF: Self = Self(libc::EBADF);
    pub const EACCES: Self = Self(libc::EACCES);
    pub const EEXIST: Self = Self(libc::EEXIST);
    pub const ENOTDIR: Self = Self(libc::ENOTDIR);
    pub const EISDIR: Self = Self(libc::EISDIR);
    pub const EINVAL: Self = Self(libc::EINVAL);
    pub const ENOSYS: Self = Self(libc::ENOSYS);
    pub const ENOTEMPTY: Self = Self(libc::ENOTEMPTY);
    pub const ERANGE: Self = Self(libc::ERANGE);
    pub const ENODATA: Self = Self(libc::ENODATA);

    /// Wraps a raw error number.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw error number, as expected by the kernel reply.
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// True if this is the distinguished "not implemented" status.
    #[must_use]
    pub const fn is_not_implemented(self) -> bool {
        self.0 == libc::ENOSYS
    }
}

impl From<std::io::Error> for Errno {
    fn from(err: std::io::Error) -> Self {
        Self(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<nix::errno::Errno> for Errno {
    fn from(err: nix::errno::Errno) -> Self {
        Self(err as i32)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.0))
    }
}

impl std::error::Error for Errno {}
