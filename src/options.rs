//! Bridge-wide configuration.

use std::time::Duration;

/// Options for the whole filesystem.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Validity window attached to successful lookup replies. `None` leaves
    /// the kernel's default (no caching).
    pub entry_timeout: Option<Duration>,

    /// Validity window attached to attributes in entry and attr replies.
    pub attr_timeout: Option<Duration>,

    /// If set, failed lookups are answered with a cacheable negative entry
    /// of this validity instead of a bare error.
    pub negative_timeout: Option<Duration>,

    /// If false, attributes with all-zero permission bits are rewritten to
    /// 0644 (files) or 0755 (directories) before being returned to the
    /// kernel, which is necessary for chdir into the mount to work.
    pub null_permissions: bool,

    /// If nonzero, replaces a zero uid on returned attributes.
    pub uid: u32,

    /// If nonzero, replaces a zero gid on returned attributes.
    pub gid: u32,
}

impl Options {
    /// The defaults used when mounting without explicit options: one-second
    /// entry and attribute caching.
    #[must_use]
    pub fn cached() -> Self {
        Self {
            entry_timeout: Some(Duration::from_secs(1)),
            attr_timeout: Some(Duration::from_secs(1)),
            ..Self::default()
        }
    }
}
