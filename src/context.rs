//! Per-request context handed to backends.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// The process that issued the kernel request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// The credentials captured when a file handle was opened.
///
/// Serialized as part of the handle-table snapshot so a successor process
/// sees the same opener on restored handles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl From<Caller> for Owner {
    fn from(caller: Caller) -> Self {
        Self {
            uid: caller.uid,
            gid: caller.gid,
        }
    }
}

/// Request-scoped information threaded through every backend call.
///
/// The bridge never inspects the cancellation token itself; lifecycle
/// transactions are short pure-memory operations. Backends performing slow
/// work should poll [`Context::is_cancelled`] (or await
/// [`Context::cancelled`]) and return [`Errno::EINTR`](crate::Errno::EINTR).
#[derive(Debug, Clone)]
pub struct Context {
    pub caller: Caller,
    /// Set when the request manipulates a registered file handle.
    pub opener: Option<Owner>,
    cancel: CancellationToken,
}

impl Context {
    pub(crate) fn new(caller: Caller, cancel: CancellationToken) -> Self {
        Self {
            caller,
            opener: None,
            cancel,
        }
    }

    /// True once the transport has abandoned this request.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the request is cancelled. Intended for `select!`-style
    /// use inside slow backend operations.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Caller::default(), CancellationToken::new())
    }
}
