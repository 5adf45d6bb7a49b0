//! A filesystem API expressed in pathnames, bridged onto the kernel's
//! inode-oriented FUSE protocol.
//!
//! The kernel talks in opaque inode numbers and file handles; many backends
//! are naturally written against paths. [`Bridge`] sits between the two: it
//! keeps an in-memory graph of every inode the kernel knows about (hard
//! links included), rebuilds a `/`-separated path for each request, calls a
//! [`PathFs`] backend, and folds the outcome back into the graph. The graph
//! can be streamed out with [`Bridge::dump`] and rebuilt with
//! [`Bridge::restore`], so a running process can hand its tree to a
//! successor.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pathfs::{Bridge, LoopbackFs, Options, PathFuse};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = tokio::runtime::Runtime::new()?;
//! let bridge = Arc::new(Bridge::new(LoopbackFs::new("/tmp/backing"), Options::cached()));
//! let fs = PathFuse::new(Arc::clone(&bridge), runtime.handle().clone());
//! fuser::mount2(fs, "/mnt/pathfs", &[])?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
mod bridge;
mod context;
mod errno;
mod fuse;
mod loopback;
mod options;
pub mod types;

pub use backend::{CreatedFile, NullFs, OpenedFile, PathFs};
pub use bridge::{
    Bridge, CreateReply, DumpBridge, DumpFileEntry, DumpInode, DumpParentEntry, EntryReply,
    InodeDumper, InodeFiller, OpenReply, ROOT_INO, RestoreError, SetAttrs, child_path_of,
};
pub use context::{Caller, Context, Owner};
pub use errno::Errno;
pub use fuse::PathFuse;
pub use loopback::LoopbackFs;
pub use options::Options;
