//! # edvfs-kernel
//!
//! Virtual filesystem layer for a terminal editor.
//!
//! Editor file operations go through one [`VfsContext`]. Paths are routed
//! by a mount table to pluggable backends:
//! - the host filesystem, mounted at `/` and anywhere else as `local`
//! - tar archives, read-only, addressed inline as `/tmp/src.tar#tar/README`
//! - remote hosts (`ftp`, `http`) behind a [`RemoteTransport`]
//!
//! Archive and remote backends keep their names in an in-memory
//! [`NodeTree`] walked by the lookup engine, and copy file contents out to
//! temp files the first time they are opened.

pub mod backends;
pub mod cache;
pub mod class;
pub mod config;
pub mod context;
pub mod error;
pub mod handle;
pub mod lookup;
pub mod mount;
pub mod node;
pub mod ops;
pub mod path;
pub mod types;
pub mod wildcard;

pub use backends::{
    ArchiveFactory, Connector, LocalBackend, LocalFactory, RemoteFactory, RemoteSource,
    RemoteTransport, RemoteUrl, TarSource, TreeBackend, TreeSource,
};
pub use class::{BackendClass, BackendFactory, ClassRegistry};
pub use config::{ConfigError, MountConfig, NameCacheConfig, VfsConfig};
pub use context::VfsContext;
pub use error::{VfsError, VfsResult};
pub use handle::HandleId;
pub use mount::{MountId, MountInfo, OpStats, VfsOp};
pub use node::{NodeId, NodeTree};
pub use ops::{OpenDir, OpenFile, VfsOps};
pub use types::{
    AccessMode, DirEntry, FileAttr, FileType, IoctlRequest, MountFlags, OpenFlags, UnmountFlags,
};
