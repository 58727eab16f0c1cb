//! VFS backend implementations.
//!
//! - `LocalBackend`: passthrough to the host filesystem
//! - `TreeBackend`: node-tree backends (tar archives, remote listings)

pub mod archive;
pub mod local;
pub mod remote;
pub mod tree;

pub use archive::TarSource;
pub use local::LocalBackend;
pub use remote::{Connector, RemoteSource, RemoteTransport, RemoteUrl};
pub use tree::{TreeBackend, TreeSource};

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::time::SystemTime;

use crate::class::BackendFactory;
use crate::config::VfsConfig;
use crate::error::VfsResult;
use crate::ops::{OpenFile, VfsOps};
use crate::types::{FileAttr, FileType, IoctlRequest};

/// Convert host metadata to a stat block.
pub(crate) fn metadata_to_attr(meta: &std::fs::Metadata) -> FileAttr {
    let time = |secs: i64, nsecs: i64| {
        let since = std::time::Duration::new(secs.max(0) as u64, nsecs.clamp(0, 999_999_999) as u32);
        SystemTime::UNIX_EPOCH + since
    };

    FileAttr {
        ino: meta.ino(),
        kind: FileType::from_std(meta.file_type()),
        perm: meta.permissions().mode() & 0o7777,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.len(),
        atime: time(meta.atime(), meta.atime_nsec()),
        mtime: time(meta.mtime(), meta.mtime_nsec()),
        ctime: time(meta.ctime(), meta.ctime_nsec()),
    }
}

// Handle operations shared by every backend that keeps a host file behind
// its handles.

pub(crate) fn file_read(file: &mut OpenFile, buf: &mut [u8]) -> VfsResult<usize> {
    Ok(file.file.read(buf)?)
}

pub(crate) fn file_write(file: &mut OpenFile, buf: &[u8]) -> VfsResult<usize> {
    Ok(file.file.write(buf)?)
}

pub(crate) fn file_seek(file: &mut OpenFile, pos: SeekFrom) -> VfsResult<u64> {
    Ok(file.file.seek(pos)?)
}

pub(crate) fn file_ioctl(file: &mut OpenFile, request: IoctlRequest) -> VfsResult<u64> {
    match request {
        IoctlRequest::BytesReadable => {
            let len = file.file.metadata()?.len();
            let pos = file.file.stream_position()?;
            Ok(len.saturating_sub(pos))
        }
    }
}

pub(crate) fn file_fileno(file: &OpenFile) -> RawFd {
    file.file.as_raw_fd()
}

pub(crate) fn file_fstat(file: &OpenFile) -> VfsResult<FileAttr> {
    Ok(metadata_to_attr(&file.file.metadata()?))
}

/// Factory for [`LocalBackend`]. Registered as the root class and as
/// `local`.
#[derive(Debug, Default)]
pub struct LocalFactory;

impl BackendFactory for LocalFactory {
    fn instantiate(&self, _config: &VfsConfig) -> VfsResult<Box<dyn VfsOps>> {
        Ok(Box::new(LocalBackend::passthrough()))
    }
}

/// Factory for tar archive mounts.
#[derive(Debug, Default)]
pub struct ArchiveFactory;

impl BackendFactory for ArchiveFactory {
    fn instantiate(&self, config: &VfsConfig) -> VfsResult<Box<dyn VfsOps>> {
        Ok(Box::new(TreeBackend::new(TarSource::default(), config)))
    }

    fn resolves_argument(&self) -> bool {
        true
    }
}

/// Factory for remote mounts. Without a connector every mount fails with
/// `ENOTSUP`.
#[derive(Default)]
pub struct RemoteFactory {
    connector: Option<Connector>,
}

impl RemoteFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connector(connector: Connector) -> Self {
        Self {
            connector: Some(connector),
        }
    }
}

impl BackendFactory for RemoteFactory {
    fn instantiate(&self, config: &VfsConfig) -> VfsResult<Box<dyn VfsOps>> {
        let source = RemoteSource::new(self.connector.clone());
        Ok(Box::new(TreeBackend::new(source, config)))
    }
}
