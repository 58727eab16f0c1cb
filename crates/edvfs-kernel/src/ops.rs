//! VFS operations trait.
//!
//! One trait object per mounted backend. Paths handed to a backend are
//! canonical and mount-relative (always starting with `/`), or the whole
//! VFS path when the backend asked for [`MountFlags::FULL_PATH`].

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::SeekFrom;
use std::os::fd::RawFd;
use std::path::PathBuf;

use crate::error::{VfsError, VfsResult};
use crate::mount::MountInfo;
use crate::node::NodeId;
use crate::types::{AccessMode, DirEntry, FileAttr, FileType, IoctlRequest, MountFlags, OpenFlags};

/// An open file as seen by a backend.
#[derive(Debug)]
pub struct OpenFile {
    /// Host file backing the handle.
    pub file: File,
    /// Tree node pinned by the handle.
    pub node: Option<NodeId>,
    pub flags: OpenFlags,
    /// Backend-relative path the file was opened with.
    pub path: String,
}

impl OpenFile {
    pub fn new(file: File, flags: OpenFlags, path: impl Into<String>) -> Self {
        Self {
            file,
            node: None,
            flags,
            path: path.into(),
        }
    }

    pub fn with_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }
}

/// An open directory stream.
///
/// Backends snapshot their entries at `opendir`. The facade appends
/// virtual mount points after the snapshot runs dry when
/// `splice_mounts` is set.
#[derive(Debug, Default)]
pub struct OpenDir {
    /// Backend-relative path of the directory.
    pub path: String,
    pub entries: VecDeque<DirEntry>,
    pub node: Option<NodeId>,
    /// List virtual mounts living in this directory.
    pub splice_mounts: bool,
    pub(crate) vfs_path: String,
    pub(crate) mount_seq: Option<u64>,
    pub(crate) virtuals: VecDeque<DirEntry>,
    pub(crate) seen: HashSet<String>,
}

impl OpenDir {
    pub fn new(path: impl Into<String>, entries: impl IntoIterator<Item = DirEntry>) -> Self {
        Self {
            path: path.into(),
            entries: entries.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Pop the next snapshot entry.
    pub fn next_entry(&mut self) -> Option<DirEntry> {
        self.entries.pop_front()
    }
}

/// Filesystem operations implemented by a backend.
///
/// Every method has a default that reports [`VfsError::Unsupported`], so a
/// backend only implements the capabilities it has.
#[allow(unused_variables)]
pub trait VfsOps {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Attach to `argument`. Returns flags the backend wants set on the
    /// mount (e.g. read-only, name cache).
    fn mount(&mut self, info: &MountInfo, argument: &str) -> VfsResult<MountFlags> {
        Ok(MountFlags::empty())
    }

    /// Detach. Called once, with no handles open.
    fn unmount(&mut self) -> VfsResult<()> {
        Ok(())
    }

    // ========================================================================
    // Handles
    // ========================================================================

    fn open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<OpenFile> {
        Err(VfsError::Unsupported)
    }

    fn close(&mut self, file: OpenFile) -> VfsResult<()> {
        Ok(())
    }

    fn read(&mut self, file: &mut OpenFile, buf: &mut [u8]) -> VfsResult<usize> {
        Err(VfsError::Unsupported)
    }

    fn write(&mut self, file: &mut OpenFile, buf: &[u8]) -> VfsResult<usize> {
        Err(VfsError::Unsupported)
    }

    fn seek(&mut self, file: &mut OpenFile, pos: SeekFrom) -> VfsResult<u64> {
        Err(VfsError::Unsupported)
    }

    fn tell(&mut self, file: &mut OpenFile) -> VfsResult<u64> {
        self.seek(file, SeekFrom::Current(0))
    }

    fn ioctl(&mut self, file: &mut OpenFile, request: IoctlRequest) -> VfsResult<u64> {
        Err(VfsError::Unsupported)
    }

    /// Host descriptor behind the handle.
    fn fileno(&self, file: &OpenFile) -> VfsResult<RawFd> {
        Err(VfsError::Unsupported)
    }

    fn fstat(&mut self, file: &OpenFile) -> VfsResult<FileAttr> {
        Err(VfsError::Unsupported)
    }

    // ========================================================================
    // Directories
    // ========================================================================

    fn opendir(&mut self, path: &str) -> VfsResult<OpenDir> {
        Err(VfsError::Unsupported)
    }

    fn readdir(&mut self, dir: &mut OpenDir) -> VfsResult<Option<DirEntry>> {
        Ok(dir.next_entry())
    }

    fn closedir(&mut self, dir: OpenDir) -> VfsResult<()> {
        Ok(())
    }

    // ========================================================================
    // Paths
    // ========================================================================

    /// Check `mode` access; an empty mode only checks existence.
    fn access(&mut self, path: &str, mode: AccessMode) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    /// Attributes, following a final symlink.
    fn stat(&mut self, path: &str) -> VfsResult<FileAttr> {
        Err(VfsError::Unsupported)
    }

    /// Attributes of the path itself.
    fn lstat(&mut self, path: &str) -> VfsResult<FileAttr> {
        Err(VfsError::Unsupported)
    }

    fn chmod(&mut self, path: &str, mode: u32) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    fn chown(&mut self, path: &str, uid: Option<u32>, gid: Option<u32>) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    fn mkdir(&mut self, path: &str, mode: u32) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    fn rmdir(&mut self, path: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    /// Validate `path` as a working directory.
    fn chdir(&mut self, path: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    fn readlink(&mut self, path: &str) -> VfsResult<String> {
        Err(VfsError::Unsupported)
    }

    /// Create a symlink at `path` pointing to `target`.
    fn symlink(&mut self, target: &str, path: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    /// Create a hard link at `new` for `old`.
    fn link(&mut self, old: &str, new: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    fn unlink(&mut self, path: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    /// Remove a file or an empty directory.
    fn remove(&mut self, path: &str) -> VfsResult<()> {
        if self.lstat(path)?.is_dir() {
            self.rmdir(path)
        } else {
            self.unlink(path)
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    /// Create a special file. Only FIFOs and regular files are expected.
    fn mknod(&mut self, path: &str, kind: FileType, mode: u32, dev: u64) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    /// Host path holding this file's bytes, materializing it if needed.
    fn real_path(&mut self, path: &str) -> VfsResult<PathBuf> {
        Err(VfsError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;
    impl VfsOps for Bare {}

    #[test]
    fn test_defaults_are_unsupported() {
        let mut ops = Bare;
        assert!(matches!(ops.stat("/x"), Err(VfsError::Unsupported)));
        assert!(matches!(ops.mkdir("/x", 0o755), Err(VfsError::Unsupported)));
        assert!(matches!(ops.remove("/x"), Err(VfsError::Unsupported)));
        assert!(matches!(ops.opendir("/"), Err(VfsError::Unsupported)));
        assert!(ops.unmount().is_ok());
    }

    #[test]
    fn test_open_dir_drains_snapshot() {
        let mut ops = Bare;
        let mut dir = OpenDir::new("/", vec![DirEntry::file("a"), DirEntry::directory("b")]);
        assert_eq!(ops.readdir(&mut dir).unwrap().unwrap().name, "a");
        assert_eq!(ops.readdir(&mut dir).unwrap().unwrap().name, "b");
        assert!(ops.readdir(&mut dir).unwrap().is_none());
    }
}
