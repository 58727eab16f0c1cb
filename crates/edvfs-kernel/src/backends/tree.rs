//! Generic backend over an in-memory [`NodeTree`].
//!
//! The tree holds names and attributes only. File contents are copied out
//! to a temp file the first time a node is opened; the copy lives as long
//! as the node and later opens reuse it.

use std::fs::File;
use std::io::{SeekFrom, Write};
use std::os::fd::RawFd;
use std::path::PathBuf;
use tracing::debug;

use super::{file_fileno, file_ioctl, file_read, file_seek};
use crate::config::{NameCacheConfig, VfsConfig};
use crate::error::{VfsError, VfsResult};
use crate::lookup::{resolve, LookupFlags, LookupLimits, LookupOp, NodeLookup, Resolved};
use crate::mount::MountInfo;
use crate::node::{NodeId, NodeTree};
use crate::ops::{OpenDir, OpenFile, VfsOps};
use crate::types::{AccessMode, DirEntry, FileAttr, FileType, IoctlRequest, MountFlags, OpenFlags};

/// Fills and feeds a [`TreeBackend`].
pub trait TreeSource: NodeLookup {
    /// Flags this kind of mount always carries.
    fn mount_flags(&self) -> MountFlags;

    /// Build the tree from the mount argument.
    fn populate(&mut self, tree: &mut NodeTree, argument: &str) -> VfsResult<()>;

    /// Release whatever `populate` acquired.
    #[allow(unused_variables)]
    fn unmount(&mut self, tree: &mut NodeTree) -> VfsResult<()> {
        Ok(())
    }

    /// Write the contents of `node` to `out`, returning the byte count.
    fn materialize(&mut self, tree: &NodeTree, node: NodeId, out: &mut File) -> VfsResult<u64>;
}

/// Backend serving a [`TreeSource`].
#[derive(Debug)]
pub struct TreeBackend<S> {
    tree: NodeTree,
    source: S,
    limits: LookupLimits,
    cache: NameCacheConfig,
    temp_dir: PathBuf,
    flags: MountFlags,
    extractions: u64,
}

impl<S: TreeSource> TreeBackend<S> {
    pub fn new(source: S, config: &VfsConfig) -> Self {
        Self {
            tree: NodeTree::new(config.name_max),
            source,
            limits: LookupLimits::from(config),
            cache: config.name_cache.clone(),
            temp_dir: config.temp_dir(),
            flags: MountFlags::empty(),
            extractions: 0,
        }
    }

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Number of nodes copied out so far.
    pub fn extractions(&self) -> u64 {
        self.extractions
    }

    fn read_only(&self) -> bool {
        self.flags.contains(MountFlags::READ_ONLY)
    }

    fn check_writable(&self) -> VfsResult<()> {
        if self.read_only() {
            Err(VfsError::ReadOnly)
        } else {
            Err(VfsError::Unsupported)
        }
    }

    fn lookup(&mut self, path: &str, op: LookupOp, flags: LookupFlags) -> VfsResult<Resolved> {
        let read_only = self.read_only();
        resolve(&mut self.tree, &mut self.source, path, op, flags, &self.limits, read_only)
    }

    /// Walk to where a new entry named by `path` would go. A missing parent
    /// or a taken name is reported before the write guard.
    fn create_at(&mut self, path: &str) -> VfsResult<()> {
        match self.lookup(path, LookupOp::Create, LookupFlags::empty())? {
            Resolved::Missing { .. } => self.check_writable(),
            Resolved::Node(_) => Err(VfsError::already_exists(path)),
        }
    }

    fn node_at(&mut self, path: &str, flags: LookupFlags) -> VfsResult<NodeId> {
        self.lookup(path, LookupOp::Lookup, flags)?.node()
    }

    /// Host copy of `node`, extracting it on first use.
    fn materialize(&mut self, node: NodeId) -> VfsResult<PathBuf> {
        if let Some(local) = self.tree.local_path(node) {
            return Ok(local.to_path_buf());
        }

        let mut temp = tempfile::Builder::new()
            .prefix("edvfs")
            .tempfile_in(&self.temp_dir)?;
        let bytes = self.source.materialize(&self.tree, node, temp.as_file_mut())?;
        temp.as_file_mut().flush()?;

        let temp = temp.into_temp_path();
        let local = temp.to_path_buf();
        self.tree.set_local(node, temp)?;
        self.extractions += 1;
        debug!(
            node = %self.tree.path(node, true),
            local = %local.display(),
            bytes,
            "materialized"
        );
        Ok(local)
    }
}

impl<S: TreeSource> VfsOps for TreeBackend<S> {
    fn mount(&mut self, info: &MountInfo, argument: &str) -> VfsResult<MountFlags> {
        self.flags = self.source.mount_flags() | (info.flags & MountFlags::READ_ONLY);
        self.tree.set_mount_path(&info.path);
        if self.flags.contains(MountFlags::NAME_CACHE) {
            self.tree.enable_cache(self.cache.clone());
        }
        self.source.populate(&mut self.tree, argument)?;
        debug!(mount = %info.path, nodes = self.tree.len(), "tree populated");
        Ok(self.flags)
    }

    fn unmount(&mut self) -> VfsResult<()> {
        self.source.unmount(&mut self.tree)?;
        self.tree.clear()
    }

    fn open(&mut self, path: &str, flags: OpenFlags, _mode: u32) -> VfsResult<OpenFile> {
        if flags.modifies() {
            if flags.create {
                self.lookup(path, LookupOp::Create, LookupFlags::FOLLOW)?;
            }
            self.check_writable()?;
        }
        let node = self.node_at(path, LookupFlags::FOLLOW)?;
        match self.tree.node(node)?.kind {
            FileType::Regular => {}
            FileType::Directory => return Err(VfsError::is_a_directory(path)),
            other => {
                return Err(VfsError::invalid_argument(format!("cannot open {other} {path}")));
            }
        }

        let local = self.materialize(node)?;
        let file = File::open(&local)?;
        self.tree.acquire(node)?;
        Ok(OpenFile::new(file, flags, path).with_node(node))
    }

    fn close(&mut self, file: OpenFile) -> VfsResult<()> {
        if let Some(node) = file.node {
            self.tree.release(node);
        }
        Ok(())
    }

    fn read(&mut self, file: &mut OpenFile, buf: &mut [u8]) -> VfsResult<usize> {
        file_read(file, buf)
    }

    fn write(&mut self, _file: &mut OpenFile, _buf: &[u8]) -> VfsResult<usize> {
        self.check_writable().map(|_| 0)
    }

    fn seek(&mut self, file: &mut OpenFile, pos: SeekFrom) -> VfsResult<u64> {
        file_seek(file, pos)
    }

    fn ioctl(&mut self, file: &mut OpenFile, request: IoctlRequest) -> VfsResult<u64> {
        file_ioctl(file, request)
    }

    fn fileno(&self, file: &OpenFile) -> VfsResult<RawFd> {
        Ok(file_fileno(file))
    }

    fn fstat(&mut self, file: &OpenFile) -> VfsResult<FileAttr> {
        let node = file.node.ok_or(VfsError::Unsupported)?;
        Ok(self.tree.node(node)?.attr.clone())
    }

    fn opendir(&mut self, path: &str) -> VfsResult<OpenDir> {
        let dir = self.node_at(path, LookupFlags::FOLLOW)?;
        if !self.tree.node(dir)?.kind.is_dir() {
            return Err(VfsError::not_a_directory(path));
        }
        self.source.populate_dir(&mut self.tree, dir)?;

        let tree = &self.tree;
        let entries: Vec<DirEntry> = tree
            .node(dir)?
            .children
            .iter()
            .filter_map(|id| tree.get(*id))
            .map(|n| DirEntry::with_attr(n.name.clone(), n.attr.clone()))
            .collect();

        let mut open = OpenDir::new(path, entries);
        open.node = Some(dir);
        open.splice_mounts = true;
        Ok(open)
    }

    fn access(&mut self, path: &str, mode: AccessMode) -> VfsResult<()> {
        self.node_at(path, LookupFlags::FOLLOW)?;
        if mode.contains(AccessMode::WRITE) && self.read_only() {
            return Err(VfsError::ReadOnly);
        }
        Ok(())
    }

    fn stat(&mut self, path: &str) -> VfsResult<FileAttr> {
        let node = self.node_at(path, LookupFlags::FOLLOW)?;
        Ok(self.tree.node(node)?.attr.clone())
    }

    fn lstat(&mut self, path: &str) -> VfsResult<FileAttr> {
        let node = self.node_at(path, LookupFlags::empty())?;
        Ok(self.tree.node(node)?.attr.clone())
    }

    fn chmod(&mut self, _path: &str, _mode: u32) -> VfsResult<()> {
        self.check_writable()
    }

    fn chown(&mut self, _path: &str, _uid: Option<u32>, _gid: Option<u32>) -> VfsResult<()> {
        self.check_writable()
    }

    fn mkdir(&mut self, path: &str, _mode: u32) -> VfsResult<()> {
        self.create_at(path)
    }

    fn rmdir(&mut self, path: &str) -> VfsResult<()> {
        self.lookup(path, LookupOp::Delete, LookupFlags::empty())?;
        self.check_writable()
    }

    fn chdir(&mut self, path: &str) -> VfsResult<()> {
        if self.stat(path)?.is_dir() {
            Ok(())
        } else {
            Err(VfsError::not_a_directory(path))
        }
    }

    fn readlink(&mut self, path: &str) -> VfsResult<String> {
        let node = self.node_at(path, LookupFlags::empty())?;
        self.source.readlink(&self.tree, node)
    }

    fn symlink(&mut self, _target: &str, path: &str) -> VfsResult<()> {
        self.create_at(path)
    }

    fn link(&mut self, old: &str, new: &str) -> VfsResult<()> {
        self.node_at(old, LookupFlags::empty())?;
        self.create_at(new)
    }

    fn unlink(&mut self, path: &str) -> VfsResult<()> {
        self.lookup(path, LookupOp::Delete, LookupFlags::empty())?;
        self.check_writable()
    }

    fn remove(&mut self, path: &str) -> VfsResult<()> {
        self.lookup(path, LookupOp::Delete, LookupFlags::empty())?;
        self.check_writable()
    }

    fn rename(&mut self, from: &str, to: &str) -> VfsResult<()> {
        self.lookup(from, LookupOp::Rename, LookupFlags::empty())?;
        self.lookup(to, LookupOp::Rename, LookupFlags::empty())?;
        self.check_writable()
    }

    fn mknod(&mut self, path: &str, _kind: FileType, _mode: u32, _dev: u64) -> VfsResult<()> {
        self.create_at(path)
    }

    fn real_path(&mut self, path: &str) -> VfsResult<PathBuf> {
        let node = self.node_at(path, LookupFlags::FOLLOW)?;
        if !self.tree.node(node)?.kind.is_file() {
            return Err(VfsError::Unsupported);
        }
        self.materialize(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountId;
    use std::io::Read;

    /// Every file holds its own path.
    #[derive(Default)]
    struct Echo {
        materialized: u32,
    }

    impl NodeLookup for Echo {}

    impl TreeSource for Echo {
        fn mount_flags(&self) -> MountFlags {
            MountFlags::READ_ONLY | MountFlags::NAME_CACHE
        }

        fn populate(&mut self, tree: &mut NodeTree, argument: &str) -> VfsResult<()> {
            for path in argument.split(',') {
                tree.push(FileType::Regular, path)?;
            }
            Ok(())
        }

        fn materialize(&mut self, tree: &NodeTree, node: NodeId, out: &mut File) -> VfsResult<u64> {
            self.materialized += 1;
            let path = tree.path(node, false);
            out.write_all(path.as_bytes())?;
            Ok(path.len() as u64)
        }
    }

    fn mounted(temp: &tempfile::TempDir) -> TreeBackend<Echo> {
        let config = VfsConfig {
            temp_dir: Some(temp.path().to_path_buf()),
            ..Default::default()
        };
        let mut backend = TreeBackend::new(Echo::default(), &config);
        let info = MountInfo {
            id: MountId(3),
            path: "/m".into(),
            flags: MountFlags::empty(),
            class: "echo".into(),
            parent: None,
        };
        let flags = backend.mount(&info, "/a/one,/a/two,/b").unwrap();
        assert!(flags.contains(MountFlags::READ_ONLY));
        backend
    }

    #[test]
    fn test_open_materializes_once() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut backend = mounted(&temp);

        let mut first = backend.open("/a/two", OpenFlags::read(), 0).unwrap();
        let mut contents = String::new();
        first.file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "/a/two");

        let second = backend.open("/a/two", OpenFlags::read(), 0).unwrap();
        assert_eq!(backend.extractions(), 1);
        assert_eq!(backend.source().materialized, 1);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);

        backend.close(first).unwrap();
        backend.close(second).unwrap();
        backend.unmount().unwrap();
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_read_only_rejections() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut backend = mounted(&temp);

        assert!(matches!(backend.mkdir("/x", 0o755), Err(VfsError::ReadOnly)));
        assert!(matches!(backend.unlink("/b"), Err(VfsError::ReadOnly)));
        assert!(matches!(backend.rename("/b", "/c"), Err(VfsError::ReadOnly)));
        assert!(matches!(
            backend.open("/b", OpenFlags::write(), 0),
            Err(VfsError::ReadOnly)
        ));
    }

    #[test]
    fn test_create_reports_walk_errors_first() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut backend = mounted(&temp);

        assert!(matches!(backend.mkdir("/a/one", 0o755), Err(VfsError::AlreadyExists(_))));
        assert!(matches!(backend.mkdir("/nope/x", 0o755), Err(VfsError::NotFound(_))));
        assert!(matches!(backend.mkdir("/b/x", 0o755), Err(VfsError::NotADirectory(_))));
        assert!(matches!(backend.symlink("b", "/a/two"), Err(VfsError::AlreadyExists(_))));
        assert!(matches!(backend.symlink("b", "/a/three"), Err(VfsError::ReadOnly)));
        assert!(matches!(backend.link("/b", "/a/one"), Err(VfsError::AlreadyExists(_))));
        assert!(matches!(backend.link("/gone", "/c"), Err(VfsError::NotFound(_))));
        assert!(matches!(
            backend.mknod("/a/fifo", FileType::Fifo, 0o600, 0),
            Err(VfsError::ReadOnly)
        ));
        assert!(matches!(
            backend.open("/nope/new", OpenFlags::create(), 0o644),
            Err(VfsError::NotFound(_))
        ));
        assert!(matches!(
            backend.open("/a/new", OpenFlags::create(), 0o644),
            Err(VfsError::ReadOnly)
        ));
    }

    #[test]
    fn test_opendir_and_stat() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut backend = mounted(&temp);

        let mut dir = backend.opendir("/a").unwrap();
        let mut names = Vec::new();
        while let Some(entry) = backend.readdir(&mut dir).unwrap() {
            names.push(entry.name);
        }
        assert_eq!(names, ["one", "two"]);

        assert!(backend.stat("/a").unwrap().is_dir());
        assert!(matches!(backend.opendir("/b"), Err(VfsError::NotADirectory(_))));
        assert!(matches!(backend.open("/a", OpenFlags::read(), 0), Err(VfsError::IsADirectory(_))));
        assert!(matches!(backend.stat("/zzz"), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn test_fstat_and_real_path() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut backend = mounted(&temp);

        let file = backend.open("/b", OpenFlags::read(), 0).unwrap();
        let attr = backend.fstat(&file).unwrap();
        assert!(attr.is_file());

        let real = backend.real_path("/b").unwrap();
        assert_eq!(std::fs::read_to_string(real).unwrap(), "/b");
        assert_eq!(backend.extractions(), 1);
    }

    #[test]
    fn test_unmount_blocked_by_open_node() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut backend = mounted(&temp);

        let file = backend.open("/b", OpenFlags::read(), 0).unwrap();
        assert!(matches!(backend.unmount(), Err(VfsError::Busy(_))));
        backend.close(file).unwrap();
        backend.unmount().unwrap();
    }
}
