//! Local filesystem backend.
//!
//! Provides access to real filesystem paths. Mounted with an empty argument
//! it passes VFS paths straight through to the host; mounted on a directory
//! it confines every path to that directory.

use std::fs;
use std::io::SeekFrom;
use std::os::fd::RawFd;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{file_fileno, file_fstat, file_ioctl, file_read, file_seek, file_write, metadata_to_attr};
use crate::error::{VfsError, VfsResult};
use crate::mount::MountInfo;
use crate::ops::{OpenDir, OpenFile, VfsOps};
use crate::types::{AccessMode, DirEntry, FileAttr, FileType, IoctlRequest, MountFlags, OpenFlags};

/// Local filesystem backend.
///
/// All operations are relative to `root`. For example, if `root` is
/// `/home/amy/project`, then `stat("/src/main.rs")` stats
/// `/home/amy/project/src/main.rs`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    read_only: bool,
}

impl LocalBackend {
    /// Host passthrough rooted at `/`.
    pub fn passthrough() -> Self {
        Self {
            root: PathBuf::from("/"),
            read_only: false,
        }
    }

    /// Create a new local filesystem rooted at the given path.
    ///
    /// The root is canonicalized at construction time to handle symlinks
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = dunce::canonicalize(&root).unwrap_or(root);
        Self {
            root,
            read_only: false,
        }
    }

    /// Set whether this filesystem is read-only.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn confined(&self) -> bool {
        self.root != Path::new("/")
    }

    /// Map a backend path onto the host.
    ///
    /// The final component is never followed, so symlinks themselves can be
    /// inspected and removed. Fails if an intermediate symlink leads out of
    /// the root.
    fn resolve(&self, path: &str) -> VfsResult<PathBuf> {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            return Ok(self.root.clone());
        }

        let full = self.root.join(relative);
        if !self.confined() {
            return Ok(full);
        }

        let (Some(parent), Some(name)) = (full.parent(), full.file_name()) else {
            return Ok(full);
        };
        let canonical = match dunce::canonicalize(parent) {
            Ok(parent) => parent.join(name),
            // Parent doesn't exist, will fail on actual operation
            Err(_) => return Ok(full),
        };

        if !canonical.starts_with(&self.root) {
            return Err(VfsError::path_escapes_root(format!(
                "{} is not under {}",
                canonical.display(),
                self.root.display()
            )));
        }
        Ok(canonical)
    }

    /// Check if write operations are allowed.
    fn check_writable(&self) -> VfsResult<()> {
        if self.read_only {
            Err(VfsError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

impl VfsOps for LocalBackend {
    fn mount(&mut self, info: &MountInfo, argument: &str) -> VfsResult<MountFlags> {
        self.read_only = info.read_only();
        if argument.is_empty() {
            self.root = PathBuf::from("/");
            return Ok(MountFlags::FULL_PATH);
        }

        let root = dunce::canonicalize(argument)?;
        if !root.is_dir() {
            return Err(VfsError::not_a_directory(argument));
        }
        debug!(mount = %info.path, root = %root.display(), "local mount");
        self.root = root;
        Ok(MountFlags::empty())
    }

    fn open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<OpenFile> {
        if flags.modifies() {
            self.check_writable()?;
        }
        let full_path = self.resolve(path)?;

        let file = fs::OpenOptions::new()
            .read(flags.read)
            .write(flags.write)
            .append(flags.append)
            .truncate(flags.truncate)
            .create(flags.create && !flags.exclusive)
            .create_new(flags.create && flags.exclusive)
            .mode(mode)
            .open(&full_path)?;

        Ok(OpenFile::new(file, flags, path))
    }

    fn read(&mut self, file: &mut OpenFile, buf: &mut [u8]) -> VfsResult<usize> {
        file_read(file, buf)
    }

    fn write(&mut self, file: &mut OpenFile, buf: &[u8]) -> VfsResult<usize> {
        self.check_writable()?;
        file_write(file, buf)
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
        file_fstat(file)
    }

    fn opendir(&mut self, path: &str) -> VfsResult<OpenDir> {
        let full_path = self.resolve(path)?;
        let mut entries = Vec::new();

        for entry in fs::read_dir(&full_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata() {
                Ok(meta) => entries.push(DirEntry::with_attr(name, metadata_to_attr(&meta))),
                // Raced with a delete; report what the listing knew.
                Err(_) => {
                    let kind = entry
                        .file_type()
                        .map(FileType::from_std)
                        .unwrap_or(FileType::Bad);
                    entries.push(DirEntry::new(name, kind));
                }
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let mut dir = OpenDir::new(path, entries);
        dir.splice_mounts = true;
        Ok(dir)
    }

    fn access(&mut self, path: &str, mode: AccessMode) -> VfsResult<()> {
        use rustix::fs::Access;

        if mode.contains(AccessMode::WRITE) {
            self.check_writable()?;
        }
        let full_path = self.resolve(path)?;

        let mut access = Access::EXISTS;
        if mode.contains(AccessMode::READ) {
            access |= Access::READ_OK;
        }
        if mode.contains(AccessMode::WRITE) {
            access |= Access::WRITE_OK;
        }
        if mode.contains(AccessMode::EXECUTE) {
            access |= Access::EXEC_OK;
        }
        rustix::fs::access(&full_path, access).map_err(std::io::Error::from)?;
        Ok(())
    }

    fn stat(&mut self, path: &str) -> VfsResult<FileAttr> {
        let full_path = self.resolve(path)?;
        Ok(metadata_to_attr(&fs::metadata(&full_path)?))
    }

    fn lstat(&mut self, path: &str) -> VfsResult<FileAttr> {
        let full_path = self.resolve(path)?;
        Ok(metadata_to_attr(&fs::symlink_metadata(&full_path)?))
    }

    fn chmod(&mut self, path: &str, mode: u32) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        fs::set_permissions(&full_path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    fn chown(&mut self, path: &str, uid: Option<u32>, gid: Option<u32>) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        std::os::unix::fs::chown(&full_path, uid, gid)?;
        Ok(())
    }

    fn mkdir(&mut self, path: &str, mode: u32) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        fs::DirBuilder::new().mode(mode).create(&full_path)?;
        Ok(())
    }

    fn rmdir(&mut self, path: &str) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        fs::remove_dir(&full_path)?;
        Ok(())
    }

    fn chdir(&mut self, path: &str) -> VfsResult<()> {
        let full_path = self.resolve(path)?;
        if fs::metadata(&full_path)?.is_dir() {
            Ok(())
        } else {
            Err(VfsError::not_a_directory(path))
        }
    }

    fn readlink(&mut self, path: &str) -> VfsResult<String> {
        let full_path = self.resolve(path)?;
        Ok(fs::read_link(&full_path)?.to_string_lossy().into_owned())
    }

    fn symlink(&mut self, target: &str, path: &str) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        std::os::unix::fs::symlink(target, &full_path)?;
        Ok(())
    }

    fn link(&mut self, old: &str, new: &str) -> VfsResult<()> {
        self.check_writable()?;
        let old_full = self.resolve(old)?;
        let new_full = self.resolve(new)?;
        fs::hard_link(&old_full, &new_full)?;
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        fs::remove_file(&full_path)?;
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> VfsResult<()> {
        self.check_writable()?;
        let from_path = self.resolve(from)?;
        let to_path = self.resolve(to)?;
        fs::rename(&from_path, &to_path)?;
        Ok(())
    }

    fn mknod(&mut self, path: &str, kind: FileType, mode: u32, dev: u64) -> VfsResult<()> {
        use rustix::fs::{FileType as NodeType, Mode, CWD};

        self.check_writable()?;
        let node_type = match kind {
            FileType::Fifo => NodeType::Fifo,
            FileType::Regular => NodeType::RegularFile,
            other => {
                return Err(VfsError::invalid_argument(format!("mknod of type {other}")));
            }
        };
        let full_path = self.resolve(path)?;
        rustix::fs::mknodat(CWD, &full_path, node_type, Mode::from_bits_truncate(mode), dev)
            .map_err(std::io::Error::from)?;
        Ok(())
    }

    fn real_path(&mut self, path: &str) -> VfsResult<PathBuf> {
        let full = self.root.join(path.trim_start_matches('/'));

        // Use dunce for clean canonical paths (no \\?\ on Windows)
        let canonical = dunce::canonicalize(&full)?;

        if self.confined() && !canonical.starts_with(&self.root) {
            return Err(VfsError::PermissionDenied(format!(
                "path escapes mount root: {path}"
            )));
        }
        Ok(canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountId;
    use std::io::Read;
    use tempfile::TempDir;

    fn info(read_only: bool) -> MountInfo {
        MountInfo {
            id: MountId(1),
            path: "/mnt".into(),
            flags: if read_only {
                MountFlags::READ_ONLY
            } else {
                MountFlags::empty()
            },
            class: "local".into(),
            parent: None,
        }
    }

    fn setup() -> (LocalBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut backend = LocalBackend::passthrough();
        let flags = backend
            .mount(&info(false), dir.path().to_str().unwrap())
            .unwrap();
        assert!(flags.is_empty());
        (backend, dir)
    }

    #[test]
    fn test_create_and_read() {
        let (mut backend, _dir) = setup();

        let mut file = backend.open("/test.txt", OpenFlags::create(), 0o644).unwrap();
        backend.write(&mut file, b"hello world").unwrap();
        backend.close(file).unwrap();

        let mut file = backend.open("/test.txt", OpenFlags::read(), 0).unwrap();
        backend.seek(&mut file, SeekFrom::Start(6)).unwrap();
        assert_eq!(backend.ioctl(&mut file, IoctlRequest::BytesReadable).unwrap(), 5);
        let mut buf = String::new();
        file.file.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "world");
        assert_eq!(backend.tell(&mut file).unwrap(), 11);
        assert_eq!(backend.fstat(&file).unwrap().size, 11);
    }

    #[test]
    fn test_mkdir_and_opendir() {
        let (mut backend, _dir) = setup();

        backend.mkdir("/subdir", 0o755).unwrap();
        backend.open("/subdir/file.txt", OpenFlags::create(), 0o644).unwrap();
        backend.open("/root.txt", OpenFlags::create(), 0o644).unwrap();

        let mut dir = backend.opendir("/").unwrap();
        assert!(dir.splice_mounts);
        let mut names = Vec::new();
        while let Some(entry) = backend.readdir(&mut dir).unwrap() {
            assert!(entry.attr.is_some());
            names.push(entry.name);
        }
        assert_eq!(names, ["root.txt", "subdir"]);

        assert!(matches!(
            backend.mkdir("/subdir", 0o755),
            Err(VfsError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists
        ));
    }

    #[test]
    fn test_read_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let mut backend = LocalBackend::passthrough();
        backend
            .mount(&info(true), dir.path().to_str().unwrap())
            .unwrap();

        assert!(matches!(
            backend.open("/g", OpenFlags::create(), 0o644),
            Err(VfsError::ReadOnly)
        ));
        assert!(matches!(backend.unlink("/f"), Err(VfsError::ReadOnly)));
        assert!(matches!(
            backend.access("/f", AccessMode::WRITE),
            Err(VfsError::ReadOnly)
        ));
        assert!(backend.access("/f", AccessMode::READ).is_ok());
    }

    #[test]
    fn test_path_escape_blocked() {
        let (mut backend, dir) = setup();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("out")).unwrap();

        assert!(matches!(
            backend.stat("/out/anything"),
            Err(VfsError::PathEscapesRoot(_))
        ));
        assert!(matches!(
            backend.real_path("/out"),
            Err(VfsError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_symlink() {
        let (mut backend, _dir) = setup();
        backend.open("/target.txt", OpenFlags::create(), 0o644).unwrap();
        backend.symlink("target.txt", "/link").unwrap();

        assert_eq!(backend.readlink("/link").unwrap(), "target.txt");
        assert!(backend.lstat("/link").unwrap().is_symlink());
        assert!(backend.stat("/link").unwrap().is_file());
    }

    #[test]
    fn test_remove_and_rename() {
        let (mut backend, _dir) = setup();
        backend.open("/a", OpenFlags::create(), 0o644).unwrap();
        backend.mkdir("/d", 0o755).unwrap();

        backend.rename("/a", "/d/b").unwrap();
        assert!(backend.stat("/a").is_err());
        backend.remove("/d/b").unwrap();
        backend.remove("/d").unwrap();
        assert!(backend.stat("/d").is_err());
    }

    #[test]
    fn test_mknod_fifo() {
        let (mut backend, _dir) = setup();
        backend.mknod("/pipe", FileType::Fifo, 0o600, 0).unwrap();
        assert_eq!(backend.lstat("/pipe").unwrap().kind, FileType::Fifo);
        assert!(matches!(
            backend.mknod("/d", FileType::Directory, 0o755, 0),
            Err(VfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_passthrough_mount() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"abc").unwrap();

        let mut backend = LocalBackend::passthrough();
        let flags = backend.mount(&info(false), "").unwrap();
        assert_eq!(flags, MountFlags::FULL_PATH);

        let host = dir.path().join("f");
        let attr = backend.stat(host.to_str().unwrap()).unwrap();
        assert_eq!(attr.size, 3);
        assert_eq!(attr.mode() & 0o170000, 0o100000);
    }

    #[test]
    fn test_real_path() {
        let (mut backend, dir) = setup();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let real = backend.real_path("/f").unwrap();
        assert_eq!(real, dunce::canonicalize(dir.path().join("f")).unwrap());
    }
}
