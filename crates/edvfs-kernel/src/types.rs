//! Stat blocks, directory entries and the flag sets passed across the
//! facade. Everything here is plain data and serializable so front ends can
//! print it as JSON.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// What a path names. Tree nodes use the same set.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum FileType {
    Directory,
    Regular,
    Symlink,
    Fifo,
    /// Entry whose metadata could not be decoded.
    Bad,
    /// Anything else (devices, sockets, archive oddities).
    Unknown,
}

impl FileType {
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::Regular)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }

    /// The `S_IFMT` bits for this type.
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::Directory => 0o040000,
            FileType::Regular => 0o100000,
            FileType::Symlink => 0o120000,
            FileType::Fifo => 0o010000,
            FileType::Bad | FileType::Unknown => 0,
        }
    }

    /// Classify a host file type.
    pub fn from_std(ft: std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;

        if ft.is_dir() {
            FileType::Directory
        } else if ft.is_symlink() {
            FileType::Symlink
        } else if ft.is_file() {
            FileType::Regular
        } else if ft.is_fifo() {
            FileType::Fifo
        } else {
            FileType::Unknown
        }
    }
}

/// Stat block. Host backends fill it from `lstat`/`stat`, tree backends
/// keep one per node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttr {
    /// File number (inode on the host, node id inside trees).
    pub ino: u64,
    pub kind: FileType,
    /// Permission bits only; see [`FileAttr::mode`] for `st_mode`.
    pub perm: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Bytes, or the target length for symlinks.
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl FileAttr {
    fn new(kind: FileType, size: u64, perm: u32, nlink: u32) -> Self {
        let now = SystemTime::now();
        Self {
            ino: 0,
            kind,
            perm,
            nlink,
            uid: 0,
            gid: 0,
            size,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    /// A regular file, timestamps set to now.
    pub fn file(size: u64, perm: u32) -> Self {
        Self::new(FileType::Regular, size, perm, 1)
    }

    pub fn directory(perm: u32) -> Self {
        Self::new(FileType::Directory, 0, perm, 2) // . and ..
    }

    /// Symlinks are always `0o777`.
    pub fn symlink(target_len: u64) -> Self {
        Self::new(FileType::Symlink, target_len, 0o777, 1)
    }

    /// Attributes for a node of the given type with default permissions.
    pub fn for_kind(kind: FileType) -> Self {
        match kind {
            FileType::Directory => Self::directory(0o755),
            FileType::Symlink => Self::symlink(0),
            other => Self::new(other, 0, 0o644, 1),
        }
    }

    /// Full `st_mode`: type bits plus permissions.
    pub fn mode(&self) -> u32 {
        self.kind.mode_bits() | (self.perm & 0o7777)
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }
}

/// One `readdir` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Last path component only.
    pub name: String,
    pub ino: u64,
    pub kind: FileType,
    /// Stat snapshot taken while listing, when the backend had it at hand.
    pub attr: Option<FileAttr>,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, kind: FileType) -> Self {
        Self {
            name: name.into(),
            ino: 0,
            kind,
            attr: None,
        }
    }

    /// Entry whose type and file number come from `attr`.
    pub fn with_attr(name: impl Into<String>, attr: FileAttr) -> Self {
        Self {
            name: name.into(),
            ino: attr.ino,
            kind: attr.kind,
            attr: Some(attr),
        }
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self::new(name, FileType::Regular)
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self::new(name, FileType::Directory)
    }
}

/// How [`crate::VfsContext::open`] opens a file. The default is read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    /// With `create`, fail with `EEXIST` if the file is there.
    pub exclusive: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            truncate: false,
            exclusive: false,
        }
    }
}

impl OpenFlags {
    pub fn read() -> Self {
        Self::default()
    }

    /// Read and write, no create.
    pub fn write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    pub fn create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Default::default()
        }
    }

    pub fn create_exclusive() -> Self {
        Self {
            create: true,
            exclusive: true,
            ..Self::write()
        }
    }

    pub fn create_truncate() -> Self {
        Self {
            create: true,
            truncate: true,
            ..Self::write()
        }
    }

    /// Read-only mounts refuse opens for which this holds.
    pub fn modifies(&self) -> bool {
        self.write || self.append || self.create || self.truncate
    }
}

bitflags! {
    /// Access check mode. The empty set checks existence only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMode: u32 {
        const READ = 4;
        const WRITE = 2;
        const EXECUTE = 1;
    }
}

bitflags! {
    /// Mount flags, shared between the caller and the backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MountFlags: u32 {
        /// Writes are refused with `EROFS`.
        const READ_ONLY = 0x01;
        /// Mount point does not exist on the host; spliced into listings.
        const VIRTUAL = 0x02;
        /// Backend wants the whole canonical path, not the mount-relative one.
        const FULL_PATH = 0x04;
        /// Tree lookups go through the name cache.
        const NAME_CACHE = 0x08;
        /// Mount is being torn down.
        const SHUTTING_DOWN = 0x10;
        /// Created implicitly from `path#backend` syntax.
        const AUTO = 0x20;
    }
}

bitflags! {
    /// Unmount behaviour.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UnmountFlags: u32 {
        /// Unmount mounts nested inside the target first.
        const DETACH_CHILDREN = 0x01;
    }
}

/// Typed `ioctl` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum IoctlRequest {
    /// Bytes left between the file position and end of file (`FIONREAD`).
    BytesReadable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_file_type() {
        assert!(FileType::Regular.is_file());
        assert!(!FileType::Regular.is_dir());
        assert!(FileType::Directory.is_dir());
        assert!(FileType::Symlink.is_symlink());
        assert_eq!(FileType::Directory.to_string(), "directory");
        assert_eq!(FileType::from_str("fifo").unwrap(), FileType::Fifo);
    }

    #[test]
    fn test_file_attr_constructors() {
        let file = FileAttr::file(1024, 0o644);
        assert!(file.is_file());
        assert_eq!(file.size, 1024);
        assert_eq!(file.perm, 0o644);
        assert_eq!(file.mode(), 0o100644);

        let dir = FileAttr::directory(0o755);
        assert!(dir.is_dir());
        assert_eq!(dir.perm, 0o755);
        assert_eq!(dir.nlink, 2);
        assert_eq!(dir.mode(), 0o040755);
    }

    #[test]
    fn test_dir_entry() {
        let file = DirEntry::file("test.txt");
        assert_eq!(file.name, "test.txt");
        assert!(file.kind.is_file());
        assert!(file.attr.is_none());

        let mut attr = FileAttr::directory(0o700);
        attr.ino = 42;
        let dir = DirEntry::with_attr("subdir", attr);
        assert!(dir.kind.is_dir());
        assert_eq!(dir.ino, 42);
    }

    #[test]
    fn test_open_flags() {
        let read = OpenFlags::read();
        assert!(read.read);
        assert!(!read.write);
        assert!(!read.modifies());

        let create = OpenFlags::create_exclusive();
        assert!(create.create);
        assert!(create.exclusive);
        assert!(create.write);
        assert!(create.modifies());
    }

    #[test]
    fn test_mount_flags() {
        let flags = MountFlags::READ_ONLY | MountFlags::NAME_CACHE;
        assert!(flags.contains(MountFlags::READ_ONLY));
        assert!(!flags.intersects(MountFlags::VIRTUAL | MountFlags::AUTO));
    }
}
