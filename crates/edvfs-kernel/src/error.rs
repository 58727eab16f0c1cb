//! Errors returned by every VFS operation.
//!
//! Each variant maps onto one errno through [`VfsError::errno`], which is
//! what handles record as their last error.

use std::io;
use thiserror::Error;

/// Failure of a VFS operation.
#[derive(Debug, Error)]
pub enum VfsError {
    /// `ENOENT`
    #[error("not found: {0}")]
    NotFound(String),

    /// `EEXIST`: name taken, or a mount already sits on the point.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// `EPERM`, e.g. unmounting `/`.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// `EROFS`: write through a read-only mount.
    #[error("filesystem is read-only")]
    ReadOnly,

    /// `ENOTDIR`
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// `EISDIR`
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// `ENOTEMPTY`
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// A host path left the directory a `local` mount is confined to.
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// Invalid argument (bad prefix, malformed URL, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Nothing mounted at, or routing, the path.
    #[error("no mount point for path: {0}")]
    NoMountPoint(String),

    /// No backend class registered under this name.
    #[error("no such backend: {0}")]
    NoDevice(String),

    /// Mount still has open handles or nested mounts.
    #[error("busy: {0}")]
    Busy(String),

    /// `readlink` on something else.
    #[error("not a symbolic link: {0}")]
    NotASymlink(String),

    /// `EXDEV`: rename or link between two mounts.
    #[error("cross-device link")]
    CrossDeviceLink,

    /// A `..` walked off the top of a backend tree. The dispatcher re-resolves
    /// `rest` relative to the directory holding the mount point.
    #[error("path leaves mount: {rest}")]
    CrossMount { rest: String },

    /// `ELOOP`
    #[error("too many symbolic links")]
    TooManySymlinks,

    /// File name too long.
    #[error("file name too long")]
    NameTooLong,

    /// The backend does not implement this operation.
    #[error("operation not supported")]
    Unsupported,

    /// Handle id unknown (never issued or already closed).
    #[error("bad handle: {0}")]
    BadHandle(i32),

    /// Handle id space exhausted.
    #[error("too many open handles")]
    TooManyHandles,

    /// Host error, raw errno preserved.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a PathEscapesRoot error.
    pub fn path_escapes_root(path: impl Into<String>) -> Self {
        Self::PathEscapesRoot(path.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a NoMountPoint error.
    pub fn no_mount_point(path: impl Into<String>) -> Self {
        Self::NoMountPoint(path.into())
    }

    /// Create a Busy error.
    pub fn busy(what: impl Into<String>) -> Self {
        Self::Busy(what.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// The OS error code this error reports to callers.
    pub fn errno(&self) -> i32 {
        use rustix::io::Errno;

        let errno = match self {
            VfsError::NotFound(_) | VfsError::NoMountPoint(_) => Errno::NOENT,
            VfsError::AlreadyExists(_) => Errno::EXIST,
            VfsError::PermissionDenied(_) | VfsError::PathEscapesRoot(_) => Errno::PERM,
            VfsError::ReadOnly => Errno::ROFS,
            VfsError::NotADirectory(_) => Errno::NOTDIR,
            VfsError::IsADirectory(_) => Errno::ISDIR,
            VfsError::DirectoryNotEmpty(_) => Errno::NOTEMPTY,
            VfsError::InvalidArgument(_) | VfsError::NotASymlink(_) => Errno::INVAL,
            VfsError::NoDevice(_) => Errno::NODEV,
            VfsError::Busy(_) => Errno::BUSY,
            VfsError::CrossDeviceLink | VfsError::CrossMount { .. } => Errno::XDEV,
            VfsError::TooManySymlinks => Errno::LOOP,
            VfsError::NameTooLong => Errno::NAMETOOLONG,
            VfsError::Unsupported => Errno::NOTSUP,
            VfsError::BadHandle(_) => Errno::BADF,
            VfsError::TooManyHandles => Errno::NFILE,
            VfsError::Io(e) => return e.raw_os_error().unwrap_or(Errno::IO.raw_os_error()),
            VfsError::Other(_) => Errno::IO,
        };
        errno.raw_os_error()
    }
}

/// Convert VfsError to std::io::Error for compatibility.
/// Keeps the message; the kind follows the errno.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::Io(e) => e,
            other => {
                let kind = io::Error::from_raw_os_error(other.errno()).kind();
                io::Error::new(kind, other)
            }
        }
    }
}

/// Result alias used throughout the crate.
pub type VfsResult<T> = Result<T, VfsError>;
