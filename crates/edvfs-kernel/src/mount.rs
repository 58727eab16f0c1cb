//! Mount table with longest-prefix routing.
//!
//! Maps canonical path prefixes to mounted backend instances. A path is
//! routed to the mount whose point is its longest component-wise prefix,
//! found by backing off one component at a time until a point matches.
//! The root mount at `/` always matches.

use std::collections::BTreeSet;
use strum::EnumCount;

use crate::handle::HandleId;
use crate::ops::VfsOps;
use crate::path::{hash_name, parent_dir};
use crate::types::MountFlags;

/// Mount identifier. Never reused within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountId(pub u32);

/// Public view of a mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub id: MountId,
    /// The mount path (e.g., "/mnt/project").
    pub path: String,
    pub flags: MountFlags,
    /// Backend class prefix.
    pub class: String,
    /// Mount the point was resolved through.
    pub parent: Option<MountId>,
}

impl MountInfo {
    pub fn read_only(&self) -> bool {
        self.flags.contains(MountFlags::READ_ONLY)
    }
}

/// Operations counted per mount.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::EnumCount,
    strum::EnumIter,
    strum::AsRefStr,
    strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum VfsOp {
    Open,
    Close,
    Read,
    Write,
    Seek,
    Tell,
    Ioctl,
    Fileno,
    Fstat,
    Opendir,
    Readdir,
    Closedir,
    Access,
    Stat,
    Lstat,
    Chmod,
    Chown,
    Mkdir,
    Rmdir,
    Chdir,
    Readlink,
    Symlink,
    Link,
    Unlink,
    Remove,
    Rename,
    Mknod,
    RealPath,
}

/// Usage counters, one per [`VfsOp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpStats {
    counts: [u64; VfsOp::COUNT],
}

impl Default for OpStats {
    fn default() -> Self {
        Self {
            counts: [0; VfsOp::COUNT],
        }
    }
}

impl OpStats {
    pub fn bump(&mut self, op: VfsOp) {
        self.counts[op as usize] += 1;
    }

    pub fn get(&self, op: VfsOp) -> u64 {
        self.counts[op as usize]
    }

    /// Operations used at least once, with their counts.
    pub fn nonzero(&self) -> impl Iterator<Item = (VfsOp, u64)> + '_ {
        use strum::IntoEnumIterator;
        VfsOp::iter()
            .map(|op| (op, self.get(op)))
            .filter(|(_, n)| *n > 0)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// A mounted backend.
pub struct Mount {
    pub id: MountId,
    pub path: String,
    pub hash: u64,
    pub parent: Option<MountId>,
    pub flags: MountFlags,
    pub class: String,
    pub(crate) backend: Box<dyn VfsOps>,
    /// Handles currently open through this mount.
    pub open: BTreeSet<HandleId>,
    pub stats: OpStats,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("class", &self.class)
            .field("open", &self.open)
            .finish()
    }
}

impl Mount {
    pub fn info(&self) -> MountInfo {
        MountInfo {
            id: self.id,
            path: self.path.clone(),
            flags: self.flags,
            class: self.class.clone(),
            parent: self.parent,
        }
    }

    pub fn read_only(&self) -> bool {
        self.flags.contains(MountFlags::READ_ONLY)
    }
}

/// Routes canonical paths to mounts.
#[derive(Debug, Default)]
pub struct MountTable {
    mounts: Vec<Mount>,
    next_id: u32,
    edit_seq: u64,
}

impl MountTable {
    /// Create a new empty mount table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped on every insert and removal.
    pub fn edit_seq(&self) -> u64 {
        self.edit_seq
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Mount> {
        self.mounts.iter()
    }

    /// Add a mount at the canonical `path`. Uniqueness is the caller's job.
    pub fn insert(
        &mut self,
        path: &str,
        flags: MountFlags,
        class: &str,
        backend: Box<dyn VfsOps>,
        parent: Option<MountId>,
    ) -> MountId {
        let id = MountId(self.next_id);
        self.next_id += 1;
        self.mounts.push(Mount {
            id,
            path: path.to_string(),
            hash: hash_name(path),
            parent,
            flags,
            class: class.to_string(),
            backend,
            open: BTreeSet::new(),
            stats: OpStats::default(),
        });
        self.edit_seq += 1;
        id
    }

    pub fn remove(&mut self, id: MountId) -> Option<Mount> {
        let idx = self.mounts.iter().position(|m| m.id == id)?;
        self.edit_seq += 1;
        Some(self.mounts.remove(idx))
    }

    pub fn get(&self, id: MountId) -> Option<&Mount> {
        self.mounts.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: MountId) -> Option<&mut Mount> {
        self.mounts.iter_mut().find(|m| m.id == id)
    }

    /// Mount whose point is exactly `path`.
    pub fn find_exact(&self, path: &str) -> Option<MountId> {
        let hash = hash_name(path);
        self.mounts
            .iter()
            .find(|m| m.hash == hash && m.path == path)
            .map(|m| m.id)
    }

    /// Route a canonical path to `(mount, backend path)`.
    ///
    /// The backend path keeps its leading `/`; it is the whole input when
    /// the mount asked for [`MountFlags::FULL_PATH`].
    pub fn resolve(&self, canonical: &str) -> Option<(MountId, String)> {
        let mut candidate = canonical;
        let id = loop {
            if let Some(id) = self.find_exact(candidate) {
                break id;
            }
            if candidate == "/" {
                return None;
            }
            candidate = parent_dir(candidate);
        };

        let mount = self.get(id)?;
        let relative = if mount.flags.contains(MountFlags::FULL_PATH) || candidate == "/" {
            canonical.to_string()
        } else {
            match &canonical[candidate.len()..] {
                "" => "/".to_string(),
                rest => rest.to_string(),
            }
        };
        Some((id, relative))
    }

    /// Mounts living directly in directory `dir` that carry any of `flags`
    /// (all of them when `flags` is empty).
    pub fn list(&self, dir: &str, flags: MountFlags) -> Vec<MountInfo> {
        self.mounts
            .iter()
            .filter(|m| m.path != "/" && parent_dir(&m.path) == dir)
            .filter(|m| flags.is_empty() || m.flags.intersects(flags))
            .map(Mount::info)
            .collect()
    }

    /// Mounts whose point was resolved through `id`.
    pub fn children(&self, id: MountId) -> Vec<MountId> {
        self.mounts
            .iter()
            .filter(|m| m.parent == Some(id))
            .map(|m| m.id)
            .collect()
    }
}
