//! Path resolution over a [`NodeTree`].
//!
//! Walks a backend-relative path one component at a time. Backends hook in
//! through [`NodeLookup`] to create or fetch children on demand.

use bitflags::bitflags;
use tracing::trace;

use crate::config::VfsConfig;
use crate::error::{VfsError, VfsResult};
use crate::node::{NodeId, NodeTree};
use crate::path::is_canonical;
use crate::types::FileType;

/// What the caller is about to do with the resolved path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOp {
    Lookup,
    /// A missing final component is returned as [`Resolved::Missing`].
    Create,
    /// As `Create`, and refused on read-only mounts.
    Rename,
    /// Refused on read-only mounts.
    Delete,
    /// Missing directories are created along the way.
    MkTree,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LookupFlags: u32 {
        /// Follow a symlink in the final component.
        const FOLLOW = 0x01;
        /// `..` past the tree root fails with `EXDEV` instead of leaving
        /// the mount.
        const NO_CROSS = 0x02;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupLimits {
    pub name_max: usize,
    pub path_max: usize,
    pub max_symlinks: u32,
}

impl From<&VfsConfig> for LookupLimits {
    fn from(config: &VfsConfig) -> Self {
        Self {
            name_max: config.name_max,
            path_max: config.path_max,
            max_symlinks: config.max_symlinks,
        }
    }
}

/// Outcome of a successful walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Node(NodeId),
    /// Everything but the last component exists.
    Missing { parent: NodeId, name: String },
}

impl Resolved {
    /// The node, or `ENOENT` for a missing final component.
    pub fn node(self) -> VfsResult<NodeId> {
        match self {
            Resolved::Node(id) => Ok(id),
            Resolved::Missing { name, .. } => Err(VfsError::not_found(name)),
        }
    }
}

/// Per-backend hooks used by [`resolve`].
#[allow(unused_variables)]
pub trait NodeLookup {
    /// Find `name` under `dir`.
    fn lookup_child(
        &mut self,
        tree: &mut NodeTree,
        dir: NodeId,
        name: &str,
        op: LookupOp,
    ) -> VfsResult<Option<NodeId>> {
        if let Some(child) = tree.find_child(dir, name) {
            return Ok(Some(child));
        }
        if op == LookupOp::MkTree {
            return tree.add(dir, FileType::Directory, name).map(Some);
        }
        Ok(None)
    }

    /// Target of a symlink node.
    fn readlink(&mut self, tree: &NodeTree, node: NodeId) -> VfsResult<String> {
        let node = tree.node(node)?;
        node.target
            .clone()
            .ok_or_else(|| VfsError::NotASymlink(node.name.clone()))
    }

    /// Make sure the children of `dir` are loaded.
    fn populate_dir(&mut self, tree: &mut NodeTree, dir: NodeId) -> VfsResult<()> {
        Ok(())
    }
}

/// Resolve `path` against `tree`.
///
/// `..` above the tree root reports [`VfsError::CrossMount`] carrying the
/// unresolved remainder, so the caller can continue in the parent mount.
pub fn resolve<S: NodeLookup + ?Sized>(
    tree: &mut NodeTree,
    source: &mut S,
    path: &str,
    op: LookupOp,
    flags: LookupFlags,
    limits: &LookupLimits,
    read_only: bool,
) -> VfsResult<Resolved> {
    if read_only && matches!(op, LookupOp::Delete | LookupOp::Rename) {
        return Err(VfsError::ReadOnly);
    }

    if op == LookupOp::Lookup && is_canonical(path) {
        if let Some(id) = tree.cache_lookup(path) {
            trace!(path, node = %id, "name cache hit");
            return Ok(Resolved::Node(id));
        }
    }

    let root = tree.root();
    let mut work = path.to_string();
    let mut pos = 0;
    let mut current = root;
    let mut links = 0u32;

    if work.starts_with('/') {
        pos = skip_separators(&work, 0);
    }

    while pos < work.len() {
        let end = work[pos..].find('/').map_or(work.len(), |i| pos + i);
        let last = end == work.len();
        let name = &work[pos..end];
        let next = if last { end } else { end + 1 };

        if name.len() > limits.name_max {
            return Err(VfsError::NameTooLong);
        }

        match name {
            "" | "." => {
                if !tree.node(current)?.kind.is_dir() {
                    return Err(VfsError::not_a_directory(tree.path(current, false)));
                }
                if last && !matches!(op, LookupOp::Lookup | LookupOp::MkTree) {
                    return Err(VfsError::is_a_directory(path));
                }
            }
            ".." => {
                if !tree.node(current)?.kind.is_dir() {
                    return Err(VfsError::not_a_directory(tree.path(current, false)));
                }
                if current == root {
                    if flags.contains(LookupFlags::NO_CROSS) {
                        return Err(VfsError::CrossDeviceLink);
                    }
                    return Err(VfsError::CrossMount {
                        rest: work[next..].to_string(),
                    });
                }
                current = tree.node(current)?.parent.unwrap_or(root);
            }
            _ => {
                if !tree.node(current)?.kind.is_dir() {
                    return Err(VfsError::not_a_directory(tree.path(current, false)));
                }
                source.populate_dir(tree, current)?;

                let Some(child) = source.lookup_child(tree, current, name, op)? else {
                    if last && matches!(op, LookupOp::Create | LookupOp::Rename) {
                        return Ok(Resolved::Missing {
                            parent: current,
                            name: name.to_string(),
                        });
                    }
                    return Err(VfsError::not_found(path));
                };

                let is_link = tree.node(child)?.kind.is_symlink();
                if is_link && (!last || flags.contains(LookupFlags::FOLLOW)) {
                    links += 1;
                    if links > limits.max_symlinks {
                        return Err(VfsError::TooManySymlinks);
                    }

                    let target = source.readlink(tree, child)?;
                    let rest = &work[next..];
                    let spliced = if rest.is_empty() {
                        target
                    } else {
                        format!("{}/{}", target.trim_end_matches('/'), rest)
                    };
                    if spliced.len() > limits.path_max {
                        return Err(VfsError::NameTooLong);
                    }

                    trace!(link = %tree.path(child, false), target = %spliced, "following symlink");
                    work = spliced;
                    pos = 0;
                    if work.starts_with('/') {
                        current = root;
                        pos = skip_separators(&work, 0);
                    }
                    continue;
                }
                current = child;
            }
        }

        pos = next;
        // A trailing separator leaves an empty final component.
        if !last && pos == work.len() {
            if !tree.node(current)?.kind.is_dir() {
                return Err(VfsError::not_a_directory(path));
            }
            if !matches!(op, LookupOp::Lookup | LookupOp::MkTree) {
                return Err(VfsError::is_a_directory(path));
            }
        }
    }

    if op == LookupOp::Lookup {
        tree.cache_link(current);
    }
    Ok(Resolved::Node(current))
}

fn skip_separators(s: &str, from: usize) -> usize {
    from + s[from..].len() - s[from..].trim_start_matches('/').len()
}
