//! In-memory node tree for tree-based backends.
//!
//! Nodes live in an arena keyed by [`NodeId`]. Children are owned by the
//! arena; parent links and cache membership are plain ids, so there are no
//! reference cycles to break on teardown.

use std::collections::HashMap;
use std::path::Path;
use tempfile::TempPath;
use tracing::warn;

use crate::cache::NameCache;
use crate::config::NameCacheConfig;
use crate::error::{VfsError, VfsResult};
use crate::path::hash_name;
use crate::types::{FileAttr, FileType};

/// Node identifier, also reported as the file number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub kind: FileType,
    pub name: String,
    pub hash: u64,
    pub parent: Option<NodeId>,
    /// In insertion order. Empty for non-directories.
    pub children: Vec<NodeId>,
    pub attr: FileAttr,
    /// Symlink target.
    pub target: Option<String>,
    /// Extracted copy of the contents; deleted with the node.
    pub local: Option<TempPath>,
    /// Open handles pinning the node.
    pub refs: usize,
    pub cached: bool,
}

/// Arena of nodes rooted at a single directory.
#[derive(Debug)]
pub struct NodeTree {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    next_id: u64,
    mount_path: String,
    cache: Option<NameCache>,
    name_max: usize,
}

impl NodeTree {
    pub fn new(name_max: usize) -> Self {
        let root = NodeId(1);
        let mut attr = FileAttr::directory(0o755);
        attr.ino = root.0;

        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                id: root,
                kind: FileType::Directory,
                name: String::new(),
                hash: hash_name(""),
                parent: None,
                children: Vec::new(),
                attr,
                target: None,
                local: None,
                refs: 0,
                cached: false,
            },
        );

        Self {
            nodes,
            root,
            next_id: 2,
            mount_path: String::new(),
            cache: None,
            name_max,
        }
    }

    /// Prefix reported by [`NodeTree::path`] when asked to include the mount.
    pub fn set_mount_path(&mut self, path: &str) {
        self.mount_path = path.trim_end_matches('/').to_string();
    }

    /// Index eligible nodes by path from now on.
    pub fn enable_cache(&mut self, config: NameCacheConfig) {
        self.cache = Some(NameCache::new(config));
    }

    pub fn cache(&self) -> Option<&NameCache> {
        self.cache.as_ref()
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Like [`NodeTree::get`], for callers that hold an id they trust.
    pub fn node(&self, id: NodeId) -> VfsResult<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| VfsError::not_found(id.to_string()))
    }

    pub fn node_mut(&mut self, id: NodeId) -> VfsResult<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| VfsError::not_found(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Child of `parent` called `name`.
    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let hash = hash_name(name);
        let parent = self.nodes.get(&parent)?;
        parent.children.iter().copied().find(|id| {
            self.nodes
                .get(id)
                .is_some_and(|n| n.hash == hash && n.name == name)
        })
    }

    /// Create `name` as the last child of `parent`.
    pub fn add(&mut self, parent: NodeId, kind: FileType, name: &str) -> VfsResult<NodeId> {
        if name.len() > self.name_max {
            return Err(VfsError::NameTooLong);
        }
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(VfsError::invalid_argument(format!("node name {name:?}")));
        }
        if !self.node(parent)?.kind.is_dir() {
            return Err(VfsError::not_a_directory(self.path(parent, false)));
        }
        if self.find_child(parent, name).is_some() {
            return Err(VfsError::already_exists(name));
        }

        let id = NodeId(self.next_id);
        self.next_id += 1;

        let mut attr = FileAttr::for_kind(kind);
        attr.ino = id.0;
        self.nodes.insert(
            id,
            Node {
                id,
                kind,
                name: name.to_string(),
                hash: hash_name(name),
                parent: Some(parent),
                children: Vec::new(),
                attr,
                target: None,
                local: None,
                refs: 0,
                cached: false,
            },
        );
        self.node_mut(parent)?.children.push(id);
        self.cache_link(id);
        Ok(id)
    }

    /// Create the node at `path`, making missing parent directories.
    ///
    /// Directories that already exist are returned as-is; anything else that
    /// already exists is `EEXIST`.
    pub fn push(&mut self, kind: FileType, path: &str) -> VfsResult<NodeId> {
        let mut components = path.split('/').filter(|c| !c.is_empty() && *c != ".").peekable();
        let mut current = self.root;

        if components.peek().is_none() {
            return if kind.is_dir() {
                Ok(current)
            } else {
                Err(VfsError::already_exists("/"))
            };
        }

        while let Some(name) = components.next() {
            let last = components.peek().is_none();
            match self.find_child(current, name) {
                Some(existing) => {
                    let existing_kind = self.node(existing)?.kind;
                    if last {
                        return if kind.is_dir() && existing_kind.is_dir() {
                            Ok(existing)
                        } else {
                            Err(VfsError::already_exists(path))
                        };
                    }
                    if !existing_kind.is_dir() {
                        return Err(VfsError::not_a_directory(self.path(existing, false)));
                    }
                    current = existing;
                }
                None if last => return self.add(current, kind, name),
                None => current = self.add(current, FileType::Directory, name)?,
            }
        }

        Ok(current)
    }

    /// `push` for a directory.
    pub fn mktree(&mut self, path: &str) -> VfsResult<NodeId> {
        self.push(FileType::Directory, path)
    }

    /// Absolute path of `id`, optionally prefixed with the mount path.
    pub fn path(&self, id: NodeId, include_mount: bool) -> String {
        let mut chain = Vec::new();
        let mut cursor = self.nodes.get(&id);
        while let Some(node) = cursor {
            if node.parent.is_none() {
                break;
            }
            chain.push(node.name.as_str());
            cursor = node.parent.and_then(|p| self.nodes.get(&p));
        }

        let prefix = if include_mount { self.mount_path.as_str() } else { "" };
        let len = prefix.len() + chain.iter().map(|n| n.len() + 1).sum::<usize>();

        let mut out = String::with_capacity(len.max(1));
        out.push_str(prefix);
        for name in chain.iter().rev() {
            out.push('/');
            out.push_str(name);
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    pub fn acquire(&mut self, id: NodeId) -> VfsResult<()> {
        self.node_mut(id)?.refs += 1;
        Ok(())
    }

    pub fn release(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.refs = node.refs.saturating_sub(1);
        }
    }

    /// Attach an extracted copy to a node.
    pub fn set_local(&mut self, id: NodeId, local: TempPath) -> VfsResult<()> {
        self.node_mut(id)?.local = Some(local);
        Ok(())
    }

    pub fn local_path(&self, id: NodeId) -> Option<&Path> {
        self.nodes.get(&id)?.local.as_deref()
    }

    /// Destroy `id` and its subtree, children first.
    ///
    /// Fails with `EBUSY` while any node in the subtree is pinned.
    pub fn remove(&mut self, id: NodeId) -> VfsResult<()> {
        if id == self.root {
            return Err(VfsError::busy("tree root"));
        }

        let mut order = Vec::new();
        self.post_order(id, &mut order);
        if let Some(busy) = order
            .iter()
            .find(|id| self.nodes.get(*id).is_some_and(|n| n.refs > 0))
        {
            return Err(VfsError::busy(self.path(*busy, false)));
        }

        for victim in &order {
            self.cache_unlink(*victim);
        }

        let parent = self.node(id)?.parent;
        for victim in order {
            let local = self.nodes.remove(&victim).and_then(|mut n| n.local.take());
            if let Some(local) = local {
                if let Err(e) = local.close() {
                    warn!(node = %victim, error = %e, "failed to remove extracted file");
                }
            }
        }

        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
        Ok(())
    }

    /// Drop every node except the root.
    pub fn clear(&mut self) -> VfsResult<()> {
        let children = self.node(self.root)?.children.clone();
        for child in children {
            self.remove(child)?;
        }
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
        Ok(())
    }

    fn post_order(&self, id: NodeId, out: &mut Vec<NodeId>) {
        if let Some(node) = self.nodes.get(&id) {
            for child in &node.children {
                self.post_order(*child, out);
            }
            out.push(id);
        }
    }

    /// Cached node for `path`, promoting it.
    pub fn cache_lookup(&mut self, path: &str) -> Option<NodeId> {
        let id = self.cache.as_mut()?.lookup(path)?;
        self.nodes.contains_key(&id).then_some(id)
    }

    /// Link `id` into the name cache if enabled, eligible and not yet linked.
    pub fn cache_link(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if node.cached || self.cache.is_none() {
            return;
        }
        let kind = node.kind;
        let path = self.path(id, false);

        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        let Some(evicted) = cache.link(id, kind, &path) else {
            return;
        };
        for victim in evicted {
            if let Some(n) = self.nodes.get_mut(&victim) {
                n.cached = false;
            }
        }
        if let Some(n) = self.nodes.get_mut(&id) {
            n.cached = true;
        }
    }

    /// Remove `id` from the name cache. Idempotent.
    pub fn cache_unlink(&mut self, id: NodeId) {
        let cached = self.nodes.get(&id).is_some_and(|n| n.cached);
        if !cached {
            return;
        }
        let path = self.path(id, false);
        if let Some(cache) = self.cache.as_mut() {
            cache.unlink(&path);
        }
        if let Some(n) = self.nodes.get_mut(&id) {
            n.cached = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_find() {
        let mut tree = NodeTree::new(255);
        let root = tree.root();
        let docs = tree.add(root, FileType::Directory, "docs").unwrap();
        let readme = tree.add(docs, FileType::Regular, "readme").unwrap();

        assert_eq!(tree.find_child(root, "docs"), Some(docs));
        assert_eq!(tree.find_child(docs, "readme"), Some(readme));
        assert_eq!(tree.find_child(docs, "nope"), None);
        assert_eq!(tree.node(readme).unwrap().attr.ino, readme.0);
    }

    #[test]
    fn test_add_errors() {
        let mut tree = NodeTree::new(8);
        let root = tree.root();
        let file = tree.add(root, FileType::Regular, "f").unwrap();

        assert!(matches!(
            tree.add(root, FileType::Regular, "f"),
            Err(VfsError::AlreadyExists(_))
        ));
        assert!(matches!(
            tree.add(root, FileType::Regular, "much-too-long"),
            Err(VfsError::NameTooLong)
        ));
        assert!(matches!(
            tree.add(file, FileType::Regular, "x"),
            Err(VfsError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_children_keep_insertion_order() {
        let mut tree = NodeTree::new(255);
        let root = tree.root();
        for name in ["zeta", "alpha", "mid"] {
            tree.add(root, FileType::Regular, name).unwrap();
        }
        let names: Vec<_> = tree
            .node(root)
            .unwrap()
            .children
            .iter()
            .map(|c| tree.node(*c).unwrap().name.clone())
            .collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_push_creates_parents() {
        let mut tree = NodeTree::new(255);
        let file = tree.push(FileType::Regular, "/a/b/c.txt").unwrap();
        assert_eq!(tree.path(file, false), "/a/b/c.txt");

        // Directories get mktree semantics.
        let b = tree.push(FileType::Directory, "a/b/").unwrap();
        assert_eq!(tree.path(b, false), "/a/b");
        assert!(matches!(
            tree.push(FileType::Regular, "/a/b/c.txt"),
            Err(VfsError::AlreadyExists(_))
        ));
        assert!(matches!(
            tree.push(FileType::Regular, "/a/b/c.txt/d"),
            Err(VfsError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_path_with_mount() {
        let mut tree = NodeTree::new(255);
        tree.set_mount_path("/tmp/x.tar#tar");
        let file = tree.push(FileType::Regular, "/docs/readme").unwrap();
        assert_eq!(tree.path(file, true), "/tmp/x.tar#tar/docs/readme");
        assert_eq!(tree.path(tree.root(), false), "/");
        assert_eq!(tree.path(tree.root(), true), "/tmp/x.tar#tar");
    }

    #[test]
    fn test_remove_subtree() {
        let mut tree = NodeTree::new(255);
        let a = tree.mktree("/a").unwrap();
        let f = tree.push(FileType::Regular, "/a/b/f").unwrap();
        assert_eq!(tree.len(), 4);

        tree.acquire(f).unwrap();
        assert!(matches!(tree.remove(a), Err(VfsError::Busy(_))));
        tree.release(f);

        tree.remove(a).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.find_child(tree.root(), "a").is_none());
        assert!(tree.get(f).is_none());
    }

    #[test]
    fn test_remove_deletes_local_copy() {
        let mut tree = NodeTree::new(255);
        let f = tree.push(FileType::Regular, "/f").unwrap();
        let temp = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let host = temp.to_path_buf();
        tree.set_local(f, temp).unwrap();
        assert!(host.exists());

        tree.remove(f).unwrap();
        assert!(!host.exists());
    }

    #[test]
    fn test_cache_membership() {
        let mut tree = NodeTree::new(255);
        tree.enable_cache(NameCacheConfig {
            max_bytes: 1024,
            max_entries: 2,
            max_path: 64,
        });
        let a = tree.push(FileType::Regular, "/a").unwrap();
        let b = tree.push(FileType::Regular, "/b").unwrap();
        assert!(tree.node(a).unwrap().cached);
        assert_eq!(tree.cache_lookup("/a"), Some(a));

        // /b is now least recently used.
        let c = tree.push(FileType::Regular, "/c").unwrap();
        assert!(!tree.node(b).unwrap().cached);
        assert!(tree.node(c).unwrap().cached);
        assert_eq!(tree.cache_lookup("/b"), None);

        tree.remove(c).unwrap();
        assert_eq!(tree.cache_lookup("/c"), None);
        assert_eq!(tree.cache().unwrap().len(), 1);
    }
}
