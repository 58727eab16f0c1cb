//! Name cache: absolute path to node, bounded by LRU eviction.

use lru::LruCache;
use std::hash::{Hash, Hasher};
use tracing::trace;

use crate::config::NameCacheConfig;
use crate::node::NodeId;
use crate::path::hash_name;
use crate::types::FileType;

/// Cache key. Hashing only looks at the precomputed hash; equality checks
/// the length before comparing bytes.
#[derive(Debug, Clone, Eq)]
struct CacheKey {
    hash: u64,
    path: String,
}

impl CacheKey {
    fn new(path: &str) -> Self {
        Self {
            hash: hash_name(path),
            path: path.to_string(),
        }
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.path.len() == other.path.len() && self.path == other.path
    }
}

/// Path-indexed node cache for one tree.
#[derive(Debug)]
pub struct NameCache {
    entries: LruCache<CacheKey, NodeId>,
    bytes: usize,
    config: NameCacheConfig,
}

impl NameCache {
    pub fn new(config: NameCacheConfig) -> Self {
        Self {
            entries: LruCache::unbounded(),
            bytes: 0,
            config,
        }
    }

    /// Only files and directories with short paths are cached.
    pub fn eligible(&self, kind: FileType, path: &str) -> bool {
        matches!(kind, FileType::Regular | FileType::Directory)
            && path.len() < self.config.max_path
            && path.len() <= self.config.max_bytes
    }

    /// Insert `node` under `path`, evicting least recently used entries
    /// until both budgets hold.
    ///
    /// Returns `None` when the node is not eligible, otherwise the evicted
    /// nodes so the tree can clear their membership.
    pub fn link(&mut self, node: NodeId, kind: FileType, path: &str) -> Option<Vec<NodeId>> {
        if !self.eligible(kind, path) {
            return None;
        }

        let mut evicted = Vec::new();
        while !self.entries.is_empty()
            && (self.entries.len() + 1 > self.config.max_entries
                || self.bytes + path.len() > self.config.max_bytes)
        {
            let Some((key, victim)) = self.entries.pop_lru() else {
                break;
            };
            self.bytes -= key.path.len();
            trace!(path = %key.path, "name cache eviction");
            evicted.push(victim);
        }

        let key = CacheKey::new(path);
        self.bytes += key.path.len();
        if let Some((old, _)) = self.entries.push(key, node) {
            self.bytes -= old.path.len();
        }
        Some(evicted)
    }

    /// Find and promote the entry for `path`.
    pub fn lookup(&mut self, path: &str) -> Option<NodeId> {
        self.entries.get(&CacheKey::new(path)).copied()
    }

    /// Drop the entry for `path`, if any.
    pub fn unlink(&mut self, path: &str) -> Option<NodeId> {
        let key = CacheKey::new(path);
        let node = self.entries.pop(&key)?;
        self.bytes -= key.path.len();
        Some(node)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of cached path lengths.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_entries: usize, max_bytes: usize) -> NameCache {
        NameCache::new(NameCacheConfig {
            max_bytes,
            max_entries,
            max_path: 64,
        })
    }

    #[test]
    fn test_lookup_after_link() {
        let mut c = cache(8, 1024);
        assert_eq!(c.link(NodeId(1), FileType::Regular, "/a"), Some(vec![]));
        assert_eq!(c.lookup("/a"), Some(NodeId(1)));
        assert_eq!(c.lookup("/b"), None);
        assert_eq!(c.bytes(), 2);
    }

    #[test]
    fn test_ineligible() {
        let mut c = cache(8, 1024);
        assert_eq!(c.link(NodeId(1), FileType::Symlink, "/l"), None);
        let long = format!("/{}", "x".repeat(70));
        assert_eq!(c.link(NodeId(2), FileType::Regular, &long), None);
        assert!(c.is_empty());
    }

    #[test]
    fn test_entry_budget_evicts_lru() {
        let mut c = cache(2, 1024);
        c.link(NodeId(1), FileType::Regular, "/a");
        c.link(NodeId(2), FileType::Regular, "/b");
        // Touch /a so /b becomes least recently used.
        assert_eq!(c.lookup("/a"), Some(NodeId(1)));

        let evicted = c.link(NodeId(3), FileType::Directory, "/c").unwrap();
        assert_eq!(evicted, vec![NodeId(2)]);
        assert_eq!(c.len(), 2);
        assert_eq!(c.lookup("/b"), None);
    }

    #[test]
    fn test_byte_budget() {
        let mut c = cache(100, 10);
        c.link(NodeId(1), FileType::Regular, "/aaaa");
        c.link(NodeId(2), FileType::Regular, "/bbbb");
        assert_eq!(c.bytes(), 10);

        let evicted = c.link(NodeId(3), FileType::Regular, "/cc").unwrap();
        assert_eq!(evicted, vec![NodeId(1)]);
        assert!(c.bytes() <= 10);
    }

    #[test]
    fn test_budgets_never_exceeded() {
        let mut c = cache(5, 40);
        for i in 0..50u64 {
            c.link(NodeId(i), FileType::Regular, &format!("/file{i}"));
            assert!(c.len() <= 5);
            assert!(c.bytes() <= 40);
        }
    }

    #[test]
    fn test_unlink_idempotent() {
        let mut c = cache(8, 1024);
        c.link(NodeId(1), FileType::Regular, "/a");
        assert_eq!(c.unlink("/a"), Some(NodeId(1)));
        assert_eq!(c.unlink("/a"), None);
        assert_eq!(c.bytes(), 0);
    }
}
