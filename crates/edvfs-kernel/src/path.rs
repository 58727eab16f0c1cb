//! Lexical path handling.
//!
//! Paths inside the VFS are plain `/`-separated strings. Canonicalization is
//! purely lexical: it never touches a backend, so `..` cancels the previous
//! component even when that component is a symlink.

use std::hash::{DefaultHasher, Hash, Hasher};

use crate::error::{VfsError, VfsResult};

/// Length limits applied while walking paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathLimits {
    /// Longest single component.
    pub name_max: usize,
    /// Longest whole path.
    pub path_max: usize,
}

impl Default for PathLimits {
    fn default() -> Self {
        Self {
            name_max: 255,
            path_max: 4096,
        }
    }
}

/// Canonicalize `path` against `cwd`.
///
/// Relative paths are joined onto `cwd`. Empty and `.` components are
/// dropped, `..` pops the previous component (and stays put at `/`). The
/// result always starts with `/` and never ends with one, except for the
/// root itself.
pub fn canonicalize(cwd: &str, path: &str, limits: PathLimits) -> VfsResult<String> {
    if path.is_empty() {
        return Err(VfsError::not_found(""));
    }

    let mut parts: Vec<&str> = Vec::new();
    let sources: [&str; 2] = if path.starts_with('/') {
        ["", path]
    } else {
        [cwd, path]
    };

    for component in sources.iter().flat_map(|s| s.split('/')) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => {
                if name.len() > limits.name_max {
                    return Err(VfsError::NameTooLong);
                }
                parts.push(name);
            }
        }
    }

    let len = parts.iter().map(|p| p.len() + 1).sum::<usize>().max(1);
    if len > limits.path_max {
        return Err(VfsError::NameTooLong);
    }

    let mut out = String::with_capacity(len);
    for part in &parts {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// True if `path` is already in the form [`canonicalize`] produces.
pub fn is_canonical(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    path.starts_with('/')
        && path[1..]
            .split('/')
            .all(|c| !c.is_empty() && c != "." && c != "..")
}

/// Directory part of a canonical path. The parent of `/` is `/`.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last component of a canonical path (empty for `/`).
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Append `name` to the canonical directory `dir`.
pub fn join(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else if name.is_empty() {
        dir.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// True if `path` equals `prefix` or lies below it, comparing whole
/// components.
pub fn has_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Hash used for names and cache keys.
pub fn hash_name(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(cwd: &str, path: &str) -> String {
        canonicalize(cwd, path, PathLimits::default()).unwrap()
    }

    #[test]
    fn test_canonicalize_lexical() {
        assert_eq!(canon("/", "/a//b/./c/"), "/a/b/c");
        assert_eq!(canon("/", "/a/b/../c"), "/a/c");
        assert_eq!(canon("/", "/../../x"), "/x");
        assert_eq!(canon("/", "/"), "/");
        assert_eq!(canon("/", "/a/.."), "/");
    }

    #[test]
    fn test_canonicalize_relative() {
        assert_eq!(canon("/home/u", "src/main.rs"), "/home/u/src/main.rs");
        assert_eq!(canon("/home/u", "../v"), "/home/v");
        assert_eq!(canon("/home/u", "."), "/home/u");
    }

    #[test]
    fn test_equivalent_paths_agree() {
        let a = canon("/", "/tmp/x.tar#tar/./docs//readme");
        let b = canon("/tmp", "x.tar#tar/docs/sub/../readme");
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonicalize_limits() {
        let limits = PathLimits {
            name_max: 4,
            path_max: 10,
        };
        assert!(matches!(
            canonicalize("/", "/abcde", limits),
            Err(VfsError::NameTooLong)
        ));
        assert!(matches!(
            canonicalize("/", "/abcd/efgh/ij", limits),
            Err(VfsError::NameTooLong)
        ));
        assert_eq!(canonicalize("/", "/abcd/efgh", limits).unwrap(), "/abcd/efgh");
        assert!(matches!(
            canonicalize("/", "", limits),
            Err(VfsError::NotFound(_))
        ));
    }

    #[test]
    fn test_helpers() {
        assert_eq!(parent_dir("/a/b"), "/a");
        assert_eq!(parent_dir("/a"), "/");
        assert_eq!(parent_dir("/"), "/");
        assert_eq!(basename("/a/b"), "b");
        assert_eq!(basename("/"), "");
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert!(has_prefix("/mnt/a/b", "/mnt/a"));
        assert!(has_prefix("/mnt/a", "/mnt/a"));
        assert!(!has_prefix("/mnt/ab", "/mnt/a"));
        assert!(is_canonical("/a/b"));
        assert!(!is_canonical("/a/../b"));
        assert!(!is_canonical("/a//b"));
    }
}
