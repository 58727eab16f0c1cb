//! Wildcard expansion over the VFS.
//!
//! Each pattern component is matched with [`glob::Pattern`] against a
//! directory listing read through the facade, so one pattern can walk from
//! the host into mounts and archives.

use glob::{MatchOptions, Pattern};
use tracing::debug;

use crate::context::VfsContext;
use crate::error::{VfsError, VfsResult};
use crate::path::join;

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

fn is_wild(component: &str) -> bool {
    component.contains(['*', '?', '['])
}

/// Every existing path matching `pattern`, sorted.
pub fn expand(ctx: &mut VfsContext, pattern: &str) -> VfsResult<Vec<String>> {
    let canonical = ctx.canonical(pattern)?;
    let components: Vec<&str> = canonical.split('/').filter(|c| !c.is_empty()).collect();

    let mut candidates = vec!["/".to_string()];
    for (i, component) in components.iter().enumerate() {
        let last = i + 1 == components.len();
        let mut next = Vec::new();

        if is_wild(component) {
            let matcher = Pattern::new(component).map_err(|e| {
                VfsError::invalid_argument(format!("bad pattern {component:?}: {e}"))
            })?;
            for dir in &candidates {
                for name in list(ctx, dir) {
                    if !matcher.matches_with(&name, MATCH) {
                        continue;
                    }
                    let path = join(dir, &name);
                    // Only directories can hold the rest of the pattern.
                    if last || ctx.stat(&path).is_ok_and(|attr| attr.is_dir()) {
                        next.push(path);
                    }
                }
            }
        } else {
            for dir in &candidates {
                let path = join(dir, component);
                if !last || ctx.lstat(&path).is_ok() {
                    next.push(path);
                }
            }
        }

        candidates = next;
        if candidates.is_empty() {
            break;
        }
    }

    candidates.sort();
    candidates.dedup();
    Ok(candidates)
}

/// Names in `dir`; an unreadable directory lists as empty.
fn list(ctx: &mut VfsContext, dir: &str) -> Vec<String> {
    let handle = match ctx.opendir(dir) {
        Ok(handle) => handle,
        Err(e) => {
            debug!(dir, error = %e, "glob skipping directory");
            return Vec::new();
        }
    };

    let mut names = Vec::new();
    loop {
        match ctx.readdir(handle) {
            Ok(Some(entry)) => names.push(entry.name),
            Ok(None) => break,
            Err(e) => {
                debug!(dir, error = %e, "glob listing cut short");
                break;
            }
        }
    }
    if let Err(e) = ctx.closedir(handle) {
        debug!(dir, error = %e, "closedir failed");
    }
    names
}
