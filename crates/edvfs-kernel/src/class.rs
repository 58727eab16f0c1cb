//! Backend class registry.
//!
//! A class is a named backend implementation addressed by a short prefix.
//! The prefix is what appears after `#` in auto-mount paths and what
//! `mount()` takes as its backend name.

use tracing::{debug, warn};

use crate::config::VfsConfig;
use crate::error::{VfsError, VfsResult};
use crate::ops::VfsOps;

/// Creates backend instances for one class.
pub trait BackendFactory {
    /// Runs once at registration. An error aborts the registration.
    fn initialise(&mut self) -> VfsResult<()> {
        Ok(())
    }

    /// Runs once when the class is unregistered.
    fn shutdown(&mut self) {}

    /// A fresh, unmounted backend.
    fn instantiate(&self, config: &VfsConfig) -> VfsResult<Box<dyn VfsOps>>;

    /// The mount argument names a VFS path that must be turned into a host
    /// path before the backend sees it.
    fn resolves_argument(&self) -> bool {
        false
    }
}

/// A registered class.
pub struct BackendClass {
    pub name: String,
    pub prefix: String,
    pub factory: Box<dyn BackendFactory>,
    /// Live mounts of this class.
    pub refs: usize,
}

impl std::fmt::Debug for BackendClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClass")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("refs", &self.refs)
            .finish()
    }
}

/// All registered classes, in registration order.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: Vec<BackendClass>,
}

/// Empty (root only) or at least three characters, alphabetic first,
/// alphanumeric throughout.
fn valid_prefix(prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    let mut chars = prefix.chars();
    prefix.len() >= 3
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric())
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class and run its `initialise` hook.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        prefix: impl Into<String>,
        factory: Box<dyn BackendFactory>,
    ) -> VfsResult<()> {
        let name = name.into();
        let prefix = prefix.into();

        if name.is_empty() || !valid_prefix(&prefix) {
            return Err(VfsError::invalid_argument(format!(
                "bad backend class name/prefix: {name:?}/{prefix:?}"
            )));
        }
        if self.get(&prefix).is_some() {
            return Err(VfsError::already_exists(format!("backend class {prefix:?}")));
        }

        self.classes.push(BackendClass {
            name,
            prefix,
            factory,
            refs: 0,
        });

        let idx = self.classes.len() - 1;
        if let Err(e) = self.classes[idx].factory.initialise() {
            let class = self.classes.remove(idx);
            warn!(class = %class.name, error = %e, "backend class failed to initialise");
            return Err(e);
        }

        debug!(class = %self.classes[idx].name, prefix = %self.classes[idx].prefix, "registered backend class");
        Ok(())
    }

    /// Exact prefix match.
    pub fn get(&self, prefix: &str) -> Option<&BackendClass> {
        self.classes.iter().find(|c| c.prefix == prefix)
    }

    pub fn get_mut(&mut self, prefix: &str) -> Option<&mut BackendClass> {
        self.classes.iter_mut().find(|c| c.prefix == prefix)
    }

    /// True for registered, non-root prefixes (the ones valid after `#`).
    pub fn is_mountable_prefix(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.get(prefix).is_some()
    }

    /// Remove an unused class.
    pub fn unregister(&mut self, prefix: &str) -> VfsResult<()> {
        if prefix.is_empty() {
            return Err(VfsError::permission_denied("root backend class"));
        }
        let idx = self
            .classes
            .iter()
            .position(|c| c.prefix == prefix)
            .ok_or_else(|| VfsError::NoDevice(prefix.to_string()))?;
        if self.classes[idx].refs > 0 {
            return Err(VfsError::busy(format!("backend class {prefix:?}")));
        }

        let mut class = self.classes.remove(idx);
        class.factory.shutdown();
        debug!(class = %class.name, "unregistered backend class");
        Ok(())
    }

    /// Unregister everything but the root class, newest first.
    pub fn shutdown(&mut self) {
        let mut idx = self.classes.len();
        while idx > 0 {
            idx -= 1;
            if self.classes[idx].prefix.is_empty() {
                continue;
            }
            let mut class = self.classes.remove(idx);
            if class.refs > 0 {
                warn!(class = %class.name, refs = class.refs, "shutting down class with live mounts");
            }
            class.factory.shutdown();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendClass> {
        self.classes.iter()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
