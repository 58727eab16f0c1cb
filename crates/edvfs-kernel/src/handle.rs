//! Open handle table.

use std::collections::BTreeMap;

use crate::error::{VfsError, VfsResult};
use crate::mount::MountId;
use crate::ops::{OpenDir, OpenFile};

/// Handle identifier handed to callers. Issued in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub i32);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
pub enum HandleKind {
    File(OpenFile),
    Dir(OpenDir),
}

#[derive(Debug)]
pub struct Handle {
    pub id: HandleId,
    pub mount: MountId,
    pub kind: HandleKind,
    /// errno of the last failed operation on this handle, 0 if none.
    pub last_error: i32,
}

impl Handle {
    pub fn file_mut(&mut self) -> VfsResult<&mut OpenFile> {
        match &mut self.kind {
            HandleKind::File(f) => Ok(f),
            HandleKind::Dir(_) => Err(VfsError::BadHandle(self.id.0)),
        }
    }

    pub fn dir_mut(&mut self) -> VfsResult<&mut OpenDir> {
        match &mut self.kind {
            HandleKind::Dir(d) => Ok(d),
            HandleKind::File(_) => Err(VfsError::BadHandle(self.id.0)),
        }
    }
}

/// All open handles.
///
/// The most recently used handle sits in `hot` rather than the map, so a
/// run of reads on one handle never touches the index.
#[derive(Debug)]
pub struct HandleTable {
    handles: BTreeMap<HandleId, Handle>,
    hot: Option<Handle>,
    next_id: i32,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self {
            handles: BTreeMap::new(),
            hot: None,
            next_id: 1,
        }
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new handle and return its id.
    pub fn insert(&mut self, mount: MountId, kind: HandleKind) -> VfsResult<HandleId> {
        let id = HandleId(self.next_id);
        self.next_id = self.next_id.checked_add(1).ok_or(VfsError::TooManyHandles)?;
        self.handles.insert(
            id,
            Handle {
                id,
                mount,
                kind,
                last_error: 0,
            },
        );
        Ok(id)
    }

    pub fn get_mut(&mut self, id: HandleId) -> VfsResult<&mut Handle> {
        let is_hot = self.hot.as_ref().is_some_and(|h| h.id == id);
        if !is_hot {
            let handle = self.handles.remove(&id).ok_or(VfsError::BadHandle(id.0))?;
            if let Some(previous) = self.hot.replace(handle) {
                self.handles.insert(previous.id, previous);
            }
        }
        self.hot.as_mut().ok_or(VfsError::BadHandle(id.0))
    }

    pub fn get(&self, id: HandleId) -> VfsResult<&Handle> {
        match &self.hot {
            Some(h) if h.id == id => Ok(h),
            _ => self.handles.get(&id).ok_or(VfsError::BadHandle(id.0)),
        }
    }

    pub fn remove(&mut self, id: HandleId) -> VfsResult<Handle> {
        if self.hot.as_ref().is_some_and(|h| h.id == id) {
            return self.hot.take().ok_or(VfsError::BadHandle(id.0));
        }
        self.handles.remove(&id).ok_or(VfsError::BadHandle(id.0))
    }

    /// Every open id, in issue order.
    pub fn ids(&self) -> Vec<HandleId> {
        let mut ids: Vec<_> = self.handles.keys().copied().chain(self.hot.as_ref().map(|h| h.id)).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.handles.len() + usize::from(self.hot.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
