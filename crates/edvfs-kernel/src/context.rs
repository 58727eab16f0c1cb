//! The VFS facade.
//!
//! [`VfsContext`] owns every registry: backend classes, the mount table and
//! the handle table. Callers work in plain path strings and integer handles.
//! Each call canonicalizes the path against the working directory, routes it
//! to a mount (creating `name#backend` auto-mounts on the way) and invokes
//! the mount's backend.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::os::fd::RawFd;
use std::path::PathBuf;
use tracing::{debug, trace, warn};

use crate::backends::{ArchiveFactory, LocalFactory, RemoteFactory};
use crate::class::{BackendFactory, ClassRegistry};
use crate::config::VfsConfig;
use crate::error::{VfsError, VfsResult};
use crate::handle::{HandleId, HandleKind, HandleTable};
use crate::mount::{Mount, MountId, MountInfo, MountTable, OpStats, VfsOp};
use crate::ops::{OpenFile, VfsOps};
use crate::path::{basename, canonicalize, join, parent_dir};
use crate::types::{
    AccessMode, DirEntry, FileAttr, FileType, IoctlRequest, MountFlags, OpenFlags, UnmountFlags,
};

/// Prefix of the class serving `/`.
const ROOT_CLASS: &str = "";

/// Flags a caller may pass to [`VfsContext::mount`].
const CALLER_FLAGS: MountFlags = MountFlags::READ_ONLY
    .union(MountFlags::VIRTUAL)
    .union(MountFlags::AUTO);

/// One virtual filesystem: classes, mounts, open handles and a working
/// directory.
pub struct VfsContext {
    config: VfsConfig,
    classes: ClassRegistry,
    mounts: MountTable,
    handles: HandleTable,
    cwd: String,
    initial_cwd: String,
    root: Option<MountId>,
    /// Auto-mount points that failed, with the mount table edit sequence
    /// at the time. Retried once the table changes.
    failed_auto: HashMap<String, u64>,
    shut_down: bool,
}

impl std::fmt::Debug for VfsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsContext")
            .field("cwd", &self.cwd)
            .field("classes", &self.classes.len())
            .field("mounts", &self.mounts.len())
            .field("handles", &self.handles.len())
            .finish()
    }
}

impl VfsContext {
    /// Register the built-in classes, mount the host filesystem at `/` and
    /// apply the configured startup mounts.
    pub fn init(config: VfsConfig) -> VfsResult<Self> {
        config
            .validate()
            .map_err(|e| VfsError::invalid_argument(e.to_string()))?;

        let cwd = std::env::current_dir()
            .ok()
            .and_then(|dir| dir.to_str().map(str::to_string))
            .and_then(|dir| canonicalize("/", &dir, config.path_limits()).ok())
            .unwrap_or_else(|| "/".to_string());

        let mut ctx = Self {
            config,
            classes: ClassRegistry::new(),
            mounts: MountTable::new(),
            handles: HandleTable::new(),
            cwd: cwd.clone(),
            initial_cwd: cwd,
            root: None,
            failed_auto: HashMap::new(),
            shut_down: false,
        };

        ctx.classes.register("root", ROOT_CLASS, Box::new(LocalFactory))?;
        ctx.classes.register("local", "local", Box::new(LocalFactory))?;
        ctx.classes.register("tar", "tar", Box::new(ArchiveFactory))?;
        ctx.classes.register("ftp", "ftp", Box::new(RemoteFactory::new()))?;
        ctx.classes.register("http", "http", Box::new(RemoteFactory::new()))?;

        let root = ctx.attach("/", MountFlags::FULL_PATH, ROOT_CLASS, "", None)?;
        ctx.root = Some(root);

        for mount in ctx.config.mounts.clone() {
            let mut flags = MountFlags::empty();
            flags.set(MountFlags::READ_ONLY, mount.read_only);
            flags.set(MountFlags::VIRTUAL, mount.virtual_point);
            ctx.mount(&mount.point, flags, &mount.backend, &mount.argument)?;
        }

        debug!(mounts = ctx.mounts.len(), cwd = %ctx.cwd, "vfs initialised");
        Ok(ctx)
    }

    /// Close every handle, unmount everything (newest first) and drop all
    /// classes but the root. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        for id in self.handles.ids() {
            if let Err(e) = self.close_handle(id) {
                warn!(handle = %id, error = %e, "close at shutdown failed");
            }
        }

        let ids: Vec<MountId> = self.mounts.iter().rev().map(|m| m.id).collect();
        for id in ids {
            if let Err(e) = self.release(id) {
                warn!(mount = id.0, error = %e, "unmount at shutdown failed");
            }
        }

        self.classes.shutdown();
        debug!("vfs shut down");
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    // ========================================================================
    // Classes and mounts
    // ========================================================================

    /// Add a backend class, e.g. a remote class with a real transport.
    pub fn register_class(
        &mut self,
        name: &str,
        prefix: &str,
        factory: Box<dyn BackendFactory>,
    ) -> VfsResult<()> {
        self.classes.register(name, prefix, factory)
    }

    /// Remove a class with no live mounts.
    pub fn unregister_class(&mut self, prefix: &str) -> VfsResult<()> {
        self.classes.unregister(prefix)
    }

    /// Mount `backend` at `point`.
    ///
    /// Unless the mount is virtual or automatic, the point must already be
    /// reachable through the mount that currently serves it. Arguments of
    /// classes that take a file (tar) are VFS paths, turned into host paths
    /// here, so an archive inside another mount can itself be mounted.
    #[tracing::instrument(skip(self), name = "vfs.mount")]
    pub fn mount(
        &mut self,
        point: &str,
        flags: MountFlags,
        backend: &str,
        argument: &str,
    ) -> VfsResult<MountInfo> {
        if backend.is_empty() {
            return Err(VfsError::invalid_argument("empty backend name"));
        }
        let point = self.canonical(point)?;
        if self.mounts.find_exact(&point).is_some() {
            return Err(VfsError::already_exists(point));
        }
        let resolves_argument = self
            .classes
            .get(backend)
            .ok_or_else(|| VfsError::NoDevice(backend.to_string()))?
            .factory
            .resolves_argument();

        if !flags.intersects(MountFlags::VIRTUAL | MountFlags::AUTO) {
            self.access(&point, AccessMode::empty())?;
        }

        let argument = if resolves_argument && !argument.is_empty() {
            let host = self.real_path(argument)?;
            host.to_str()
                .map(str::to_string)
                .ok_or_else(|| VfsError::invalid_argument(format!("non UTF-8 path {}", host.display())))?
        } else {
            argument.to_string()
        };

        let (parent, _) = self
            .mounts
            .resolve(&point)
            .ok_or_else(|| VfsError::no_mount_point(&point))?;
        let id = self.attach(&point, flags & CALLER_FLAGS, backend, &argument, Some(parent))?;
        self.mounts
            .get(id)
            .map(Mount::info)
            .ok_or_else(|| VfsError::no_mount_point(point))
    }

    /// Unmount the mount at exactly `point`.
    ///
    /// Fails with `EBUSY` while handles are open on it, and while other
    /// mounts hang off it unless [`UnmountFlags::DETACH_CHILDREN`] is given.
    #[tracing::instrument(skip(self), name = "vfs.unmount")]
    pub fn unmount(&mut self, point: &str, flags: UnmountFlags) -> VfsResult<()> {
        let point = self.canonical(point)?;
        let id = self
            .mounts
            .find_exact(&point)
            .ok_or_else(|| VfsError::no_mount_point(&point))?;
        self.detach(id, flags)
    }

    /// The mount serving `path` and the path as its backend sees it.
    #[tracing::instrument(skip(self), name = "vfs.mount_lookup", level = "trace")]
    pub fn mount_lookup(&mut self, path: &str) -> VfsResult<(MountInfo, String)> {
        let canonical = self.canonical(path)?;
        let (id, relative) = self.route(&canonical)?;
        let info = self
            .mounts
            .get(id)
            .map(Mount::info)
            .ok_or_else(|| VfsError::no_mount_point(&canonical))?;
        Ok((info, relative))
    }

    /// Mounts living directly in directory `dir` carrying any of `flags`
    /// (every mount there when `flags` is empty).
    pub fn mount_list(&self, dir: &str, flags: MountFlags) -> VfsResult<Vec<MountInfo>> {
        let dir = self.canonical(dir)?;
        Ok(self.mounts.list(&dir, flags))
    }

    /// Every mount, in mount order.
    pub fn mounts(&self) -> Vec<MountInfo> {
        self.mounts.iter().map(Mount::info).collect()
    }

    /// Operation counters of the mount at `point`.
    pub fn mount_stats(&self, point: &str) -> VfsResult<OpStats> {
        let point = self.canonical(point)?;
        self.mounts
            .find_exact(&point)
            .and_then(|id| self.mounts.get(id))
            .map(|m| m.stats.clone())
            .ok_or_else(|| VfsError::no_mount_point(point))
    }

    /// Instantiate a backend of class `prefix` and mount it at the canonical
    /// `point`, rolling back if the backend refuses.
    fn attach(
        &mut self,
        point: &str,
        flags: MountFlags,
        prefix: &str,
        argument: &str,
        parent: Option<MountId>,
    ) -> VfsResult<MountId> {
        let class = self
            .classes
            .get_mut(prefix)
            .ok_or_else(|| VfsError::NoDevice(prefix.to_string()))?;
        let backend = class.factory.instantiate(&self.config)?;
        class.refs += 1;

        let id = self.mounts.insert(point, flags, prefix, backend, parent);
        let result = match self.mounts.get_mut(id) {
            Some(mount) => {
                let info = mount.info();
                mount.backend.mount(&info, argument).map(|extra| {
                    mount.flags |= extra;
                })
            }
            None => Err(VfsError::no_mount_point(point)),
        };

        if let Err(e) = result {
            warn!(point, backend = prefix, error = %e, "mount failed, rolled back");
            self.mounts.remove(id);
            self.release_class(prefix);
            return Err(e);
        }

        debug!(point, backend = prefix, argument, mount = id.0, "mounted");
        Ok(id)
    }

    fn detach(&mut self, id: MountId, flags: UnmountFlags) -> VfsResult<()> {
        if Some(id) == self.root {
            return Err(VfsError::permission_denied("cannot unmount /"));
        }
        let mount = self.mounts.get(id).ok_or_else(|| VfsError::no_mount_point(format!("mount {}", id.0)))?;
        if !mount.open.is_empty() {
            return Err(VfsError::busy(format!(
                "{} has {} open handles",
                mount.path,
                mount.open.len()
            )));
        }

        let children = self.mounts.children(id);
        if !children.is_empty() {
            if !flags.contains(UnmountFlags::DETACH_CHILDREN) {
                return Err(VfsError::busy(format!(
                    "{} hosts {} other mounts",
                    mount.path,
                    children.len()
                )));
            }
            for child in children {
                self.detach(child, flags)?;
            }
        }

        self.release(id)
    }

    /// Run the backend's unmount and drop the mount. No busy checks.
    fn release(&mut self, id: MountId) -> VfsResult<()> {
        let mount = self
            .mounts
            .get_mut(id)
            .ok_or_else(|| VfsError::no_mount_point(format!("mount {}", id.0)))?;
        mount.flags |= MountFlags::SHUTTING_DOWN;
        if let Err(e) = mount.backend.unmount() {
            mount.flags.remove(MountFlags::SHUTTING_DOWN);
            return Err(e);
        }

        if let Some(mount) = self.mounts.remove(id) {
            self.release_class(&mount.class);
            debug!(point = %mount.path, backend = %mount.class, "unmounted");
        }
        Ok(())
    }

    fn release_class(&mut self, prefix: &str) {
        if let Some(class) = self.classes.get_mut(prefix) {
            class.refs = class.refs.saturating_sub(1);
        }
    }

    // ========================================================================
    // Routing
    // ========================================================================

    pub(crate) fn canonical(&self, path: &str) -> VfsResult<String> {
        canonicalize(&self.cwd, path, self.config.path_limits())
    }

    fn route(&mut self, canonical: &str) -> VfsResult<(MountId, String)> {
        if self.config.auto_mount && canonical.contains('#') {
            self.auto_mount(canonical);
        }
        self.mounts
            .resolve(canonical)
            .ok_or_else(|| VfsError::no_mount_point(canonical))
    }

    /// Mount every `name#backend` component of `canonical` that is not
    /// mounted yet, outermost first. A failure stops the scan; the path then
    /// resolves through whatever is mounted.
    fn auto_mount(&mut self, canonical: &str) {
        let mut end = 0;
        for component in canonical.split('/') {
            end += component.len() + 1;
            let Some((base, prefix)) = component.rsplit_once('#') else {
                continue;
            };
            if base.is_empty() || !self.classes.is_mountable_prefix(prefix) {
                continue;
            }

            let point = &canonical[..end - 1];
            if self.mounts.find_exact(point).is_some() {
                continue;
            }
            if self.failed_auto.get(point) == Some(&self.mounts.edit_seq()) {
                trace!(point, "auto-mount failed earlier, not retried");
                return;
            }

            let resolves = self
                .classes
                .get(prefix)
                .is_some_and(|class| class.factory.resolves_argument());
            let argument = if resolves {
                &point[..point.len() - prefix.len() - 1]
            } else {
                base
            };

            debug!(point, backend = prefix, argument, "auto-mount");
            if let Err(e) = self.mount(point, MountFlags::AUTO, prefix, argument) {
                warn!(point, backend = prefix, error = %e, "auto-mount failed");
                let seq = self.mounts.edit_seq();
                self.failed_auto.retain(|_, at| *at == seq);
                self.failed_auto.insert(point.to_string(), seq);
                return;
            }
        }
    }

    fn dispatch<T>(
        &mut self,
        op: VfsOp,
        path: &str,
        f: impl FnMut(&mut dyn VfsOps, &str) -> VfsResult<T>,
    ) -> VfsResult<(MountId, T)> {
        self.dispatch_routed(op, path, f)
            .map(|(id, _, value)| (id, value))
    }

    /// Route `path` and run `f` on the backend, counting `op` against the
    /// mount. A `..` that climbs out of a backend continues from the
    /// directory holding its mount point; the canonical path finally served
    /// is returned with the result.
    fn dispatch_routed<T>(
        &mut self,
        op: VfsOp,
        path: &str,
        mut f: impl FnMut(&mut dyn VfsOps, &str) -> VfsResult<T>,
    ) -> VfsResult<(MountId, String, T)> {
        let mut path = self.canonical(path)?;
        let mut crossings = 0;

        loop {
            let (id, relative) = self.route(&path)?;
            let limits = self.config.path_limits();
            let mount = self
                .mounts
                .get_mut(id)
                .ok_or_else(|| VfsError::no_mount_point(&path))?;
            mount.stats.bump(op);

            match f(mount.backend.as_mut(), &relative) {
                Err(VfsError::CrossMount { rest }) => {
                    crossings += 1;
                    if crossings > self.config.max_symlinks {
                        return Err(VfsError::TooManySymlinks);
                    }
                    let next = canonicalize("/", &join(parent_dir(&mount.path), &rest), limits)?;
                    trace!(from = %mount.path, to = %next, %op, "crossing out of mount");
                    path = next;
                }
                other => return other.map(|value| (id, path, value)),
            }
        }
    }

    fn call<T>(
        &mut self,
        op: VfsOp,
        path: &str,
        f: impl FnMut(&mut dyn VfsOps, &str) -> VfsResult<T>,
    ) -> VfsResult<T> {
        self.dispatch(op, path, f).map(|(_, value)| value)
    }

    /// Two-path operations must stay on one mount.
    fn dispatch_pair(
        &mut self,
        op: VfsOp,
        from: &str,
        to: &str,
        f: impl FnOnce(&mut dyn VfsOps, &str, &str) -> VfsResult<()>,
    ) -> VfsResult<()> {
        let from = self.canonical(from)?;
        let to = self.canonical(to)?;
        let (from_mount, from_rel) = self.route(&from)?;
        let (to_mount, to_rel) = self.route(&to)?;
        if from_mount != to_mount {
            return Err(VfsError::CrossDeviceLink);
        }

        let mount = self
            .mounts
            .get_mut(from_mount)
            .ok_or_else(|| VfsError::no_mount_point(&from))?;
        mount.stats.bump(op);
        match f(mount.backend.as_mut(), &from_rel, &to_rel) {
            Err(VfsError::CrossMount { .. }) => Err(VfsError::CrossDeviceLink),
            other => other,
        }
    }

    // ========================================================================
    // Handles
    // ========================================================================

    fn register_handle(&mut self, mount: MountId, kind: HandleKind) -> VfsResult<HandleId> {
        let id = self.handles.insert(mount, kind)?;
        if let Some(mount) = self.mounts.get_mut(mount) {
            mount.open.insert(id);
        }
        Ok(id)
    }

    /// Run `f` on an open file handle, recording a failure on the handle.
    fn with_file<T>(
        &mut self,
        id: HandleId,
        op: VfsOp,
        f: impl FnOnce(&mut dyn VfsOps, &mut OpenFile) -> VfsResult<T>,
    ) -> VfsResult<T> {
        let handle = self.handles.get_mut(id)?;
        let mount = self
            .mounts
            .get_mut(handle.mount)
            .ok_or(VfsError::BadHandle(id.0))?;
        mount.stats.bump(op);

        let result = handle
            .file_mut()
            .and_then(|file| f(mount.backend.as_mut(), file));
        if let Err(e) = &result {
            handle.last_error = e.errno();
        }
        result
    }

    #[tracing::instrument(skip(self), name = "vfs.open", level = "debug")]
    pub fn open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<HandleId> {
        let (mount, file) = self.dispatch(VfsOp::Open, path, |b, p| b.open(p, flags, mode))?;
        self.register_handle(mount, HandleKind::File(file))
    }

    pub fn close(&mut self, id: HandleId) -> VfsResult<()> {
        if !matches!(self.handles.get(id)?.kind, HandleKind::File(_)) {
            return Err(VfsError::BadHandle(id.0));
        }
        self.close_handle(id)
    }

    /// Drop any handle, file or directory.
    fn close_handle(&mut self, id: HandleId) -> VfsResult<()> {
        let handle = self.handles.remove(id)?;
        let mount = self
            .mounts
            .get_mut(handle.mount)
            .ok_or(VfsError::BadHandle(id.0))?;
        mount.open.remove(&id);
        match handle.kind {
            HandleKind::File(file) => {
                mount.stats.bump(VfsOp::Close);
                mount.backend.close(file)
            }
            HandleKind::Dir(dir) => {
                mount.stats.bump(VfsOp::Closedir);
                mount.backend.closedir(dir)
            }
        }
    }

    pub fn read(&mut self, id: HandleId, buf: &mut [u8]) -> VfsResult<usize> {
        self.with_file(id, VfsOp::Read, |b, f| b.read(f, buf))
    }

    pub fn write(&mut self, id: HandleId, buf: &[u8]) -> VfsResult<usize> {
        self.with_file(id, VfsOp::Write, |b, f| b.write(f, buf))
    }

    pub fn seek(&mut self, id: HandleId, pos: SeekFrom) -> VfsResult<u64> {
        self.with_file(id, VfsOp::Seek, |b, f| b.seek(f, pos))
    }

    pub fn tell(&mut self, id: HandleId) -> VfsResult<u64> {
        self.with_file(id, VfsOp::Tell, |b, f| b.tell(f))
    }

    pub fn ioctl(&mut self, id: HandleId, request: IoctlRequest) -> VfsResult<u64> {
        self.with_file(id, VfsOp::Ioctl, |b, f| b.ioctl(f, request))
    }

    pub fn fileno(&mut self, id: HandleId) -> VfsResult<RawFd> {
        self.with_file(id, VfsOp::Fileno, |b, f| b.fileno(f))
    }

    pub fn fstat(&mut self, id: HandleId) -> VfsResult<FileAttr> {
        self.with_file(id, VfsOp::Fstat, |b, f| b.fstat(f))
    }

    /// errno of the last failed operation on `id`, 0 if none failed.
    pub fn handle_error(&self, id: HandleId) -> VfsResult<i32> {
        Ok(self.handles.get(id)?.last_error)
    }

    /// Number of open handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    // ========================================================================
    // Directories
    // ========================================================================

    #[tracing::instrument(skip(self), name = "vfs.opendir", level = "debug")]
    pub fn opendir(&mut self, path: &str) -> VfsResult<HandleId> {
        let (mount, vfs_path, mut dir) =
            self.dispatch_routed(VfsOp::Opendir, path, |b, p| b.opendir(p))?;
        dir.vfs_path = vfs_path;
        self.register_handle(mount, HandleKind::Dir(dir))
    }

    /// Next entry. Once the backend's listing runs dry, virtual mount points
    /// living in the directory follow, refreshed whenever the mount table
    /// has changed since they were last collected.
    pub fn readdir(&mut self, id: HandleId) -> VfsResult<Option<DirEntry>> {
        let seq = self.mounts.edit_seq();
        let handle = self.handles.get_mut(id)?;
        let mount_id = handle.mount;

        let result = match handle.dir_mut() {
            Err(e) => Err(e),
            Ok(dir) => match self.mounts.get_mut(mount_id) {
                None => Err(VfsError::BadHandle(id.0)),
                Some(mount) => {
                    mount.stats.bump(VfsOp::Readdir);
                    mount.backend.readdir(dir).map(|entry| {
                        if let Some(entry) = &entry {
                            if dir.splice_mounts {
                                dir.seen.insert(entry.name.clone());
                            }
                        }
                        entry
                    })
                }
            },
        };

        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                handle.last_error = e.errno();
                return Err(e);
            }
        };
        if entry.is_some() {
            return Ok(entry);
        }

        let dir = handle.dir_mut()?;
        if !dir.splice_mounts {
            return Ok(None);
        }
        if dir.mount_seq != Some(seq) {
            dir.virtuals = self
                .mounts
                .list(&dir.vfs_path, MountFlags::VIRTUAL)
                .iter()
                .map(|m| DirEntry::new(basename(&m.path), FileType::Directory))
                .collect();
            dir.mount_seq = Some(seq);
        }
        while let Some(entry) = dir.virtuals.pop_front() {
            if dir.seen.insert(entry.name.clone()) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub fn closedir(&mut self, id: HandleId) -> VfsResult<()> {
        if !matches!(self.handles.get(id)?.kind, HandleKind::Dir(_)) {
            return Err(VfsError::BadHandle(id.0));
        }
        self.close_handle(id)
    }

    // ========================================================================
    // Paths
    // ========================================================================

    pub fn access(&mut self, path: &str, mode: AccessMode) -> VfsResult<()> {
        self.call(VfsOp::Access, path, |b, p| b.access(p, mode))
    }

    pub fn stat(&mut self, path: &str) -> VfsResult<FileAttr> {
        self.call(VfsOp::Stat, path, |b, p| b.stat(p))
    }

    pub fn lstat(&mut self, path: &str) -> VfsResult<FileAttr> {
        self.call(VfsOp::Lstat, path, |b, p| b.lstat(p))
    }

    pub fn chmod(&mut self, path: &str, mode: u32) -> VfsResult<()> {
        self.call(VfsOp::Chmod, path, |b, p| b.chmod(p, mode))
    }

    pub fn chown(&mut self, path: &str, uid: Option<u32>, gid: Option<u32>) -> VfsResult<()> {
        self.call(VfsOp::Chown, path, |b, p| b.chown(p, uid, gid))
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> VfsResult<()> {
        self.call(VfsOp::Mkdir, path, |b, p| b.mkdir(p, mode))
    }

    pub fn rmdir(&mut self, path: &str) -> VfsResult<()> {
        self.call(VfsOp::Rmdir, path, |b, p| b.rmdir(p))
    }

    pub fn readlink(&mut self, path: &str) -> VfsResult<String> {
        self.call(VfsOp::Readlink, path, |b, p| b.readlink(p))
    }

    /// Create a symlink at `path`. `target` is stored as given.
    pub fn symlink(&mut self, target: &str, path: &str) -> VfsResult<()> {
        self.call(VfsOp::Symlink, path, |b, p| b.symlink(target, p))
    }

    pub fn link(&mut self, old: &str, new: &str) -> VfsResult<()> {
        self.dispatch_pair(VfsOp::Link, old, new, |b, from, to| b.link(from, to))
    }

    pub fn unlink(&mut self, path: &str) -> VfsResult<()> {
        self.call(VfsOp::Unlink, path, |b, p| b.unlink(p))
    }

    pub fn remove(&mut self, path: &str) -> VfsResult<()> {
        self.call(VfsOp::Remove, path, |b, p| b.remove(p))
    }

    pub fn rename(&mut self, from: &str, to: &str) -> VfsResult<()> {
        self.dispatch_pair(VfsOp::Rename, from, to, |b, from, to| b.rename(from, to))
    }

    pub fn mknod(&mut self, path: &str, kind: FileType, mode: u32, dev: u64) -> VfsResult<()> {
        self.call(VfsOp::Mknod, path, |b, p| b.mknod(p, kind, mode, dev))
    }

    /// Host path holding the bytes of `path`.
    pub fn real_path(&mut self, path: &str) -> VfsResult<PathBuf> {
        self.call(VfsOp::RealPath, path, |b, p| b.real_path(p))
    }

    /// Expand a wildcard pattern across every mount it touches.
    #[tracing::instrument(skip(self), name = "vfs.glob")]
    pub fn glob(&mut self, pattern: &str) -> VfsResult<Vec<String>> {
        crate::wildcard::expand(self, pattern)
    }

    // ========================================================================
    // Working directory
    // ========================================================================

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Back to the directory the context started in.
    pub fn reset_cwd(&mut self) {
        self.cwd = self.initial_cwd.clone();
    }

    pub fn chdir(&mut self, path: &str) -> VfsResult<()> {
        let target = self.canonical(path)?;
        self.call(VfsOp::Chdir, &target, |b, p| b.chdir(p))?;
        self.cwd = target;
        Ok(())
    }
}

impl Drop for VfsContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(temp: &TempDir) -> VfsContext {
        VfsContext::init(VfsConfig {
            temp_dir: Some(temp.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap()
    }

    fn dir_path(temp: &TempDir) -> String {
        dunce::canonicalize(temp.path())
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_init_mounts_root() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);

        let mounts = ctx.mounts();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].path, "/");
        assert!(mounts[0].flags.contains(MountFlags::FULL_PATH));
        assert_eq!(ctx.classes().len(), 5);
        assert!(ctx.classes().get("tar").is_some());
    }

    #[test]
    fn test_mount_errors() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let dir = dir_path(&temp);

        assert!(matches!(
            ctx.mount("/x", MountFlags::empty(), "", ""),
            Err(VfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            ctx.mount("/", MountFlags::empty(), "local", ""),
            Err(VfsError::AlreadyExists(_))
        ));
        assert!(matches!(
            ctx.mount(&dir, MountFlags::empty(), "nope", ""),
            Err(VfsError::NoDevice(_))
        ));
        assert!(matches!(
            ctx.mount(&format!("{dir}/missing"), MountFlags::empty(), "local", &dir),
            Err(VfsError::Io(_))
        ));
        assert!(matches!(
            ctx.unmount("/", UnmountFlags::empty()),
            Err(VfsError::PermissionDenied(_))
        ));
        assert!(matches!(
            ctx.unmount(&dir, UnmountFlags::empty()),
            Err(VfsError::NoMountPoint(_))
        ));
    }

    #[test]
    fn test_failed_backend_mount_rolls_back() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let dir = dir_path(&temp);
        std::fs::write(temp.path().join("plain"), "x").unwrap();

        // The point exists, the argument is not a directory.
        let err = ctx
            .mount(&dir, MountFlags::empty(), "local", &format!("{dir}/plain"))
            .unwrap_err();
        assert!(matches!(err, VfsError::NotADirectory(_)));
        assert_eq!(ctx.mounts().len(), 1);
        assert_eq!(ctx.classes().get("local").unwrap().refs, 0);
    }

    #[test]
    fn test_failed_auto_mount_not_retried_until_table_changes() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let dir = dir_path(&temp);
        let missing = format!("{dir}/missing.tar#tar/readme.txt");
        let real_path_calls = |ctx: &VfsContext| ctx.mount_stats("/").unwrap().get(VfsOp::RealPath);

        assert!(ctx.stat(&missing).is_err());
        assert_eq!(real_path_calls(&ctx), 1);
        assert!(ctx.stat(&missing).is_err());
        assert!(ctx.open(&missing, OpenFlags::read(), 0).is_err());
        assert_eq!(real_path_calls(&ctx), 1);

        std::fs::create_dir(temp.path().join("point")).unwrap();
        ctx.mount(&format!("{dir}/point"), MountFlags::empty(), "local", &dir)
            .unwrap();
        assert!(ctx.stat(&missing).is_err());
        assert_eq!(real_path_calls(&ctx), 2);
    }

    #[test]
    fn test_opendir_across_mount_lists_virtuals_of_target() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let dir = dir_path(&temp);

        let mut builder = tar::Builder::new(std::fs::File::create(temp.path().join("up.tar")).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, "host", "..").unwrap();
        builder.into_inner().unwrap();

        std::fs::create_dir(temp.path().join("shared")).unwrap();
        ctx.mount(&format!("{dir}/virt"), MountFlags::VIRTUAL, "local", &format!("{dir}/shared"))
            .unwrap();

        let handle = ctx.opendir(&format!("{dir}/up.tar#tar/host")).unwrap();
        let mut names = Vec::new();
        while let Some(entry) = ctx.readdir(handle).unwrap() {
            names.push(entry.name);
        }
        ctx.closedir(handle).unwrap();

        assert!(names.contains(&"up.tar".to_string()));
        assert_eq!(names.iter().filter(|n| *n == "virt").count(), 1);
    }

    #[test]
    fn test_local_mount_routes_relative_paths() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let dir = dir_path(&temp);
        std::fs::create_dir(temp.path().join("host")).unwrap();
        std::fs::create_dir(temp.path().join("point")).unwrap();
        std::fs::write(temp.path().join("host/hello.txt"), "hi").unwrap();

        let info = ctx
            .mount(&format!("{dir}/point"), MountFlags::empty(), "local", &format!("{dir}/host"))
            .unwrap();
        assert_eq!(info.parent, ctx.mounts().first().map(|m| m.id));
        assert_eq!(ctx.classes().get("local").unwrap().refs, 1);

        let (mount, relative) = ctx.mount_lookup(&format!("{dir}/point/./sub/../hello.txt")).unwrap();
        assert_eq!(mount.path, format!("{dir}/point"));
        assert_eq!(relative, "/hello.txt");

        let handle = ctx.open(&format!("{dir}/point/hello.txt"), OpenFlags::read(), 0).unwrap();
        let mut buf = [0u8; 8];
        let n = ctx.read(handle, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(ctx.ioctl(handle, IoctlRequest::BytesReadable).unwrap(), 0);
        assert_eq!(ctx.tell(handle).unwrap(), 2);
        ctx.close(handle).unwrap();

        let stats = ctx.mount_stats(&format!("{dir}/point")).unwrap();
        assert_eq!(stats.get(VfsOp::Open), 1);
        assert_eq!(stats.get(VfsOp::Read), 1);
        assert_eq!(stats.get(VfsOp::Close), 1);
    }

    #[test]
    fn test_handle_errors() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let dir = dir_path(&temp);
        std::fs::write(temp.path().join("f"), "data").unwrap();

        let handle = ctx.open(&format!("{dir}/f"), OpenFlags::read(), 0).unwrap();
        assert_eq!(ctx.handle_error(handle).unwrap(), 0);
        assert!(ctx.write(handle, b"nope").is_err());
        assert_ne!(ctx.handle_error(handle).unwrap(), 0);

        assert!(matches!(ctx.closedir(handle), Err(VfsError::BadHandle(_))));
        ctx.close(handle).unwrap();
        assert!(matches!(ctx.close(handle), Err(VfsError::BadHandle(_))));
        assert!(matches!(ctx.handle_error(handle), Err(VfsError::BadHandle(_))));
    }

    #[test]
    fn test_readdir_splices_virtual_mounts() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let dir = dir_path(&temp);
        std::fs::write(temp.path().join("real.txt"), "").unwrap();

        ctx.mount(&format!("{dir}/ghost"), MountFlags::VIRTUAL, "local", &dir)
            .unwrap();

        let handle = ctx.opendir(&dir).unwrap();
        let mut names = Vec::new();
        while let Some(entry) = ctx.readdir(handle).unwrap() {
            names.push(entry.name);
        }
        ctx.closedir(handle).unwrap();
        assert_eq!(names, ["real.txt", "ghost"]);

        // Reachable through the mount itself.
        let handle = ctx.open(&format!("{dir}/ghost/real.txt"), OpenFlags::read(), 0).unwrap();
        assert!(ctx.fileno(handle).unwrap() >= 0);
        assert_eq!(ctx.fstat(handle).unwrap().size, 0);
        ctx.close(handle).unwrap();
    }

    #[test]
    fn test_chdir_and_reset() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let dir = dir_path(&temp);
        let start = ctx.cwd().to_string();
        std::fs::write(temp.path().join("file"), "abc").unwrap();

        ctx.chdir(&dir).unwrap();
        assert_eq!(ctx.cwd(), dir);
        assert_eq!(ctx.stat("file").unwrap().size, 3);
        assert!(matches!(ctx.chdir("file"), Err(VfsError::NotADirectory(_))));

        ctx.reset_cwd();
        assert_eq!(ctx.cwd(), start);
    }

    #[test]
    fn test_path_operations_on_host() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let dir = dir_path(&temp);

        ctx.mkdir(&format!("{dir}/d"), 0o755).unwrap();
        let handle = ctx
            .open(&format!("{dir}/d/new.txt"), OpenFlags::create(), 0o644)
            .unwrap();
        assert_eq!(ctx.write(handle, b"hello").unwrap(), 5);
        ctx.close(handle).unwrap();

        ctx.symlink("new.txt", &format!("{dir}/d/link")).unwrap();
        assert_eq!(ctx.readlink(&format!("{dir}/d/link")).unwrap(), "new.txt");
        assert!(ctx.lstat(&format!("{dir}/d/link")).unwrap().is_symlink());
        assert_eq!(ctx.stat(&format!("{dir}/d/link")).unwrap().size, 5);

        ctx.rename(&format!("{dir}/d/new.txt"), &format!("{dir}/d/moved.txt"))
            .unwrap();
        ctx.chmod(&format!("{dir}/d/moved.txt"), 0o600).unwrap();
        assert_eq!(ctx.stat(&format!("{dir}/d/moved.txt")).unwrap().perm, 0o600);
        ctx.access(&format!("{dir}/d/moved.txt"), AccessMode::READ).unwrap();

        ctx.remove(&format!("{dir}/d/link")).unwrap();
        ctx.unlink(&format!("{dir}/d/moved.txt")).unwrap();
        ctx.rmdir(&format!("{dir}/d")).unwrap();
        assert!(matches!(ctx.stat(&format!("{dir}/d")), Err(VfsError::Io(_))));

        let real = ctx.real_path(&dir).unwrap();
        assert_eq!(real, dunce::canonicalize(temp.path()).unwrap());
    }

    #[test]
    fn test_rename_across_mounts() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let dir = dir_path(&temp);
        std::fs::create_dir(temp.path().join("a")).unwrap();
        std::fs::write(temp.path().join("x"), "").unwrap();

        ctx.mount(&format!("{dir}/a"), MountFlags::empty(), "local", &format!("{dir}/a"))
            .unwrap();
        assert!(matches!(
            ctx.rename(&format!("{dir}/x"), &format!("{dir}/a/x")),
            Err(VfsError::CrossDeviceLink)
        ));
    }

    #[test]
    fn test_shutdown_releases_nested_mounts() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let dir = dir_path(&temp);

        let mut builder = tar::Builder::new(std::fs::File::create(temp.path().join("a.tar")).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        builder.append_data(&mut header, "hi.txt", b"hi".as_slice()).unwrap();
        builder.into_inner().unwrap();

        std::fs::create_dir(temp.path().join("point")).unwrap();
        ctx.mount(&format!("{dir}/point"), MountFlags::empty(), "local", &dir)
            .unwrap();
        let handle = ctx
            .open(&format!("{dir}/point/a.tar#tar/hi.txt"), OpenFlags::read(), 0)
            .unwrap();
        ctx.close(handle).unwrap();
        assert_eq!(ctx.mounts().len(), 3);

        ctx.shutdown();
        assert!(ctx.mounts().is_empty());
        let leftovers = std::fs::read_dir(temp.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with("edvfs"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let dir = dir_path(&temp);
        std::fs::write(temp.path().join("f"), "").unwrap();

        let handle = ctx.open(&format!("{dir}/f"), OpenFlags::read(), 0).unwrap();
        ctx.shutdown();
        assert_eq!(ctx.open_handles(), 0);
        assert!(ctx.mounts().is_empty());
        assert_eq!(ctx.classes().len(), 1);
        assert!(matches!(ctx.read(handle, &mut [0u8; 1]), Err(VfsError::BadHandle(_))));
        ctx.shutdown();
        assert!(ctx.mounts().is_empty());
    }
}
