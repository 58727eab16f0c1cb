//! Tar archive source.
//!
//! The archive is scanned once at mount time. Each member becomes a node;
//! regular members remember where their bytes start in the archive so they
//! can be copied out later without rescanning.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use super::tree::TreeSource;
use crate::error::{VfsError, VfsResult};
use crate::lookup::NodeLookup;
use crate::node::{NodeId, NodeTree};
use crate::types::{FileAttr, FileType, MountFlags};

/// Hard links to hard links are followed this many times.
const MAX_LINK_HOPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Payload {
    /// Member data at `offset`, `len` bytes long.
    Data { offset: u64, len: u64 },
    /// Hard link to another member, by archive path.
    HardLink(String),
}

/// Tree source reading an uncompressed tar file.
#[derive(Debug, Default)]
pub struct TarSource {
    archive: Option<File>,
    payloads: HashMap<NodeId, Payload>,
}

impl TarSource {
    /// Number of members with extractable contents.
    pub fn members(&self) -> usize {
        self.payloads.len()
    }

    fn archive(&self) -> VfsResult<&File> {
        self.archive
            .as_ref()
            .ok_or_else(|| VfsError::other("archive not mounted"))
    }

    /// Find a node by archive path without going through the lookup
    /// engine; member paths never contain symlinks to resolve.
    fn find(tree: &NodeTree, path: &str) -> Option<NodeId> {
        path.split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .try_fold(tree.root(), |dir, name| tree.find_child(dir, name))
    }

    /// A later member with the path of an earlier non-directory takes its
    /// node over, as extraction would overwrite the file. Directories are
    /// never replaced.
    fn replace(&mut self, tree: &mut NodeTree, path: &str, kind: FileType) -> Option<NodeId> {
        let id = Self::find(tree, path)?;
        let existing = tree.get(id)?.kind;
        if existing.is_dir() || kind.is_dir() {
            return None;
        }

        debug!(member = %path, "later archive member replaces earlier one");
        self.payloads.remove(&id);
        tree.cache_unlink(id);
        let node = tree.get_mut(id)?;
        let ino = node.attr.ino;
        node.kind = kind;
        node.target = None;
        node.local = None;
        node.attr = FileAttr::for_kind(kind);
        node.attr.ino = ino;
        tree.cache_link(id);
        Some(id)
    }

    fn copy_out(&self, tree: &NodeTree, node: NodeId, out: &mut File) -> VfsResult<u64> {
        let mut node = node;
        for _ in 0..MAX_LINK_HOPS {
            match self.payloads.get(&node) {
                None => return Ok(0),
                Some(Payload::Data { offset, len }) => {
                    let mut src = self.archive()?;
                    src.seek(SeekFrom::Start(*offset))?;
                    let copied = io::copy(&mut io::Read::take(src, *len), out)?;
                    if copied != *len {
                        return Err(VfsError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("member truncated: {copied} of {len} bytes"),
                        )));
                    }
                    return Ok(copied);
                }
                Some(Payload::HardLink(target)) => {
                    node = Self::find(tree, target).ok_or_else(|| VfsError::not_found(target))?;
                }
            }
        }
        Err(VfsError::TooManySymlinks)
    }
}

fn member_kind(entry_type: tar::EntryType) -> FileType {
    use tar::EntryType;

    match entry_type {
        EntryType::Regular | EntryType::Continuous | EntryType::Link => FileType::Regular,
        EntryType::Directory => FileType::Directory,
        EntryType::Symlink => FileType::Symlink,
        EntryType::Fifo => FileType::Fifo,
        _ => FileType::Unknown,
    }
}

impl NodeLookup for TarSource {}

impl TreeSource for TarSource {
    fn mount_flags(&self) -> MountFlags {
        MountFlags::READ_ONLY | MountFlags::NAME_CACHE
    }

    fn populate(&mut self, tree: &mut NodeTree, argument: &str) -> VfsResult<()> {
        if argument.is_empty() {
            return Err(VfsError::invalid_argument("tar mount needs an archive path"));
        }
        let file = File::open(argument)?;
        let mut archive = tar::Archive::new(&file);

        for entry in archive.entries()? {
            let entry = entry?;
            let header = entry.header();
            let entry_type = header.entry_type();
            if matches!(
                entry_type,
                tar::EntryType::XGlobalHeader | tar::EntryType::XHeader
            ) {
                continue;
            }

            let path = entry.path()?.to_string_lossy().into_owned();
            let mode = header.mode();
            let mtime = header.mtime();
            let kind = match (&mode, &mtime) {
                (Ok(_), Ok(_)) => member_kind(entry_type),
                _ => FileType::Bad,
            };

            let id = match tree.push(kind, &path) {
                Ok(id) => id,
                Err(VfsError::AlreadyExists(_)) => match self.replace(tree, &path, kind) {
                    Some(id) => id,
                    None => {
                        warn!(member = %path, "archive member clashes with a directory, skipped");
                        continue;
                    }
                },
                Err(e) => {
                    warn!(member = %path, error = %e, "archive member skipped");
                    continue;
                }
            };

            let target = entry
                .link_name()?
                .map(|p| p.to_string_lossy().into_owned());
            let node = tree.node_mut(id)?;
            node.attr.perm = mode.unwrap_or(0o644) & 0o7777;
            node.attr.uid = header.uid().unwrap_or(0) as u32;
            node.attr.gid = header.gid().unwrap_or(0) as u32;
            let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(mtime.unwrap_or(0));
            node.attr.mtime = mtime;
            node.attr.atime = mtime;
            node.attr.ctime = mtime;

            match entry_type {
                tar::EntryType::Symlink => {
                    node.attr.size = target.as_ref().map_or(0, |t| t.len() as u64);
                    node.target = target;
                }
                tar::EntryType::Link => {
                    if let Some(target) = target {
                        // Size is filled in from the target below.
                        self.payloads.insert(id, Payload::HardLink(target));
                    }
                }
                _ if kind == FileType::Regular => {
                    node.attr.size = entry.size();
                    self.payloads.insert(
                        id,
                        Payload::Data {
                            offset: entry.raw_file_position(),
                            len: entry.size(),
                        },
                    );
                }
                _ => {}
            }
        }

        // Hard links report their target's size.
        let links: Vec<(NodeId, String)> = self
            .payloads
            .iter()
            .filter_map(|(id, p)| match p {
                Payload::HardLink(target) => Some((*id, target.clone())),
                Payload::Data { .. } => None,
            })
            .collect();
        for (id, target) in links {
            let size = Self::find(tree, &target)
                .and_then(|t| tree.get(t))
                .map_or(0, |t| t.attr.size);
            tree.node_mut(id)?.attr.size = size;
        }

        debug!(archive = argument, members = self.payloads.len(), "archive scanned");
        self.archive = Some(file);
        Ok(())
    }

    fn unmount(&mut self, _tree: &mut NodeTree) -> VfsResult<()> {
        self.archive = None;
        self.payloads.clear();
        Ok(())
    }

    fn materialize(&mut self, tree: &NodeTree, node: NodeId, out: &mut File) -> VfsResult<u64> {
        self.copy_out(tree, node, out)
    }
}
