//! Remote source.
//!
//! The protocol itself lives behind [`RemoteTransport`]; this module parses
//! the mount argument, lists directories lazily the first time they are
//! walked, and fetches file contents on first open.

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::rc::Rc;
use tracing::{debug, warn};

use super::tree::TreeSource;
use crate::error::{VfsError, VfsResult};
use crate::lookup::NodeLookup;
use crate::node::{NodeId, NodeTree};
use crate::types::{DirEntry, MountFlags};

/// Protocols recognised without a `//` after the colon.
const KNOWN_PROTOCOLS: &[&str] = &["ftp", "http", "https", "sftp"];

/// Parsed `[proto:][user[:pass]@]host[:port][/path]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUrl {
    pub proto: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    /// Always starts with `/`.
    pub path: String,
}

impl fmt::Display for RemoteUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(proto) = &self.proto {
            write!(f, "{proto}://")?;
        }
        if let Some(user) = &self.user {
            write!(f, "{user}")?;
            if self.password.is_some() {
                write!(f, ":***")?;
            }
            write!(f, "@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "{}", self.path)
    }
}

/// Index of the first `needle` outside double quotes.
fn find_unquoted(s: &str, needle: char) -> Option<usize> {
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c == needle && !quoted => return Some(i),
            _ => {}
        }
    }
    None
}

/// Index of the last `needle` outside double quotes.
fn rfind_unquoted(s: &str, needle: char) -> Option<usize> {
    let mut quoted = false;
    let mut found = None;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c == needle && !quoted => found = Some(i),
            _ => {}
        }
    }
    found
}

/// Strip one pair of surrounding quotes. Stray quotes are an error.
fn unquote(s: &str) -> VfsResult<String> {
    let inner = match s.strip_prefix('"') {
        Some(rest) => rest
            .strip_suffix('"')
            .ok_or_else(|| VfsError::invalid_argument(format!("unterminated quote in {s:?}")))?,
        None => s,
    };
    if inner.contains('"') {
        return Err(VfsError::invalid_argument(format!("stray quote in {s:?}")));
    }
    Ok(inner.to_string())
}

impl RemoteUrl {
    pub fn parse(input: &str) -> VfsResult<Self> {
        let mut rest = input.trim();
        if rest.is_empty() {
            return Err(VfsError::invalid_argument("empty remote address"));
        }

        let mut proto = None;
        if let Some(colon) = rest.find(':') {
            let name = &rest[..colon];
            let after = &rest[colon + 1..];
            let is_proto = !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphabetic())
                && (after.starts_with("//")
                    || KNOWN_PROTOCOLS.contains(&name.to_ascii_lowercase().as_str()));
            if is_proto {
                proto = Some(name.to_ascii_lowercase());
                rest = after.strip_prefix("//").unwrap_or(after);
            }
        }

        let (authority, path) = match find_unquoted(rest, '/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, "/"),
        };

        let (user, password, hostport) = match rfind_unquoted(authority, '@') {
            Some(at) => {
                let userinfo = &authority[..at];
                let (user, password) = match find_unquoted(userinfo, ':') {
                    Some(colon) => (
                        unquote(&userinfo[..colon])?,
                        Some(unquote(&userinfo[colon + 1..])?),
                    ),
                    None => (unquote(userinfo)?, None),
                };
                if user.is_empty() {
                    return Err(VfsError::invalid_argument(format!("empty user in {input:?}")));
                }
                (Some(user), password, &authority[at + 1..])
            }
            None => (None, None, authority),
        };

        let (host, port) = match hostport.rfind(':') {
            Some(colon) => {
                let port = hostport[colon + 1..].parse::<u16>().map_err(|_| {
                    VfsError::invalid_argument(format!("bad port in {input:?}"))
                })?;
                (&hostport[..colon], Some(port))
            }
            None => (hostport, None),
        };
        if host.is_empty() || host.contains('"') || host.contains('@') {
            return Err(VfsError::invalid_argument(format!("bad host in {input:?}")));
        }

        Ok(Self {
            proto,
            user,
            password,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// Remote path for a tree path.
    pub fn remote_path(&self, tree_path: &str) -> String {
        let base = self.path.trim_end_matches('/');
        if tree_path == "/" {
            if base.is_empty() { "/".to_string() } else { base.to_string() }
        } else {
            format!("{base}{tree_path}")
        }
    }
}

/// Blocking protocol client for one remote mount.
pub trait RemoteTransport {
    /// Entries of a remote directory.
    fn list(&mut self, path: &str) -> VfsResult<Vec<DirEntry>>;

    /// Copy a remote file into `out`.
    fn fetch(&mut self, path: &str, out: &mut File) -> VfsResult<u64>;

    /// Target of a remote symlink.
    fn readlink(&mut self, path: &str) -> VfsResult<String> {
        let _ = path;
        Err(VfsError::Unsupported)
    }

    /// Called at unmount.
    fn disconnect(&mut self) {}
}

/// Opens a transport for a parsed address.
pub type Connector = Rc<dyn Fn(&RemoteUrl) -> VfsResult<Box<dyn RemoteTransport>>>;

/// Tree source backed by a [`RemoteTransport`].
pub struct RemoteSource {
    connector: Option<Connector>,
    transport: Option<Box<dyn RemoteTransport>>,
    url: Option<RemoteUrl>,
    listed: HashSet<NodeId>,
}

impl fmt::Debug for RemoteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSource")
            .field("url", &self.url.as_ref().map(|u| u.to_string()))
            .field("connected", &self.transport.is_some())
            .field("listed", &self.listed.len())
            .finish()
    }
}

impl RemoteSource {
    pub fn new(connector: Option<Connector>) -> Self {
        Self {
            connector,
            transport: None,
            url: None,
            listed: HashSet::new(),
        }
    }

    pub fn url(&self) -> Option<&RemoteUrl> {
        self.url.as_ref()
    }

    fn connected(&mut self) -> VfsResult<(&RemoteUrl, &mut Box<dyn RemoteTransport>)> {
        match (&self.url, &mut self.transport) {
            (Some(url), Some(transport)) => Ok((url, transport)),
            _ => Err(VfsError::other("remote not connected")),
        }
    }
}

impl NodeLookup for RemoteSource {
    fn readlink(&mut self, tree: &NodeTree, node: NodeId) -> VfsResult<String> {
        if let Some(target) = &tree.node(node)?.target {
            return Ok(target.clone());
        }
        let tree_path = tree.path(node, false);
        let (url, transport) = self.connected()?;
        transport.readlink(&url.remote_path(&tree_path))
    }

    fn populate_dir(&mut self, tree: &mut NodeTree, dir: NodeId) -> VfsResult<()> {
        if self.listed.contains(&dir) {
            return Ok(());
        }

        let tree_path = tree.path(dir, false);
        let (url, transport) = self.connected()?;
        let remote = url.remote_path(&tree_path);
        let entries = transport.list(&remote)?;
        debug!(dir = %remote, entries = entries.len(), "remote listing");

        for entry in entries {
            if entry.name.is_empty() || entry.name == "." || entry.name == ".." {
                continue;
            }
            let id = match tree.add(dir, entry.kind, &entry.name) {
                Ok(id) => id,
                Err(VfsError::AlreadyExists(_)) => continue,
                Err(e) => {
                    warn!(dir = %remote, name = %entry.name, error = %e, "skipping remote entry");
                    continue;
                }
            };
            if let Some(mut attr) = entry.attr {
                attr.ino = id.0;
                attr.kind = entry.kind;
                tree.node_mut(id)?.attr = attr;
            }
        }

        self.listed.insert(dir);
        Ok(())
    }
}

impl TreeSource for RemoteSource {
    fn mount_flags(&self) -> MountFlags {
        MountFlags::READ_ONLY | MountFlags::NAME_CACHE
    }

    fn populate(&mut self, _tree: &mut NodeTree, argument: &str) -> VfsResult<()> {
        let url = RemoteUrl::parse(argument)?;
        let Some(connector) = self.connector.clone() else {
            warn!(url = %url, "no transport registered for remote mount");
            return Err(VfsError::Unsupported);
        };
        let transport = connector(&url)?;
        debug!(url = %url, "remote connected");
        self.transport = Some(transport);
        self.url = Some(url);
        Ok(())
    }

    fn unmount(&mut self, _tree: &mut NodeTree) -> VfsResult<()> {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect();
        }
        self.listed.clear();
        Ok(())
    }

    fn materialize(&mut self, tree: &NodeTree, node: NodeId, out: &mut File) -> VfsResult<u64> {
        let tree_path = tree.path(node, false);
        let (url, transport) = self.connected()?;
        transport.fetch(&url.remote_path(&tree_path), out)
    }
}
