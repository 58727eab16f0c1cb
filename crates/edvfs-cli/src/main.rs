//! edvfs binary
//!
//! Browse paths through the edvfs virtual filesystem: host directories,
//! tar archives addressed inline with `#tar`, and configured mounts.
//!
//! ## Usage
//!
//! ```bash
//! edvfs ls -l /tmp/src.tar#tar/
//! edvfs cat /tmp/src.tar#tar/README
//! edvfs stat --no-follow /tmp/src.tar#tar/latest
//! edvfs glob '/tmp/src.tar#tar/docs/*.md'
//! edvfs --mount /src=local:/home/amy/src ls /src
//! edvfs --config edvfs.ron mounts
//! ```
//!
//! Logging goes to stderr; set `RUST_LOG=edvfs_kernel=debug` to watch
//! mounts and extractions.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::SystemTime;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use edvfs_kernel::{DirEntry, FileAttr, FileType, MountConfig, OpenFlags, VfsConfig, VfsContext};

/// Virtual filesystem browser.
#[derive(Parser, Debug)]
#[command(name = "edvfs")]
#[command(about = "Browse host paths, archives and mounts through edvfs")]
struct Args {
    /// RON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Extra mount, applied after the configured ones (repeatable)
    #[arg(
        long = "mount",
        value_name = "POINT=BACKEND[:ARG]",
        value_parser = parse_mount,
        global = true
    )]
    mounts: Vec<MountConfig>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory
    Ls {
        #[arg(default_value = ".")]
        path: String,

        /// Show type, permissions, links and size
        #[arg(short, long)]
        long: bool,

        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print file contents
    Cat {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Show file attributes
    Stat {
        path: String,

        /// Describe a symlink itself rather than its target
        #[arg(long)]
        no_follow: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Expand a wildcard pattern
    Glob { pattern: String },
    /// List active mounts
    Mounts,
}

/// `POINT=BACKEND[:ARG]`, e.g. `/src=local:/home/amy/src`.
fn parse_mount(arg: &str) -> Result<MountConfig, String> {
    let (point, rest) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected POINT=BACKEND[:ARG], got {arg:?}"))?;
    let (backend, argument) = rest.split_once(':').unwrap_or((rest, ""));
    if point.is_empty() || backend.is_empty() {
        return Err(format!("mount point and backend must not be empty: {arg:?}"));
    }
    Ok(MountConfig {
        point: point.to_string(),
        backend: backend.to_string(),
        argument: argument.to_string(),
        read_only: false,
        virtual_point: false,
    })
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("edvfs: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => VfsConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => VfsConfig::default(),
    };
    config.mounts.extend(args.mounts);
    debug!(mounts = config.mounts.len(), "starting vfs");

    let mut vfs = VfsContext::init(config).context("starting vfs")?;
    match args.command {
        Command::Ls { path, long, json } => ls(&mut vfs, &path, long, json),
        Command::Cat { paths } => paths.iter().try_for_each(|path| cat(&mut vfs, path)),
        Command::Stat {
            path,
            no_follow,
            json,
        } => stat(&mut vfs, &path, no_follow, json),
        Command::Glob { pattern } => {
            for path in vfs.glob(&pattern)? {
                println!("{path}");
            }
            Ok(())
        }
        Command::Mounts => mounts(&vfs),
    }
}

// ============================================================================
// Commands
// ============================================================================

fn ls(vfs: &mut VfsContext, path: &str, long: bool, json: bool) -> Result<()> {
    let attr = vfs.stat(path).with_context(|| format!("cannot access {path}"))?;
    let mut entries = if attr.is_dir() {
        read_dir(vfs, path)?
    } else {
        vec![DirEntry::with_attr(path, attr)]
    };
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    // Virtual mount points come without a snapshot.
    if long || json {
        for entry in entries.iter_mut().filter(|e| e.attr.is_none()) {
            entry.attr = vfs.lstat(&child(path, &entry.name)).ok();
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    let mut out = std::io::stdout().lock();
    for entry in &entries {
        match (&entry.attr, long) {
            (Some(attr), true) => writeln!(
                out,
                "{} {:>3} {:>10} {}",
                mode_string(attr),
                attr.nlink,
                attr.size,
                entry.name
            )?,
            _ => writeln!(out, "{}", entry.name)?,
        }
    }
    Ok(())
}

fn read_dir(vfs: &mut VfsContext, path: &str) -> Result<Vec<DirEntry>> {
    let handle = vfs.opendir(path).with_context(|| format!("cannot open {path}"))?;
    let mut entries = Vec::new();
    let listed = loop {
        match vfs.readdir(handle) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => break Ok(entries),
            Err(e) => break Err(e),
        }
    };
    vfs.closedir(handle)?;
    Ok(listed?)
}

fn cat(vfs: &mut VfsContext, path: &str) -> Result<()> {
    let handle = vfs
        .open(path, OpenFlags::read(), 0)
        .with_context(|| format!("cannot open {path}"))?;

    let mut out = std::io::stdout().lock();
    let mut buf = vec![0u8; 64 * 1024];
    let copied: Result<()> = loop {
        match vfs.read(handle, &mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = out.write_all(&buf[..n]) {
                    break Err(e.into());
                }
            }
            Err(e) => break Err(anyhow::Error::new(e).context(format!("reading {path}"))),
        }
    };
    vfs.close(handle)?;
    copied?;
    out.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct StatReport<'a> {
    path: &'a str,
    mount: String,
    backend_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(flatten)]
    attr: FileAttr,
}

fn stat(vfs: &mut VfsContext, path: &str, no_follow: bool, json: bool) -> Result<()> {
    let looked_up = if no_follow { vfs.lstat(path) } else { vfs.stat(path) };
    let attr = looked_up.with_context(|| format!("cannot stat {path}"))?;
    let target = if attr.is_symlink() {
        Some(vfs.readlink(path)?)
    } else {
        None
    };
    let (mount, backend_path) = vfs.mount_lookup(path)?;

    let report = StatReport {
        path,
        mount: format!("{} ({})", mount.path, class_label(&mount.class)),
        backend_path,
        target,
        attr,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let attr = &report.attr;
    let mut out = std::io::stdout().lock();
    match &report.target {
        Some(target) => writeln!(out, "  File: {} -> {}", report.path, target)?,
        None => writeln!(out, "  File: {}", report.path)?,
    }
    writeln!(out, "  Type: {}", attr.kind)?;
    writeln!(out, "  Size: {}", attr.size)?;
    writeln!(out, "  Mode: {:04o} ({})", attr.perm, mode_string(attr))?;
    writeln!(out, " Links: {}  Inode: {}", attr.nlink, attr.ino)?;
    writeln!(out, "   Uid: {}  Gid: {}", attr.uid, attr.gid)?;
    writeln!(out, "Modify: {}", epoch_secs(attr.mtime))?;
    writeln!(out, " Mount: {}", report.mount)?;
    writeln!(out, "  Path: {}", report.backend_path)?;
    Ok(())
}

fn mounts(vfs: &VfsContext) -> Result<()> {
    let mut out = std::io::stdout().lock();
    for mount in vfs.mounts() {
        let flags: Vec<String> = mount
            .flags
            .iter_names()
            .map(|(name, _)| name.to_lowercase())
            .collect();
        let ops = vfs.mount_stats(&mount.path).map(|s| s.total()).unwrap_or(0);
        writeln!(
            out,
            "{:<40} {:<8} {:<24} {} ops",
            mount.path,
            class_label(&mount.class),
            flags.join(","),
            ops
        )?;
    }
    Ok(())
}

// ============================================================================
// Formatting
// ============================================================================

fn child(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

fn class_label(class: &str) -> &str {
    if class.is_empty() { "root" } else { class }
}

fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `ls -l` style type and permission string.
fn mode_string(attr: &FileAttr) -> String {
    let kind = match attr.kind {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::Fifo => 'p',
        FileType::Regular => '-',
        FileType::Bad | FileType::Unknown => '?',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6, 3, 0] {
        let bits = (attr.perm >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mount() {
        let mount = parse_mount("/src=local:/home/amy/src").unwrap();
        assert_eq!(mount.point, "/src");
        assert_eq!(mount.backend, "local");
        assert_eq!(mount.argument, "/home/amy/src");

        // Only the first colon splits; URLs keep theirs.
        let mount = parse_mount("/net=ftp:ftp://host:21/pub").unwrap();
        assert_eq!(mount.backend, "ftp");
        assert_eq!(mount.argument, "ftp://host:21/pub");

        let mount = parse_mount("/h=local").unwrap();
        assert_eq!(mount.argument, "");

        assert!(parse_mount("/src").is_err());
        assert!(parse_mount("=local").is_err());
    }

    #[test]
    fn test_mode_string() {
        assert_eq!(mode_string(&FileAttr::file(0, 0o644)), "-rw-r--r--");
        assert_eq!(mode_string(&FileAttr::directory(0o755)), "drwxr-xr-x");
        assert_eq!(mode_string(&FileAttr::symlink(3)), "lrwxrwxrwx");
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "edvfs",
            "--mount",
            "/a=local:/tmp",
            "ls",
            "-l",
            "/a",
        ])
        .unwrap();
        assert_eq!(args.mounts.len(), 1);
        assert!(matches!(args.command, Command::Ls { long: true, json: false, .. }));

        let args = Args::try_parse_from(["edvfs", "stat", "--no-follow", "/x"]).unwrap();
        assert!(matches!(args.command, Command::Stat { no_follow: true, .. }));
    }
}
