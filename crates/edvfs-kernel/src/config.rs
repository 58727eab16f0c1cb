//! VFS configuration.
//!
//! Loaded from RON. Every field has a default, so an empty `()` file is a
//! valid configuration.
//!
//! ```ron
//! (
//!     max_symlinks: 16,
//!     name_cache: (max_entries: 1024),
//!     mounts: [
//!         (point: "/src", backend: "local", argument: "/home/amy/src"),
//!         (point: "/dist", backend: "tar", argument: "/tmp/dist.tar", read_only: true),
//!     ],
//! )
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::path::PathLimits;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Name cache budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameCacheConfig {
    /// Sum of cached path lengths.
    pub max_bytes: usize,
    /// Number of cached nodes.
    pub max_entries: usize,
    /// Paths this long or longer are never cached.
    pub max_path: usize,
}

impl Default for NameCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024,
            max_entries: 4096,
            max_path: 256,
        }
    }
}

/// A mount created at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Where to mount.
    pub point: String,
    /// Backend class prefix (`local`, `tar`, `ftp`, ...).
    pub backend: String,
    /// Backend argument (host directory, archive path, URL).
    #[serde(default)]
    pub argument: String,
    #[serde(default)]
    pub read_only: bool,
    /// Mount point need not exist; it is listed in its parent directory.
    #[serde(default)]
    pub virtual_point: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    /// Longest path component.
    pub name_max: usize,
    /// Longest path.
    pub path_max: usize,
    /// Symlinks followed in one lookup before `ELOOP`.
    pub max_symlinks: u32,
    pub name_cache: NameCacheConfig,
    /// Where archive members are extracted. Defaults to the system temp dir.
    pub temp_dir: Option<PathBuf>,
    /// Honour `path#backend` components.
    pub auto_mount: bool,
    pub mounts: Vec<MountConfig>,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            name_max: 255,
            path_max: 4096,
            max_symlinks: 8,
            name_cache: NameCacheConfig::default(),
            temp_dir: None,
            auto_mount: true,
            mounts: Vec::new(),
        }
    }
}

impl VfsConfig {
    /// Parse a configuration from RON text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: VfsConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_ron(&text)
    }

    /// Reject limits that would make every lookup fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name_max == 0 || self.path_max == 0 {
            return Err(ConfigError::Invalid("path limits must be non-zero".into()));
        }
        if self.name_max > self.path_max {
            return Err(ConfigError::Invalid(format!(
                "name_max {} exceeds path_max {}",
                self.name_max, self.path_max
            )));
        }
        if self.name_cache.max_entries == 0 || self.name_cache.max_bytes == 0 {
            return Err(ConfigError::Invalid("name cache budgets must be non-zero".into()));
        }
        for mount in &self.mounts {
            if mount.point.is_empty() || mount.backend.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "mount needs a point and a backend: {mount:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn path_limits(&self) -> PathLimits {
        PathLimits {
            name_max: self.name_max,
            path_max: self.path_max,
        }
    }

    /// Directory for extracted members.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
