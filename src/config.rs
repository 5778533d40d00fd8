// src/config.rs

//! Host configuration
//!
//! Settings come from built-in defaults, then `tpkg.conf`, then command
//! line flags. `tpkg.conf` is TOML; unknown keys are ignored.
//!
//! ```toml
//! base = "/srv/tpkg"
//! sources = ["http://repo.example.com/tpkg/", "/var/local/pkgs"]
//! prompt = false
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default installation base for relocatable files
pub const DEFAULT_BASE: &str = "/opt/tpkg";

/// System-wide configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tpkg.conf";

/// Default directory holding external hook programs
pub const DEFAULT_EXTERNALS_DIR: &str = "/usr/lib/tpkg/externals";

/// Values read from a `tpkg.conf` file or the command line
///
/// Every field is optional; unset fields fall back to defaults derived
/// from `base` and `root`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub base: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub var_dir: Option<PathBuf>,
    pub externals_dir: Option<PathBuf>,
    pub init_dir: Option<PathBuf>,
    pub crontab_dir: Option<PathBuf>,
    #[serde(alias = "source")]
    pub sources: Vec<String>,
    pub prompt: Option<bool>,
}

impl ConfigFile {
    /// Parse the TOML text of a `tpkg.conf`
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigError(format!("tpkg.conf: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::IoError(format!("Failed to read {}: {}", path.display(), e)))?;
        debug!("Loaded configuration from {}", path.display());
        Self::parse(&content)
    }

    /// Layer `other` on top of `self`; sources accumulate
    pub fn merge(mut self, other: ConfigFile) -> Self {
        self.base = other.base.or(self.base);
        self.root = other.root.or(self.root);
        self.var_dir = other.var_dir.or(self.var_dir);
        self.externals_dir = other.externals_dir.or(self.externals_dir);
        self.init_dir = other.init_dir.or(self.init_dir);
        self.crontab_dir = other.crontab_dir.or(self.crontab_dir);
        self.prompt = other.prompt.or(self.prompt);
        for source in other.sources {
            if !self.sources.contains(&source) {
                self.sources.push(source);
            }
        }
        self
    }
}

/// Effective configuration of one tpkg instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Relocatable files install here
    pub base: PathBuf,
    /// Absolute package paths are placed under this root
    pub root: PathBuf,
    /// State directory: metadata, cache, tmp, lock and history
    pub var_dir: PathBuf,
    pub sources: Vec<String>,
    pub externals_dir: PathBuf,
    pub init_dir: PathBuf,
    pub crontab_dir: PathBuf,
    pub prompt: bool,
    pub debug: bool,
}

impl Config {
    /// Defaults for a base and root
    pub fn new(base: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self::resolve(ConfigFile {
            base: Some(base.into()),
            root: Some(root.into()),
            ..Default::default()
        })
    }

    /// Fill unset values with defaults
    pub fn resolve(file: ConfigFile) -> Self {
        let root = file.root.unwrap_or_else(|| PathBuf::from("/"));
        let base = file
            .base
            .unwrap_or_else(|| root.join(DEFAULT_BASE.trim_start_matches('/')));
        let var_dir = file.var_dir.unwrap_or_else(|| base.join("var").join("tpkg"));

        Self {
            externals_dir: file
                .externals_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_EXTERNALS_DIR)),
            init_dir: file.init_dir.unwrap_or_else(|| root.join("etc").join("rc.d")),
            crontab_dir: file.crontab_dir.unwrap_or_else(|| root.join("etc").join("cron.d")),
            sources: file.sources,
            prompt: file.prompt.unwrap_or(true),
            debug: false,
            base,
            root,
            var_dir,
        }
    }

    /// Defaults overlaid with a `tpkg.conf`
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::resolve(ConfigFile::load(path)?))
    }

    /// Installed package records
    pub fn metadata_dir(&self) -> PathBuf {
        self.var_dir.join("metadata")
    }

    /// Downloaded package cache
    pub fn cache_dir(&self) -> PathBuf {
        self.var_dir.join("cache")
    }

    /// Scratch space for unpacking
    pub fn tmp_dir(&self) -> PathBuf {
        self.var_dir.join("tmp")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.var_dir.join("lock")
    }

    pub fn history_db(&self) -> PathBuf {
        self.var_dir.join("history.db")
    }

    /// Where a manifest path is installed: absolute paths under `root`,
    /// relative ones under `base`
    pub fn install_path(&self, path: &str) -> PathBuf {
        if path.starts_with('/') {
            self.root.join(path.trim_start_matches('/'))
        } else {
            self.base.join(path)
        }
    }

    /// Create the state directory layout
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.metadata_dir(), self.cache_dir(), self.tmp_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::InitError(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(ConfigFile::default())
    }
}
