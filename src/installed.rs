// src/installed.rs

//! Installed package records
//!
//! Each installed package owns a directory under `<var_dir>/metadata`
//! named after its package stem, holding the manifest (`tpkg.yml`), the
//! file ledger (`file_metadata.bin`) and copies of the removal scripts.
//! The directory is written once the package's files are in place and
//! deleted when the package is removed.

use crate::archive::checksum::{ChecksumAlgorithm, digest_file};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metadata::ledger::LEDGER_FILE;
use crate::metadata::{EntryKind, FileLedger, METADATA_FILE, Metadata};
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Scripts kept for running at removal time
const KEPT_SCRIPTS: [&str; 2] = ["preremove", "postremove"];

#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub metadata: Metadata,
    pub ledger: FileLedger,
    /// The record directory
    pub dir: PathBuf,
}

impl InstalledPackage {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// A kept removal script, if the package shipped one
    pub fn script(&self, name: &str) -> Option<PathBuf> {
        let path = self.dir.join(name);
        path.is_file().then_some(path)
    }

    /// Installed paths of files and links (not directories)
    pub fn files(&self, config: &Config) -> Vec<PathBuf> {
        self.ledger.installed_files(&config.root, &config.base)
    }
}

/// Outcome of checking one installed package against its ledger
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub missing: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    /// Mode, owner or group differ from the ledger
    pub attributes: Vec<PathBuf>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.modified.is_empty() && self.attributes.is_empty()
    }
}

/// The set of installed package records
#[derive(Debug, Clone)]
pub struct InstalledStore {
    dir: PathBuf,
}

impl InstalledStore {
    pub fn new(metadata_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: metadata_dir.into(),
        }
    }

    pub fn open(config: &Config) -> Self {
        Self::new(config.metadata_dir())
    }

    fn load(dir: &Path) -> Result<InstalledPackage> {
        let metadata = Metadata::load(&dir.join(METADATA_FILE))?;
        let ledger_path = dir.join(LEDGER_FILE);
        let ledger = if ledger_path.exists() {
            FileLedger::read(&ledger_path)?
        } else {
            FileLedger::default()
        };
        Ok(InstalledPackage {
            metadata,
            ledger,
            dir: dir.to_path_buf(),
        })
    }

    /// Every readable record, sorted by name
    pub fn list(&self) -> Result<Vec<InstalledPackage>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut packages = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .map_err(|e| Error::IoError(format!("Failed to read {}: {}", self.dir.display(), e)))?
        {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            match Self::load(&path) {
                Ok(pkg) => packages.push(pkg),
                Err(e) => warn!("Skipping unreadable package record {}: {}", path.display(), e),
            }
        }

        packages.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(packages)
    }

    pub fn find(&self, name: &str) -> Result<Vec<InstalledPackage>> {
        Ok(self.list()?.into_iter().filter(|p| p.name() == name).collect())
    }

    /// Persist a package record from its unpacked `tpkg/` directory
    pub fn record(&self, metadata: &Metadata, tpkg_dir: &Path) -> Result<InstalledPackage> {
        let dir = self.dir.join(metadata.package_stem());
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)
            .map_err(|e| Error::IoError(format!("Failed to create {}: {}", dir.display(), e)))?;

        fs::write(dir.join(METADATA_FILE), metadata.to_yaml()?)?;

        let ledger_src = tpkg_dir.join(LEDGER_FILE);
        if ledger_src.exists() {
            fs::copy(&ledger_src, dir.join(LEDGER_FILE))?;
        }

        for script in KEPT_SCRIPTS {
            let src = tpkg_dir.join(script);
            if src.is_file() {
                let dest = dir.join(script);
                fs::copy(&src, &dest)?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))?;
            }
        }

        debug!("Recorded {} in {}", metadata.name, dir.display());
        Self::load(&dir)
    }

    /// Delete a package record
    pub fn forget(&self, pkg: &InstalledPackage) -> Result<()> {
        fs::remove_dir_all(&pkg.dir)
            .map_err(|e| Error::IoError(format!("Failed to remove {}: {}", pkg.dir.display(), e)))?;
        debug!("Removed record {}", pkg.dir.display());
        Ok(())
    }

    /// Installed packages whose ledger contains `path`
    pub fn owners(&self, path: &Path, config: &Config) -> Result<Vec<InstalledPackage>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|p| p.ledger.installed_paths(&config.root, &config.base).iter().any(|f| f == path))
            .collect())
    }
}

/// Compare installed files with the checksums, modes and ownership in the ledger
///
/// Config files are only checked for presence. Directories may be shared
/// with other packages, so only their presence is checked too.
pub fn verify_installed(pkg: &InstalledPackage, config: &Config) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();

    for entry in &pkg.ledger.entries {
        let path = entry.install_path(&config.root, &config.base);
        let Ok(meta) = fs::symlink_metadata(&path) else {
            report.missing.push(path);
            continue;
        };

        if entry.kind == EntryKind::Directory || pkg.metadata.file_entry(&entry.path).is_some_and(|f| f.config) {
            continue;
        }

        let mode = meta.permissions().mode() & 0o7777;
        let differs = entry.perms.is_some_and(|p| entry.kind == EntryKind::File && p != mode)
            || entry.uid.is_some_and(|uid| uid != meta.uid())
            || entry.gid.is_some_and(|gid| gid != meta.gid());
        if differs {
            debug!("{} differs from its recorded mode or ownership", path.display());
            report.attributes.push(path.clone());
        }

        let Some(expected) = &entry.sha256 else {
            continue;
        };
        let actual = digest_file(&path, ChecksumAlgorithm::Sha256)?;
        if &actual != expected {
            report.modified.push(path);
        }
    }

    Ok(report)
}
