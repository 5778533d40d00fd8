// src/install/permissions.rs

//! Ownership and mode normalization of unpacked package files
//!
//! Applied to the unpacked tree before anything is placed: directory and
//! file defaults first, then per-file overrides. A file that already
//! exists on the system and has no declared mode keeps its current mode.
//!
//! Failures are fatal when running as root. Unprivileged installs are a
//! supported degraded mode, so there they only produce warnings.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metadata::{EntryKind, FileLedger, Metadata, Posix};
use nix::unistd::{Group, User, geteuid};
use std::fs;
use std::os::unix::fs::{PermissionsExt, chown};
use std::path::Path;
use tracing::{debug, warn};

pub fn is_privileged() -> bool {
    geteuid().is_root()
}

fn lookup_user(owner: &str) -> Result<u32> {
    if let Ok(uid) = owner.parse::<u32>() {
        return Ok(uid);
    }
    User::from_name(owner)
        .map_err(|e| Error::PermissionError(format!("Failed to look up user {}: {}", owner, e)))?
        .map(|u| u.uid.as_raw())
        .ok_or_else(|| Error::PermissionError(format!("Unknown user {}", owner)))
}

fn lookup_group(group: &str) -> Result<u32> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }
    Group::from_name(group)
        .map_err(|e| Error::PermissionError(format!("Failed to look up group {}: {}", group, e)))?
        .map(|g| g.gid.as_raw())
        .ok_or_else(|| Error::PermissionError(format!("Unknown group {}", group)))
}

/// Applies modes and ownership, downgrading failures to warnings when
/// not privileged
pub struct Normalizer<'w> {
    privileged: bool,
    warnings: &'w mut Vec<String>,
}

impl<'w> Normalizer<'w> {
    pub fn new(privileged: bool, warnings: &'w mut Vec<String>) -> Self {
        Self { privileged, warnings }
    }

    fn tolerate(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if !self.privileged => {
                let msg = format!("{} (ignored, not running as root)", e);
                warn!("{}", msg);
                self.warnings.push(msg);
                Ok(())
            }
            other => other,
        }
    }

    fn set_mode(&mut self, path: &Path, mode: u32) -> Result<()> {
        let result = fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
            Error::PermissionError(format!("Failed to chmod {:o} {}: {}", mode, path.display(), e))
        });
        self.tolerate(result)
    }

    fn set_owner(&mut self, path: &Path, posix: &Posix) -> Result<()> {
        let result = (|| {
            let uid = posix.owner.as_deref().map(lookup_user).transpose()?;
            let gid = posix.group.as_deref().map(lookup_group).transpose()?;
            chown(path, uid, gid).map_err(|e| {
                Error::PermissionError(format!("Failed to chown {}: {}", path.display(), e))
            })
        })();
        self.tolerate(result)
    }

    /// Apply one POSIX block to a path
    pub fn apply(&mut self, path: &Path, posix: &Posix) -> Result<()> {
        if posix.owner.is_some() || posix.group.is_some() {
            self.set_owner(path, posix)?;
        }
        if let Some(mode) = posix.perms {
            self.set_mode(path, mode)?;
        }
        Ok(())
    }

    /// Normalize an unpacked `tpkg/` directory
    pub fn normalize(&mut self, tpkg_dir: &Path, metadata: &Metadata, ledger: &FileLedger, config: &Config) -> Result<()> {
        let file_defaults = metadata.files.file_defaults.as_ref().and_then(|d| d.posix.as_ref());
        let dir_defaults = metadata.files.dirs_defaults.as_ref().and_then(|d| d.posix.as_ref());

        for entry in &ledger.entries {
            let defaults = match entry.kind {
                EntryKind::File => file_defaults,
                EntryKind::Directory => dir_defaults,
                EntryKind::Symlink => None,
            };
            if let Some(posix) = defaults {
                self.apply(&entry.package_path(tpkg_dir), posix)?;
            }
        }

        for file in &metadata.files.files {
            let Some(posix) = &file.posix else {
                continue;
            };
            let path = file.package_path(tpkg_dir);
            if fs::symlink_metadata(&path).is_err() {
                let msg = format!("{} has permissions declared but is not in the package", file.path);
                warn!("{}", msg);
                self.warnings.push(msg);
                continue;
            }
            self.apply(&path, posix)?;
        }

        let default_mode = file_defaults.and_then(|p| p.perms);
        for entry in ledger.entries.iter().filter(|e| e.kind == EntryKind::File) {
            let declared = metadata
                .file_entry(&entry.path)
                .and_then(|f| f.posix.as_ref())
                .and_then(|p| p.perms)
                .or(default_mode);
            if declared.is_some() {
                continue;
            }

            let existing = config.install_path(&entry.path);
            if let Ok(meta) = fs::symlink_metadata(&existing)
                && meta.is_file()
            {
                let mode = meta.permissions().mode() & 0o7777;
                debug!("Keeping mode {:o} of existing {}", mode, existing.display());
                self.set_mode(&entry.package_path(tpkg_dir), mode)?;
            }
        }

        Ok(())
    }
}
