// src/metadata/ledger.rs

//! Per-file ledger stored as `file_metadata.bin`
//!
//! The ledger records every path shipped in a package with its type,
//! permissions, owner, group and (for regular files) a SHA-256 of the
//! plaintext. It is written at build time, refreshed from the normalized
//! tree at install time, copied into the installed package record, and
//! consulted when verifying or removing an installed package.

use crate::archive::checksum::{ChecksumAlgorithm, digest_file};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Ledger file name inside a package
pub const LEDGER_FILE: &str = "file_metadata.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Absolute for `root/` entries, relative for `reloc/` entries
    pub path: String,
    pub kind: EntryKind,
    pub perms: Option<u32>,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    /// SHA-256 of the plaintext; `None` for directories, links and
    /// files shipped pre-encrypted
    pub sha256: Option<String>,
}

impl LedgerEntry {
    pub fn is_relocatable(&self) -> bool {
        !self.path.starts_with('/')
    }

    /// Installed location: root entries under `root`, relocatable ones under `base`
    pub fn install_path(&self, root: &Path, base: &Path) -> PathBuf {
        if self.is_relocatable() {
            base.join(&self.path)
        } else {
            root.join(self.path.trim_start_matches('/'))
        }
    }

    /// Location inside an unpacked `tpkg/` directory
    pub fn package_path(&self, tpkg_dir: &Path) -> PathBuf {
        if self.is_relocatable() {
            tpkg_dir.join("reloc").join(&self.path)
        } else {
            tpkg_dir.join("root").join(self.path.trim_start_matches('/'))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLedger {
    pub entries: Vec<LedgerEntry>,
}

impl FileLedger {
    /// Walk `root/` and `reloc/` of a package directory
    ///
    /// Paths listed in `skip_digest` are recorded without a checksum.
    pub fn scan(tpkg_dir: &Path, skip_digest: &[String]) -> Result<Self> {
        let mut entries = Vec::new();

        for (sub, absolute) in [("root", true), ("reloc", false)] {
            let top = tpkg_dir.join(sub);
            if !top.is_dir() {
                continue;
            }

            for entry in WalkDir::new(&top).min_depth(1).sort_by_file_name() {
                let entry = entry.map_err(std::io::Error::from)?;
                let rel = entry
                    .path()
                    .strip_prefix(&top)
                    .map_err(|e| Error::IoError(format!("{}: {}", entry.path().display(), e)))?
                    .to_string_lossy()
                    .into_owned();
                let path = if absolute { format!("/{}", rel) } else { rel };

                let file_type = entry.file_type();
                let kind = if file_type.is_symlink() {
                    EntryKind::Symlink
                } else if file_type.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };

                let meta = entry.metadata().map_err(std::io::Error::from)?;
                let perms = (kind != EntryKind::Symlink).then(|| meta.permissions().mode() & 0o7777);

                let sha256 = if kind == EntryKind::File && !skip_digest.contains(&path) {
                    Some(digest_file(entry.path(), ChecksumAlgorithm::Sha256)?)
                } else {
                    None
                };

                entries.push(LedgerEntry {
                    path,
                    kind,
                    perms,
                    uid: Some(meta.uid()),
                    gid: Some(meta.gid()),
                    sha256,
                });
            }
        }

        Ok(Self { entries })
    }

    /// Re-read permissions and ownership from an unpacked `tpkg/` directory
    ///
    /// Entries missing from the tree keep what they had.
    pub fn refresh_attributes(&mut self, tpkg_dir: &Path) {
        for entry in &mut self.entries {
            let Ok(meta) = std::fs::symlink_metadata(entry.package_path(tpkg_dir)) else {
                continue;
            };
            if entry.kind != EntryKind::Symlink {
                entry.perms = Some(meta.permissions().mode() & 0o7777);
            }
            entry.uid = Some(meta.uid());
            entry.gid = Some(meta.gid());
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
        ciborium::from_reader(BufReader::new(file))
            .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| Error::IoError(format!("Failed to create {}: {}", path.display(), e)))?;
        ciborium::into_writer(self, BufWriter::new(file))
            .map_err(|e| Error::IoError(format!("{}: {}", path.display(), e)))
    }

    pub fn get(&self, path: &str) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Installed paths of everything except directories
    pub fn installed_files(&self, root: &Path, base: &Path) -> Vec<PathBuf> {
        self.entries
            .iter()
            .filter(|e| e.kind != EntryKind::Directory)
            .map(|e| e.install_path(root, base))
            .collect()
    }

    /// Installed paths of every entry
    pub fn installed_paths(&self, root: &Path, base: &Path) -> Vec<PathBuf> {
        self.entries.iter().map(|e| e.install_path(root, base)).collect()
    }
}
