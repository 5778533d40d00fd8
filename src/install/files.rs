// src/install/files.rs

//! Moving package files into place and deleting them again

use crate::archive::checksum::{ChecksumAlgorithm, digest_file};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metadata::{EntryKind, FileLedger, Metadata};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io::{self, ErrorKind};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Suffix for a new config file that would have replaced a modified one
pub const NEW_CONFIG_SUFFIX: &str = ".tpkgnew";

fn note(warnings: &mut Vec<String>, msg: String) {
    warn!("{}", msg);
    warnings.push(msg);
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Copy `src` next to `dest` and rename it over `dest`
fn copy_into_place(src: &Path, dest: &Path) -> Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("/"));
    let meta = fs::symlink_metadata(src)?;

    if meta.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        let tmp = tempfile::Builder::new()
            .prefix(".tpkg")
            .tempdir_in(dir)
            .map_err(|e| Error::IoError(format!("Failed to create temp dir in {}: {}", dir.display(), e)))?;
        let staged = tmp.path().join("link");
        symlink(&target, &staged)?;
        fs::rename(&staged, dest)?;
    } else {
        let tmp = NamedTempFile::new_in(dir)
            .map_err(|e| Error::IoError(format!("Failed to create temp file in {}: {}", dir.display(), e)))?;
        fs::copy(src, tmp.path())?;
        fs::set_permissions(tmp.path(), meta.permissions())?;
        tmp.persist(dest)
            .map_err(|e| Error::IoError(format!("Failed to replace {}: {}", dest.display(), e.error)))?;
    }
    fs::remove_file(src)?;
    Ok(())
}

/// Move a file or symlink over `dest` atomically
///
/// Falls back to copy-and-rename when `src` and `dest` are on different
/// filesystems.
pub fn move_file_atomic(src: &Path, dest: &Path) -> Result<()> {
    if fs::symlink_metadata(dest).is_ok_and(|m| m.is_dir()) {
        return Err(Error::IoError(format!(
            "Cannot replace directory {} with a file",
            dest.display()
        )));
    }

    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!("{} is on another filesystem, copying", dest.display());
            copy_into_place(src, dest)
        }
        Err(e) => Err(Error::IoError(format!(
            "Failed to move {} to {}: {}",
            src.display(),
            dest.display(),
            e
        ))),
    }
}

fn same_contents(a: &Path, b: &Path) -> Result<bool> {
    Ok(digest_file(a, ChecksumAlgorithm::Sha256)? == digest_file(b, ChecksumAlgorithm::Sha256)?)
}

/// Move the unpacked `root/` and `reloc/` trees into place
///
/// Directories are created as needed and get the package's mode only
/// when newly created. A config file whose installed copy differs from
/// the packaged one is left alone; the packaged copy goes next to it with
/// a `.tpkgnew` suffix. Returns the paths written.
pub fn place_tree(
    tpkg_dir: &Path,
    ledger: &FileLedger,
    metadata: &Metadata,
    config: &Config,
    warnings: &mut Vec<String>,
) -> Result<Vec<PathBuf>> {
    let mut placed = Vec::new();

    for entry in &ledger.entries {
        let src = entry.package_path(tpkg_dir);
        let dest = entry.install_path(&config.root, &config.base);

        match entry.kind {
            EntryKind::Directory => {
                if fs::symlink_metadata(&dest).is_err() {
                    fs::create_dir_all(&dest).map_err(|e| {
                        Error::IoError(format!("Failed to create {}: {}", dest.display(), e))
                    })?;
                    fs::set_permissions(&dest, fs::metadata(&src)?.permissions())?;
                }
            }
            EntryKind::File | EntryKind::Symlink => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }

                let is_config = metadata.file_entry(&entry.path).is_some_and(|f| f.config);
                let target = if is_config
                    && entry.kind == EntryKind::File
                    && fs::symlink_metadata(&dest).is_ok_and(|m| m.is_file())
                    && !same_contents(&src, &dest)?
                {
                    let new = with_suffix(&dest, NEW_CONFIG_SUFFIX);
                    note(
                        warnings,
                        format!(
                            "{} has been modified; new version installed as {}",
                            dest.display(),
                            new.display()
                        ),
                    );
                    new
                } else {
                    dest
                };

                move_file_atomic(&src, &target)?;
                placed.push(target);
            }
        }
    }

    info!("Placed {} file(s) for {}", placed.len(), metadata.name);
    Ok(placed)
}

/// Delete a package's installed paths
///
/// Paths are processed in reverse sorted order so directory contents go
/// before the directory. Paths in `shared` belong to other packages too
/// and are left alone. Missing files and non-empty directories produce
/// warnings.
pub fn remove_installed(
    ledger: &FileLedger,
    config: &Config,
    shared: &HashSet<PathBuf>,
    warnings: &mut Vec<String>,
) -> usize {
    let mut paths: Vec<(PathBuf, EntryKind)> = ledger
        .entries
        .iter()
        .map(|e| (e.install_path(&config.root, &config.base), e.kind))
        .collect();
    paths.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (path, kind) in paths {
        if shared.contains(&path) {
            debug!("{} is shared with another package", path.display());
            continue;
        }

        let result = match kind {
            EntryKind::Directory => fs::remove_dir(&path),
            EntryKind::File | EntryKind::Symlink => fs::remove_file(&path),
        };

        match result {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                note(warnings, format!("{} was already removed", path.display()));
            }
            Err(e) if kind == EntryKind::Directory && is_not_empty(&e) => {
                note(warnings, format!("Directory {} is not empty, leaving it", path.display()));
            }
            Err(e) => note(warnings, format!("Failed to remove {}: {}", path.display(), e)),
        }
    }
    removed
}

fn is_not_empty(e: &io::Error) -> bool {
    e.kind() == ErrorKind::DirectoryNotEmpty || e.raw_os_error() == Some(libc::EEXIST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FileEntry;

    fn unpacked(dir: &Path) -> PathBuf {
        let tpkg = dir.join("tpkg");
        fs::create_dir_all(tpkg.join("reloc/bin")).unwrap();
        fs::write(tpkg.join("reloc/bin/tool"), "tool v2").unwrap();
        fs::create_dir_all(tpkg.join("root/etc")).unwrap();
        fs::write(tpkg.join("root/etc/tool.conf"), "packaged").unwrap();
        symlink("tool", tpkg.join("reloc/bin/t")).unwrap();
        tpkg
    }

    fn config_metadata() -> Metadata {
        let mut md = Metadata::new("tool", "2.0", "me");
        md.files.files.push(FileEntry {
            path: "/etc/tool.conf".to_string(),
            config: true,
            ..Default::default()
        });
        md
    }

    #[test]
    fn test_move_file_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        fs::write(&src, "new").unwrap();
        fs::write(&dest, "old").unwrap();

        move_file_atomic(&src, &dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "new");
        assert!(!src.exists());

        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(&src, "x").unwrap();
        assert!(move_file_atomic(&src, &dir.path().join("d")).is_err());
    }

    #[test]
    fn test_copy_into_place_handles_links() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("link");
        symlink("elsewhere", &src).unwrap();
        let dest = dir.path().join("placed");

        copy_into_place(&src, &dest).unwrap();
        assert_eq!(fs::read_link(&dest).unwrap(), PathBuf::from("elsewhere"));
        assert!(fs::symlink_metadata(&src).is_err());
    }

    #[test]
    fn test_place_tree() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path().join("base"), dir.path().join("root"));
        let tpkg = unpacked(dir.path());
        let ledger = FileLedger::scan(&tpkg, &[]).unwrap();

        let mut warnings = Vec::new();
        let placed = place_tree(&tpkg, &ledger, &config_metadata(), &config, &mut warnings).unwrap();
        assert_eq!(placed.len(), 3);
        assert!(warnings.is_empty());
        assert_eq!(fs::read_to_string(config.base.join("bin/tool")).unwrap(), "tool v2");
        assert_eq!(fs::read_link(config.base.join("bin/t")).unwrap(), PathBuf::from("tool"));
        assert_eq!(fs::read_to_string(config.root.join("etc/tool.conf")).unwrap(), "packaged");
    }

    #[test]
    fn test_modified_config_file_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path().join("base"), dir.path().join("root"));
        let conf = config.root.join("etc/tool.conf");
        fs::create_dir_all(conf.parent().unwrap()).unwrap();
        fs::write(&conf, "local edits").unwrap();

        let tpkg = unpacked(dir.path());
        let ledger = FileLedger::scan(&tpkg, &[]).unwrap();
        let mut warnings = Vec::new();
        place_tree(&tpkg, &ledger, &config_metadata(), &config, &mut warnings).unwrap();

        assert_eq!(fs::read_to_string(&conf).unwrap(), "local edits");
        assert_eq!(
            fs::read_to_string(config.root.join("etc/tool.conf.tpkgnew")).unwrap(),
            "packaged"
        );
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_remove_installed() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path().join("base"), dir.path().join("root"));
        let tpkg = unpacked(dir.path());
        let ledger = FileLedger::scan(&tpkg, &[]).unwrap();
        let mut warnings = Vec::new();
        place_tree(&tpkg, &ledger, &config_metadata(), &config, &mut warnings).unwrap();

        // Something else lives in /etc
        fs::write(config.root.join("etc/other.conf"), "keep").unwrap();
        fs::remove_file(config.base.join("bin/t")).unwrap();

        let shared: HashSet<PathBuf> = HashSet::new();
        let removed = remove_installed(&ledger, &config, &shared, &mut warnings);

        // bin/tool, bin, etc/tool.conf
        assert_eq!(removed, 3);
        assert!(!config.base.join("bin").exists());
        assert!(config.root.join("etc/other.conf").exists());
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("already removed")));
        assert!(warnings.iter().any(|w| w.contains("not empty")));
    }
}
