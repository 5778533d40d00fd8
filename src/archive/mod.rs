// src/archive/mod.rs

//! Package archive codec
//!
//! A `.tpkg` file is an uncompressed tar holding one top-level directory
//! with two members:
//!
//! - `checksum.xml`: digest algorithm and hex digest of `tpkg.tar`
//! - `tpkg.tar`: the package itself, rooted at `tpkg/`
//!
//! The inner `tpkg/` directory contains `tpkg.yml`, the per-file ledger
//! `file_metadata.bin`, optional `preinstall`/`postinstall`/`preremove`/
//! `postremove` scripts, and the `root/` and `reloc/` file trees.
//!
//! Nothing inside `tpkg.tar` is read before its digest has been checked.

pub mod checksum;
pub mod crypto;

use crate::error::{Error, Result};
use crate::metadata::{FileLedger, LEGACY_METADATA_FILE, METADATA_FILE, Metadata};
use crate::metadata::ledger::LEDGER_FILE;
use checksum::{CHECKSUM_FILE, ChecksumAlgorithm, ChecksumManifest, digest_file, digest_reader};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Inner archive member name
pub const INNER_TAR: &str = "tpkg.tar";

/// Top-level directory inside the inner archive
pub const PACKAGE_DIR: &str = "tpkg";

/// Package scripts, in lifecycle order
pub const SCRIPTS: [&str; 4] = ["preinstall", "postinstall", "preremove", "postremove"];

fn malformed(path: &Path, detail: impl std::fmt::Display) -> Error {
    Error::MalformedArchive(format!("{}: {}", path.display(), detail))
}

/// Which outer member an entry path names, if any
fn outer_member(entry_path: &Path) -> Option<&str> {
    let mut components = entry_path.components();
    let _top = components.next()?;
    let member = components.next()?.as_os_str().to_str()?;
    if components.next().is_some() {
        return None;
    }
    Some(member)
}

fn open_outer(path: &Path) -> Result<tar::Archive<File>> {
    let file = File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
    Ok(tar::Archive::new(file))
}

/// Run `f` on the `tpkg.tar` stream of a package file
fn with_inner<T>(path: &Path, f: impl FnOnce(&mut dyn Read) -> Result<T>) -> Result<T> {
    let mut outer = open_outer(path)?;
    for entry in outer.entries().map_err(|e| malformed(path, e))? {
        let mut entry = entry.map_err(|e| malformed(path, e))?;
        let entry_path = entry.path().map_err(|e| malformed(path, e))?.into_owned();
        if outer_member(&entry_path) == Some(INNER_TAR) {
            return f(&mut entry);
        }
    }
    Err(malformed(path, format!("no {} member", INNER_TAR)))
}

/// Check the digest of `tpkg.tar` against `checksum.xml`
///
/// Members may appear in either order. The inner archive is streamed in
/// fixed-size chunks.
pub fn verify(path: &Path) -> Result<ChecksumManifest> {
    let mut manifest: Option<ChecksumManifest> = None;
    let mut has_inner = false;

    let mut outer = open_outer(path)?;
    for entry in outer.entries().map_err(|e| malformed(path, e))? {
        let mut entry = entry.map_err(|e| malformed(path, e))?;
        let entry_path = entry.path().map_err(|e| malformed(path, e))?.into_owned();
        match outer_member(&entry_path) {
            Some(CHECKSUM_FILE) => {
                let mut xml = String::new();
                entry
                    .read_to_string(&mut xml)
                    .map_err(|e| malformed(path, e))?;
                manifest = Some(ChecksumManifest::from_xml(&xml)?);
            }
            Some(INNER_TAR) => has_inner = true,
            _ => {}
        }
    }

    let manifest = manifest.ok_or_else(|| malformed(path, format!("no {} member", CHECKSUM_FILE)))?;
    if !has_inner {
        return Err(malformed(path, format!("no {} member", INNER_TAR)));
    }

    let actual = with_inner(path, |inner| digest_reader(inner, manifest.algorithm))?;
    if actual != manifest.digest {
        return Err(Error::ChecksumMismatch {
            expected: manifest.digest,
            actual,
        });
    }

    debug!("Verified {} ({} {})", path.display(), manifest.algorithm.name(), actual);
    Ok(manifest)
}

/// Verify a package and read its manifest, annotated with the file name
pub fn extract_metadata(path: &Path) -> Result<Metadata> {
    verify(path)?;

    let yml_path = Path::new(PACKAGE_DIR).join(METADATA_FILE);
    let xml_path = Path::new(PACKAGE_DIR).join(LEGACY_METADATA_FILE);

    let text = with_inner(path, |inner| {
        let mut archive = tar::Archive::new(inner);
        for entry in archive.entries().map_err(|e| malformed(path, e))? {
            let mut entry = entry.map_err(|e| malformed(path, e))?;
            let entry_path = entry.path().map_err(|e| malformed(path, e))?.into_owned();
            if entry_path == yml_path {
                let mut text = String::new();
                entry.read_to_string(&mut text)?;
                return Ok(text);
            }
            if entry_path == xml_path {
                return Err(Error::MetadataError(format!(
                    "{}: XML manifests are no longer supported",
                    path.display()
                )));
            }
        }
        Err(malformed(path, format!("no {} in package", METADATA_FILE)))
    })?;

    let mut metadata = Metadata::from_yaml(&text)?;
    metadata.filename = path.file_name().map(|n| n.to_string_lossy().into_owned());
    Ok(metadata)
}

/// Verify a package and list the paths of its inner archive
pub fn list_files(path: &Path) -> Result<Vec<String>> {
    verify(path)?;

    with_inner(path, |inner| {
        let mut archive = tar::Archive::new(inner);
        let mut files = Vec::new();
        for entry in archive.entries().map_err(|e| malformed(path, e))? {
            let entry = entry.map_err(|e| malformed(path, e))?;
            let entry_path = entry.path().map_err(|e| malformed(path, e))?;
            files.push(entry_path.to_string_lossy().into_owned());
        }
        Ok(files)
    })
}

/// Verify a package and read its file ledger
pub fn read_ledger(path: &Path) -> Result<FileLedger> {
    verify(path)?;

    let ledger_path = Path::new(PACKAGE_DIR).join(LEDGER_FILE);
    with_inner(path, |inner| {
        let mut archive = tar::Archive::new(inner);
        for entry in archive.entries().map_err(|e| malformed(path, e))? {
            let entry = entry.map_err(|e| malformed(path, e))?;
            if entry.path().map_err(|e| malformed(path, e))? == ledger_path {
                return ciborium::from_reader(entry)
                    .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)));
            }
        }
        Err(malformed(path, format!("no {} in package", LEDGER_FILE)))
    })
}

/// Verify and unpack a package into `dest`, returning the `tpkg/` directory
pub fn unpack(path: &Path, dest: &Path) -> Result<PathBuf> {
    verify(path)?;

    with_inner(path, |inner| {
        let mut archive = tar::Archive::new(inner);
        archive.set_preserve_permissions(true);
        archive
            .unpack(dest)
            .map_err(|e| Error::IoError(format!("Failed to unpack {}: {}", path.display(), e)))
    })?;

    let tpkg_dir = dest.join(PACKAGE_DIR);
    if !tpkg_dir.join(METADATA_FILE).is_file() {
        return Err(malformed(path, format!("no {} in package", METADATA_FILE)));
    }
    debug!("Unpacked {} into {}", path.display(), dest.display());
    Ok(tpkg_dir)
}

/// Copy a source tree, recreating symlinks rather than following them
fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::IoError(format!("{}: {}", entry.path().display(), e)))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            fs::set_permissions(&target, entry.metadata().map_err(io::Error::from)?.permissions())?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(&link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Build a package from a source directory
///
/// `source` holds `tpkg.yml`, optional scripts and the `root/`/`reloc/`
/// trees. The package is written to `out_dir` under its derived file
/// name. Files flagged for encryption need `passphrase`.
pub fn build(source: &Path, out_dir: &Path, passphrase: Option<&str>) -> Result<PathBuf> {
    let metadata = Metadata::load_from_dir(source)?;
    info!("Building {} {}", metadata.name, metadata.full_version());

    let workdir = tempfile::Builder::new()
        .prefix("tpkg-build")
        .tempdir()
        .map_err(|e| Error::InitError(format!("Failed to create build directory: {}", e)))?;
    let tpkg_dir = workdir.path().join(PACKAGE_DIR);
    copy_tree(source, &tpkg_dir)?;

    let mut skip_digest = Vec::new();
    let mut to_encrypt = Vec::new();
    for entry in &metadata.files.files {
        let file = entry.package_path(&tpkg_dir);
        if !file.exists() {
            if entry.is_encrypted() {
                return Err(Error::MetadataError(format!(
                    "{} is flagged for encryption but missing from the package",
                    entry.path
                )));
            }
            warn!("{} is listed in {} but missing from the package", entry.path, METADATA_FILE);
            continue;
        }

        match &entry.encrypt {
            Some(enc) if enc.is_precrypt() => {
                if !crypto::is_encrypted(&fs::read(&file)?) {
                    return Err(Error::MetadataError(format!(
                        "{} is marked precrypt but is not encrypted",
                        entry.path
                    )));
                }
                skip_digest.push(entry.path.clone());
            }
            Some(enc) if enc.is_enabled() => to_encrypt.push(file),
            _ => {}
        }
    }

    // The ledger records plaintext checksums
    let ledger = FileLedger::scan(&tpkg_dir, &skip_digest)?;
    ledger.write(&tpkg_dir.join(LEDGER_FILE))?;

    if !to_encrypt.is_empty() {
        let passphrase = passphrase.ok_or_else(|| {
            Error::PassphraseError(format!(
                "{} file(s) are flagged for encryption but no passphrase was given",
                to_encrypt.len()
            ))
        })?;
        for file in &to_encrypt {
            crypto::encrypt_file(file, passphrase)?;
        }
    }

    let inner_path = workdir.path().join(INNER_TAR);
    {
        let mut builder = tar::Builder::new(File::create(&inner_path)?);
        builder.follow_symlinks(false);
        builder.append_dir_all(PACKAGE_DIR, &tpkg_dir)?;
        builder.into_inner()?;
    }

    let digest = digest_file(&inner_path, ChecksumAlgorithm::Sha256)?;
    let manifest_path = workdir.path().join(CHECKSUM_FILE);
    fs::write(&manifest_path, ChecksumManifest::new(ChecksumAlgorithm::Sha256, digest).to_xml()?)?;

    fs::create_dir_all(out_dir)?;
    let stem = metadata.package_stem();
    let out = tempfile::NamedTempFile::new_in(out_dir)
        .map_err(|e| Error::IoError(format!("Failed to create {}: {}", out_dir.display(), e)))?;
    {
        let mut builder = tar::Builder::new(out.as_file());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        builder.append_data(&mut header, format!("{}/", stem), io::empty())?;
        builder.append_path_with_name(&manifest_path, format!("{}/{}", stem, CHECKSUM_FILE))?;
        builder.append_path_with_name(&inner_path, format!("{}/{}", stem, INNER_TAR))?;
        builder.finish()?;
    }

    let package_path = out_dir.join(metadata.package_filename());
    out.persist(&package_path)
        .map_err(|e| Error::IoError(format!("Failed to write {}: {}", package_path.display(), e.error)))?;

    info!("Created {}", package_path.display());
    Ok(package_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    fn source_tree(dir: &Path) {
        fs::write(
            dir.join(METADATA_FILE),
            "name: demo\nversion: 1.0\nmaintainer: me\nfiles:\n  files:\n    - path: etc/secret\n      encrypt: true\n",
        )
        .unwrap();
        fs::create_dir_all(dir.join("root/etc")).unwrap();
        fs::write(dir.join("root/etc/demo.conf"), "a=1\n").unwrap();
        fs::create_dir_all(dir.join("reloc/etc")).unwrap();
        fs::write(dir.join("reloc/etc/secret"), "top secret\n").unwrap();
    }

    #[test]
    fn test_build_verify_extract() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        source_tree(src.path());

        let pkg = build(src.path(), out.path(), Some("pw")).unwrap();
        assert_eq!(pkg.file_name().unwrap(), "demo-1.0.tpkg");

        let manifest = verify(&pkg).unwrap();
        assert_eq!(manifest.algorithm, ChecksumAlgorithm::Sha256);

        let md = extract_metadata(&pkg).unwrap();
        assert_eq!(md.name, "demo");
        assert_eq!(md.filename.as_deref(), Some("demo-1.0.tpkg"));

        let files = list_files(&pkg).unwrap();
        assert!(files.iter().any(|f| f == "tpkg/tpkg.yml"));
        assert!(files.iter().any(|f| f == "tpkg/file_metadata.bin"));
        assert!(files.iter().any(|f| f == "tpkg/root/etc/demo.conf"));

        let ledger = read_ledger(&pkg).unwrap();
        assert!(ledger.get("/etc/demo.conf").is_some());
        assert!(ledger.get("etc/secret").is_some());
    }

    #[test]
    fn test_unpack_encrypts_and_ledgers_plaintext() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        source_tree(src.path());
        let pkg = build(src.path(), out.path(), Some("pw")).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let tpkg_dir = unpack(&pkg, dest.path()).unwrap();
        let secret = fs::read(tpkg_dir.join("reloc/etc/secret")).unwrap();
        assert!(crypto::is_encrypted(&secret));
        assert_eq!(crypto::decrypt_bytes(&secret, "pw").unwrap(), b"top secret\n");

        let ledger = FileLedger::read(&tpkg_dir.join(LEDGER_FILE)).unwrap();
        let entry = ledger.get("etc/secret").unwrap();
        assert_eq!(
            entry.sha256.as_deref(),
            Some(digest_reader(&b"top secret\n"[..], ChecksumAlgorithm::Sha256).unwrap().as_str())
        );
        assert!(ledger.get("/etc/demo.conf").is_some());
        assert_eq!(fs::read_to_string(tpkg_dir.join("root/etc/demo.conf")).unwrap(), "a=1\n");
    }

    #[test]
    fn test_encryption_requires_passphrase() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        source_tree(src.path());
        let err = build(src.path(), out.path(), None).unwrap_err();
        assert!(matches!(err, Error::PassphraseError(_)));
    }

    #[test]
    fn test_tampered_inner_tar_fails_verification() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        source_tree(src.path());
        let pkg = build(src.path(), out.path(), Some("pw")).unwrap();

        let offset = {
            let mut outer = open_outer(&pkg).unwrap();
            let mut found = None;
            for entry in outer.entries().unwrap() {
                let entry = entry.unwrap();
                if outer_member(&entry.path().unwrap()) == Some(INNER_TAR) {
                    found = Some(entry.raw_file_position());
                }
            }
            found.unwrap()
        };

        let mut file = fs::OpenOptions::new().read(true).write(true).open(&pkg).unwrap();
        file.seek(SeekFrom::Start(offset + 600)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(offset + 600)).unwrap();
        file.write_all(&[byte[0] ^ 0xff]).unwrap();
        drop(file);

        let err = verify(&pkg).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(err.is_integrity());
        assert!(extract_metadata(&pkg).is_err());
    }

    #[test]
    fn test_not_a_package() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.tpkg");
        {
            let mut builder = tar::Builder::new(File::create(&bogus).unwrap());
            let data = b"hello";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, "bogus/readme", &data[..]).unwrap();
            builder.finish().unwrap();
        }
        let err = verify(&bogus).unwrap_err();
        assert!(matches!(err, Error::MalformedArchive(_)));
    }

    #[test]
    fn test_legacy_manifest_rejected_at_build() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        fs::write(src.path().join(LEGACY_METADATA_FILE), "<tpkg/>").unwrap();
        let err = build(src.path(), out.path(), None).unwrap_err();
        assert!(matches!(err, Error::MetadataError(_)));
    }
}
