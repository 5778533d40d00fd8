// tests/integration_test.rs

//! Integration tests for tpkg
//!
//! These tests build real packages with `archive::build` and drive them
//! through the repository, resolver and orchestrator.

use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tpkg::Error;
use tpkg::archive::{self, crypto};
use tpkg::config::Config;
use tpkg::host::HostFacts;
use tpkg::install::{ExitStatus, OperationReport, Options, Orchestrator};
use tpkg::installed::{InstalledStore, verify_installed};
use tpkg::lock::Lock;
use tpkg::metadata::Requirement;
use tpkg::repository::{NoNative, Repository};
use tpkg::resolver::{Pools, Resolver};

/// A scratch host: install base, root and a package directory
struct TestHost {
    work: TempDir,
    config: Config,
}

impl TestHost {
    fn new() -> Self {
        let work = tempfile::tempdir().unwrap();
        let mut config = Config::new(work.path().join("base"), work.path().join("root"));
        config.sources = vec![work.path().join("pkgs").display().to_string()];
        fs::create_dir_all(work.path().join("pkgs")).unwrap();
        Self { work, config }
    }

    fn pkgs(&self) -> PathBuf {
        self.work.path().join("pkgs")
    }

    /// Build a package from a manifest and relocatable files
    fn package(&self, manifest: &str, files: &[(&str, &str)]) -> PathBuf {
        self.build(manifest, files, None)
    }

    fn build(&self, manifest: &str, files: &[(&str, &str)], passphrase: Option<&str>) -> PathBuf {
        let src = tempfile::tempdir_in(self.work.path()).unwrap();
        fs::write(src.path().join("tpkg.yml"), manifest).unwrap();
        for (path, body) in files {
            let full = src.path().join("reloc").join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, body).unwrap();
        }
        archive::build(src.path(), &self.pkgs(), passphrase).unwrap()
    }

    fn run<F>(&self, options: Options, passphrase: &str, f: F) -> tpkg::Result<OperationReport>
    where
        F: FnOnce(&mut Orchestrator<'_>) -> tpkg::Result<OperationReport>,
    {
        let native = NoNative;
        let repo = Repository::load(&self.config, &native).unwrap();
        let mut orchestrator = Orchestrator::new(
            &self.config,
            repo,
            Box::new(crypto::FixedPassphrase(passphrase.to_string())),
            options,
        )
        .with_host(HostFacts::new("Linux", "x86_64"));
        f(&mut orchestrator)
    }

    fn install(&self, specs: &[&str]) -> tpkg::Result<OperationReport> {
        let specs: Vec<String> = specs.iter().map(|s| s.to_string()).collect();
        self.run(Options::default(), "", |o| o.install(&specs))
    }

    fn installed(&self) -> Vec<String> {
        InstalledStore::open(&self.config)
            .list()
            .unwrap()
            .into_iter()
            .map(|p| format!("{}-{}", p.name(), p.metadata.full_version()))
            .collect()
    }
}

fn manifest(name: &str, version: &str) -> String {
    format!("name: {}\nversion: '{}'\nmaintainer: test@example.com\n", name, version)
}

/// Rewrite a package with one byte of its inner tar flipped
fn tamper(path: &Path) {
    let mut members: Vec<(tar::Header, PathBuf, Vec<u8>)> = Vec::new();
    {
        let mut outer = tar::Archive::new(fs::File::open(path).unwrap());
        for entry in outer.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            if name.ends_with(archive::INNER_TAR) {
                let mid = data.len() / 2;
                data[mid] ^= 0xff;
            }
            members.push((entry.header().clone(), name, data));
        }
    }

    let mut builder = tar::Builder::new(fs::File::create(path).unwrap());
    for (mut header, name, data) in members {
        builder.append_data(&mut header, name, data.as_slice()).unwrap();
    }
    builder.finish().unwrap();
}

#[test]
fn test_build_verify_and_tamper_detection() {
    let host = TestHost::new();
    let pkg = host.package(&manifest("tool", "1.9"), &[("bin/tool", "#!/bin/sh\n")]);
    assert_eq!(pkg.file_name().unwrap(), "tool-1.9.tpkg");

    archive::verify(&pkg).unwrap();
    let md = archive::extract_metadata(&pkg).unwrap();
    assert_eq!(md.name, "tool");
    assert_eq!(md.filename.as_deref(), Some("tool-1.9.tpkg"));

    tamper(&pkg);
    let err = archive::verify(&pkg).unwrap_err();
    assert!(err.is_integrity(), "unexpected error {:?}", err);
    assert!(matches!(err, Error::ChecksumMismatch { .. }));
}

#[test]
fn test_unquoted_versions_order_numerically() {
    let host = TestHost::new();
    let old = host.package(
        "name: tool\nversion: 1.9\nmaintainer: test@example.com\n",
        &[("bin/tool", "old\n")],
    );
    let new = host.package(
        "name: tool\nversion: 1.10\nmaintainer: test@example.com\n",
        &[("bin/tool", "new\n")],
    );
    assert_eq!(old.file_name().unwrap(), "tool-1.9.tpkg");
    assert_eq!(new.file_name().unwrap(), "tool-1.10.tpkg");

    let report = host.install(&["tool"]).unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(host.installed(), vec!["tool-1.10"]);
    assert_eq!(fs::read_to_string(host.config.base.join("bin/tool")).unwrap(), "new\n");
}

#[test]
fn test_encrypted_file_install() {
    let host = TestHost::new();
    let manifest = format!(
        "{}files:\n  files:\n    - path: etc/secret\n      encrypt: true\n",
        manifest("vault", "1.0")
    );
    let pkg = host.build(&manifest, &[("etc/secret", "hunter2\n")], Some("correct horse"));

    // Encrypted inside the archive
    let unpacked = tempfile::tempdir().unwrap();
    let tpkg_dir = archive::unpack(&pkg, unpacked.path()).unwrap();
    let stored = fs::read(tpkg_dir.join("reloc/etc/secret")).unwrap();
    assert!(crypto::is_encrypted(&stored));

    let specs = vec![pkg.display().to_string()];
    let report = host
        .run(Options::default(), "correct horse", |o| o.install(&specs))
        .unwrap();
    assert!(report.status.is_success(), "{:?}", report.failures);
    assert_eq!(
        fs::read_to_string(host.config.base.join("etc/secret")).unwrap(),
        "hunter2\n"
    );

    // The ledger holds plaintext checksums
    let store = InstalledStore::open(&host.config);
    let vault = store.find("vault").unwrap().remove(0);
    assert!(verify_installed(&vault, &host.config).unwrap().is_clean());
}

#[test]
fn test_resolver_prefers_os_specific_and_fewest_downgrades() {
    let host = TestHost::new();
    host.package(
        &format!(
            "{}dependencies:\n  - name: b\n  - name: c\n    minimum_version: '1.1'\n    maximum_version: '1.2'\n",
            manifest("a", "1.0")
        ),
        &[],
    );
    host.package(&manifest("b", "1.0"), &[]);
    host.package(
        &format!("{}operatingsystem:\n  - Linux\n", manifest("b", "1.0")),
        &[],
    );
    for minor in 0..4 {
        let version = format!("1.{}", minor);
        host.package(
            &format!(
                "{}dependencies:\n  - name: d\n    minimum_version: '{v}'\n    maximum_version: '{v}'\n",
                manifest("c", &version),
                v = version
            ),
            &[],
        );
        host.package(&manifest("d", &version), &[]);
    }

    let native = NoNative;
    let repo = Repository::load(&host.config, &native).unwrap();
    assert_eq!(repo.available().len(), 11);

    let facts = HostFacts::new("Linux", "x86_64");
    let solution = Resolver::new(&repo, &facts)
        .resolve(&[Requirement::named("a")], Pools::new(), &["a".to_string()])
        .unwrap();

    let mut picked: Vec<String> = solution.iter().map(|c| c.metadata.package_filename()).collect();
    picked.sort();
    assert_eq!(
        picked,
        vec!["a-1.0.tpkg", "b-1.0-Linux.tpkg", "c-1.2.tpkg", "d-1.2.tpkg"]
    );
}

#[test]
fn test_installed_dependency_preferred_over_newer() {
    let host = TestHost::new();
    let lib1 = host.package(&manifest("lib", "1.0"), &[("lib/liblib.so", "v1")]);
    host.install(&[lib1.to_str().unwrap()]).unwrap();

    host.package(&manifest("lib", "2.0"), &[("lib/liblib.so", "v2")]);
    host.package(
        &format!("{}dependencies:\n  - name: lib\n", manifest("app", "1.0")),
        &[("bin/app", "app")],
    );

    let report = host.install(&["app"]).unwrap();
    assert!(report.status.is_success());
    assert_eq!(report.installed, vec!["app-1.0"]);
    assert_eq!(host.installed(), vec!["app-1.0", "lib-1.0"]);
    assert_eq!(
        fs::read_to_string(host.config.base.join("lib/liblib.so")).unwrap(),
        "v1"
    );
}

#[test]
fn test_file_conflicts_are_rejected() {
    let host = TestHost::new();
    host.package(&manifest("one", "1.0"), &[("bin/shared", "one")]);
    host.package(&manifest("two", "1.0"), &[("bin/shared", "two")]);

    host.install(&["one"]).unwrap();
    let err = host.install(&["two"]).unwrap_err();
    assert!(matches!(err, Error::ConflictError(_)), "unexpected error {:?}", err);
    assert_eq!(fs::read_to_string(host.config.base.join("bin/shared")).unwrap(), "one");
    assert_eq!(host.installed(), vec!["one-1.0"]);

    // Both at once conflict with each other
    let fresh = TestHost::new();
    fresh.package(&manifest("one", "1.0"), &[("bin/shared", "one")]);
    fresh.package(&manifest("two", "1.0"), &[("bin/shared", "two")]);
    let err = fresh.install(&["one", "two"]).unwrap_err();
    assert!(matches!(err, Error::ConflictError(_)));
    assert!(fresh.installed().is_empty());
}

#[test]
fn test_removal_leaves_other_packages_alone() {
    let host = TestHost::new();
    host.package(&manifest("one", "1.0"), &[("share/one/README", "one")]);
    host.package(&manifest("two", "1.0"), &[("share/two/README", "two")]);
    host.install(&["one", "two"]).unwrap();

    let report = host
        .run(Options::default(), "", |o| o.remove(&["one".to_string()]))
        .unwrap();
    assert!(report.status.is_success());
    assert_eq!(report.removed, vec!["one-1.0"]);

    assert!(!host.config.base.join("share/one").exists());
    assert_eq!(
        fs::read_to_string(host.config.base.join("share/two/README")).unwrap(),
        "two"
    );
    assert_eq!(host.installed(), vec!["two-1.0"]);
}

#[test]
fn test_scripts_and_exit_bits() {
    let host = TestHost::new();
    let src = tempfile::tempdir_in(host.work.path()).unwrap();
    fs::write(src.path().join("tpkg.yml"), manifest("svc", "1.0")).unwrap();
    fs::create_dir_all(src.path().join("reloc/bin")).unwrap();
    fs::write(src.path().join("reloc/bin/svc"), "svc").unwrap();
    for (script, body) in [
        ("postinstall", "#!/bin/sh\nexit 1\n"),
        ("postremove", "#!/bin/sh\nexit 1\n"),
    ] {
        let path = src.path().join(script);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    archive::build(src.path(), &host.pkgs(), None).unwrap();

    let report = host.install(&["svc"]).unwrap();
    assert!(report.status.contains(ExitStatus::POSTINSTALL_FAILED));
    assert_eq!(report.status.code(), 2);

    let report = host
        .run(Options::default(), "", |o| o.remove(&["svc".to_string()]))
        .unwrap();
    assert!(report.status.contains(ExitStatus::POSTREMOVE_FAILED));
    assert_eq!(report.status.code(), 4);
    assert!(host.installed().is_empty());
}

#[test]
fn test_lock_reentrant_and_exclusive() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("lock");

    let lock = Lock::new(&dir, false);
    let outer = lock.acquire().unwrap();
    let inner = lock.acquire().unwrap();
    drop(inner);
    assert!(dir.exists());

    // Another holder while this process is alive
    let other = Lock::new(&dir, false);
    let err = other.acquire().err().unwrap();
    assert!(matches!(err, Error::LockError(_)));

    drop(outer);
    assert!(!dir.exists());

    // A lock left by an exited process is reclaimed
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead = child.id();
    child.wait().unwrap();
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("pid"), dead.to_string()).unwrap();

    let reclaimed = Lock::new(&dir, false);
    let guard = reclaimed.acquire().unwrap();
    assert_eq!(
        fs::read_to_string(dir.join("pid")).unwrap(),
        std::process::id().to_string()
    );
    drop(guard);

    // A holder that has created the directory but not yet written its pid
    fs::create_dir_all(&dir).unwrap();
    let err = Lock::new(&dir, false).acquire().err().unwrap();
    assert!(matches!(err, Error::LockError(_)));
    assert!(dir.exists());

    let forced = Lock::new(&dir, true);
    assert!(forced.acquire().is_ok());
}

#[test]
fn test_upgrade_into_declared_conflict() {
    let host = TestHost::new();
    host.package(&manifest("x", "1.0"), &[("bin/x", "x1")]);
    host.package(&manifest("y", "1.0"), &[("bin/y", "y")]);
    host.install(&["x", "y"]).unwrap();

    host.package(
        &format!("{}conflicts:\n  - name: y\n", manifest("x", "2.0")),
        &[("bin/x", "x2")],
    );

    let upgrade = |options: Options| host.run(options, "", |o| o.upgrade(&["x".to_string()]));

    let err = upgrade(Options::default()).unwrap_err();
    assert!(matches!(err, Error::ConflictError(_)), "unexpected error {:?}", err);
    assert_eq!(host.installed(), vec!["x-1.0", "y-1.0"]);

    let report = upgrade(Options {
        force_replace: true,
        ..Default::default()
    })
    .unwrap();
    assert!(report.status.is_success(), "{:?}", report.failures);
    assert_eq!(report.installed, vec!["x-2.0"]);
    assert!(report.removed.contains(&"y-1.0".to_string()));
    assert_eq!(host.installed(), vec!["x-2.0"]);
    assert_eq!(fs::read_to_string(host.config.base.join("bin/x")).unwrap(), "x2");
    assert!(!host.config.base.join("bin/y").exists());
}
