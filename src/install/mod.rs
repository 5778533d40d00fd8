// src/install/mod.rs

//! Install, upgrade and remove
//!
//! An operation resolves the requested packages against the repository,
//! checks the plan for package and file conflicts, and then executes it
//! one package at a time in dependency order. Resolution, download and
//! conflict errors abort the whole operation before anything on disk
//! changes. Once execution starts, a failure only aborts the package it
//! happened in; it is recorded in the [`OperationReport`] and the run
//! carries on with the rest.
//!
//! Per package, installation goes: unpack, remove the version being
//! replaced, preinstall, external hook data, permissions, decryption,
//! external hooks, file placement, init script and crontab links,
//! postinstall, record.
//! Removal is the inverse: preremove, external hooks, unlink, delete
//! files, postremove, forget the record.

pub mod files;
pub mod links;
pub mod permissions;
pub mod scripts;

use crate::archive::{self, crypto, crypto::PassphraseSource};
use crate::config::Config;
use crate::db::{
    self,
    models::{Changeset, ChangesetStatus, EventAction, Operation, PackageEvent},
};
use crate::error::{Error, Result};
use crate::host::HostFacts;
use crate::installed::{InstalledPackage, InstalledStore};
use crate::lock::Lock;
use crate::metadata::ledger::LEDGER_FILE;
use crate::metadata::{External, FileLedger, Metadata, Requirement};
use crate::repository::Repository;
use crate::repository::native::NativePackage;
use crate::resolver::{Candidate, CandidateProvider, Pools, Resolver, Solution, Source, matches};
use crate::version;
use rusqlite::Connection;
use scripts::HookAction;
use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Bitmask exit status of an operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus(u8);

impl ExitStatus {
    /// At least one package failed
    pub const FAILURE: u8 = 1;
    pub const POSTINSTALL_FAILED: u8 = 2;
    pub const POSTREMOVE_FAILED: u8 = 4;
    pub const INIT_SCRIPT_FAILED: u8 = 8;

    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn contains(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }

    pub fn code(&self) -> i32 {
        i32::from(self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Continue past failed pre-scripts, file conflicts and broken dependents
    pub force: bool,
    /// Remove installed packages that conflict with the plan
    pub force_replace: bool,
    /// Allow upgrade to pick versions older than the installed one
    pub downgrade: bool,
    /// Take the repository lock regardless of its holder
    pub force_unlock: bool,
}

/// What an operation did
#[derive(Debug, Default)]
pub struct OperationReport {
    pub status: ExitStatus,
    pub installed: Vec<String>,
    pub removed: Vec<String>,
    /// (package, error) for every package that failed
    pub failures: Vec<(String, String)>,
    pub warnings: Vec<String>,
}

impl OperationReport {
    pub fn warn(&mut self, msg: String) {
        warn!("{}", msg);
        self.warnings.push(msg);
    }

    pub fn fail(&mut self, package: &str, msg: String) {
        warn!("{} failed: {}", package, msg);
        self.status.set(ExitStatus::FAILURE);
        self.failures.push((package.to_string(), msg));
    }
}

/// One package to install
struct Step {
    candidate: Candidate,
    /// Installed packages this one takes the place of
    replaces: Vec<InstalledPackage>,
    /// Local package file once fetched
    file: Option<PathBuf>,
}

fn installed_candidate(pkg: &InstalledPackage) -> Candidate {
    Candidate::new(pkg.metadata.clone(), Source::Installed)
}

fn label(metadata: &Metadata) -> String {
    format!("{}-{}", metadata.name, metadata.full_version())
}

fn describe_specs(specs: &[String]) -> String {
    if specs.is_empty() {
        "all installed packages".to_string()
    } else {
        specs.join(" ")
    }
}

/// Does either package declare a conflict with the other?
fn in_conflict(a: &Candidate, b: &Candidate, host: &HostFacts) -> bool {
    a.metadata.conflicts.iter().any(|req| matches(b, req, host))
        || b.metadata.conflicts.iter().any(|req| matches(a, req, host))
}

/// Requirements that keep installed packages (other than `skip`) and
/// their dependencies satisfied
fn installed_requirements(installed: &[InstalledPackage], skip: &[String]) -> Vec<Requirement> {
    let mut reqs: Vec<Requirement> = Vec::new();
    for pkg in installed.iter().filter(|p| !skip.iter().any(|s| s == p.name())) {
        let named = Requirement::named(pkg.name());
        if !reqs.contains(&named) {
            reqs.push(named);
        }
        for dep in pkg.metadata.dependency_requirements() {
            if !reqs.contains(&dep) {
                reqs.push(dep);
            }
        }
    }
    reqs
}

/// Order packages so each goes before anything it depends on
fn removal_order(mut pending: Vec<InstalledPackage>) -> Vec<InstalledPackage> {
    let mut ordered = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let next = (0..pending.len())
            .find(|&i| {
                let name = pending[i].name();
                !pending
                    .iter()
                    .enumerate()
                    .any(|(j, other)| j != i && other.metadata.dependencies.iter().any(|d| d.name == name))
            })
            // Circular dependencies
            .unwrap_or(0);
        ordered.push(pending.remove(next));
    }
    ordered
}

pub struct Orchestrator<'a> {
    config: &'a Config,
    repo: Repository<'a>,
    host: HostFacts,
    passphrase: Box<dyn PassphraseSource + 'a>,
    options: Options,
    store: InstalledStore,
    confirm: Option<Box<dyn FnMut(&str) -> bool + 'a>>,
    history: Option<Connection>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a Config,
        repo: Repository<'a>,
        passphrase: Box<dyn PassphraseSource + 'a>,
        options: Options,
    ) -> Self {
        Self {
            config,
            repo,
            host: HostFacts::detect(),
            passphrase,
            options,
            store: InstalledStore::open(config),
            confirm: None,
            history: None,
        }
    }

    pub fn with_host(mut self, host: HostFacts) -> Self {
        self.host = host;
        self
    }

    /// Ask before overriding file conflicts; only consulted when the
    /// configuration allows prompting
    pub fn with_confirm(mut self, confirm: impl FnMut(&str) -> bool + 'a) -> Self {
        self.confirm = Some(Box::new(confirm));
        self
    }

    pub fn repository(&self) -> &Repository<'a> {
        &self.repo
    }

    fn prepare(&mut self) -> Result<()> {
        self.config.ensure_dirs()?;
        self.repo.refresh_installed(self.config)
    }

    /// Install the requested packages and whatever they depend on
    ///
    /// Requested names that are already installed stay as they are
    /// unless the request pins a different version.
    pub fn install(&mut self, specs: &[String]) -> Result<OperationReport> {
        let lock = Lock::new(self.config.lock_dir(), self.options.force_unlock);
        let _guard = lock.acquire()?;
        self.prepare()?;

        let mut report = OperationReport::default();
        if specs.is_empty() {
            return Ok(report);
        }

        let mut requests = Vec::new();
        for spec in specs {
            requests.push(self.repo.parse_request(spec)?);
        }
        let installed = self.store.list()?;
        let core: Vec<String> = requests.iter().map(|r| r.name.clone()).collect();

        let mut requirements = requests;
        requirements.extend(installed_requirements(&installed, &core));

        let solution = Resolver::new(&self.repo, &self.host).resolve(&requirements, Pools::new(), &core)?;
        self.apply(Operation::Install, describe_specs(specs), solution, &installed, &mut report)?;
        Ok(report)
    }

    /// Upgrade the requested packages, or every installed package
    pub fn upgrade(&mut self, specs: &[String]) -> Result<OperationReport> {
        let lock = Lock::new(self.config.lock_dir(), self.options.force_unlock);
        let _guard = lock.acquire()?;
        self.prepare()?;

        let installed = self.store.list()?;
        let mut requests: Vec<Requirement> = Vec::new();
        if specs.is_empty() {
            for pkg in &installed {
                if !requests.iter().any(|r| r.name == pkg.name()) {
                    requests.push(Requirement::named(pkg.name()));
                }
            }
        } else {
            for spec in specs {
                requests.push(self.repo.parse_request(spec)?);
            }
        }

        if !self.options.downgrade {
            for req in &mut requests {
                let Some(current) = installed.iter().find(|p| p.name() == req.name) else {
                    continue;
                };
                match &req.minimum_version {
                    Some(min) if version::compare(min, &current.metadata.version) == Ordering::Less => {
                        return Err(Error::NoSolution(format!(
                            "{} {} is older than the installed {}; downgrading must be requested explicitly",
                            req.name,
                            min,
                            current.metadata.full_version()
                        )));
                    }
                    Some(_) => {}
                    None if req.filename.is_none() => {
                        req.minimum_version = Some(current.metadata.version.clone());
                        req.minimum_package_version = current.metadata.package_version.clone();
                    }
                    None => {}
                }
            }
        }

        // Installed versions compete on version alone for upgraded names
        let mut pools = Pools::new();
        for req in &requests {
            let pool = self
                .repo
                .candidates(req)
                .into_iter()
                .map(|c| Rc::new(c.preferred(false)))
                .collect();
            pools.insert(req.name.clone(), pool);
        }

        let core: Vec<String> = requests.iter().map(|r| r.name.clone()).collect();
        let mut requirements = requests;
        requirements.extend(installed_requirements(&installed, &core));

        let solution = Resolver::new(&self.repo, &self.host).resolve(&requirements, pools, &core)?;
        let mut report = OperationReport::default();
        self.apply(Operation::Upgrade, describe_specs(specs), solution, &installed, &mut report)?;
        Ok(report)
    }

    /// Remove the requested packages, or every installed package
    pub fn remove(&mut self, specs: &[String]) -> Result<OperationReport> {
        let lock = Lock::new(self.config.lock_dir(), self.options.force_unlock);
        let _guard = lock.acquire()?;
        self.prepare()?;

        let mut report = OperationReport::default();
        let installed = self.store.list()?;
        let targets = self.select_installed(specs, &installed)?;

        let remaining: Vec<&InstalledPackage> = installed
            .iter()
            .filter(|p| !targets.iter().any(|t| t.dir == p.dir))
            .collect();

        let mut broken = Vec::new();
        for pkg in &remaining {
            for dep in pkg.metadata.dependency_requirements() {
                let removed = targets.iter().any(|t| t.name() == dep.name);
                let still_met = remaining
                    .iter()
                    .any(|o| matches(&installed_candidate(o), &dep, &self.host));
                if removed && !still_met {
                    broken.push(format!("{} depends on {}", pkg.name(), dep));
                }
            }
        }
        if !broken.is_empty() {
            let detail = broken.join(", ");
            if !self.options.force {
                return Err(Error::ConflictError(format!(
                    "removal would break installed packages: {}",
                    detail
                )));
            }
            report.warn(format!("Removing packages others depend on (forced): {}", detail));
        }

        let changeset = self.begin(Operation::Remove, describe_specs(specs));
        let changeset_id = changeset.as_ref().and_then(|c| c.id);

        for pkg in removal_order(targets) {
            let result = self.remove_package(&pkg, &[], &HashSet::new(), &mut report);
            if let Err(e) = &result {
                report.fail(pkg.name(), e.to_string());
            }
            self.record_event(
                changeset_id,
                EventAction::Remove,
                &pkg.metadata,
                result.err().map(|e| e.to_string()),
            );
        }

        self.finish(changeset, &report);
        Ok(report)
    }

    /// Installed packages named by removal requests
    fn select_installed(&self, specs: &[String], installed: &[InstalledPackage]) -> Result<Vec<InstalledPackage>> {
        if specs.is_empty() {
            return Ok(installed.to_vec());
        }

        let mut selected: Vec<InstalledPackage> = Vec::new();
        for spec in specs {
            let found: Vec<&InstalledPackage> = if spec.ends_with(".tpkg") {
                let filename = Path::new(spec)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                installed
                    .iter()
                    .filter(|p| p.metadata.filename.as_deref() == Some(filename.as_str()))
                    .collect()
            } else {
                let req = Requirement::parse_request(spec)?;
                installed
                    .iter()
                    .filter(|p| matches(&installed_candidate(p), &req, &self.host))
                    .collect()
            };

            if found.is_empty() {
                return Err(Error::NotFoundError(format!("{} is not installed", spec)));
            }
            for pkg in found {
                if !selected.iter().any(|s| s.dir == pkg.dir) {
                    selected.push(pkg.clone());
                }
            }
        }
        Ok(selected)
    }

    /// Check and execute a resolved solution
    fn apply(
        &mut self,
        operation: Operation,
        description: String,
        solution: Solution,
        installed: &[InstalledPackage],
        report: &mut OperationReport,
    ) -> Result<()> {
        let mut processed: HashSet<String> = HashSet::new();
        let mut steps = Vec::new();

        for candidate in solution {
            if candidate.is_installed() {
                debug!("{} is already installed", candidate);
                processed.insert(candidate.name().to_string());
                continue;
            }
            let replaces = if candidate.is_native() {
                Vec::new()
            } else {
                installed
                    .iter()
                    .filter(|p| p.name() == candidate.name())
                    .cloned()
                    .collect()
            };
            steps.push(Step {
                candidate,
                replaces,
                file: None,
            });
        }

        if steps.is_empty() {
            info!("Nothing to do, requested packages are installed");
            return Ok(());
        }

        self.check_package_conflicts(&mut steps, installed, report)?;

        for step in steps.iter_mut().filter(|s| !s.candidate.is_native()) {
            step.file = Some(self.repo.fetch(&step.candidate, self.config)?);
        }

        self.check_file_conflicts(&steps, installed, report)?;

        let changeset = self.begin(operation, description);
        let changeset_id = changeset.as_ref().and_then(|c| c.id);

        let planned: HashSet<String> = steps.iter().map(|s| s.candidate.name().to_string()).collect();
        let mut failed: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<Step> = steps.into();
        let mut deferred = 0;

        while let Some(step) = queue.pop_front() {
            let name = step.candidate.name().to_string();
            let deps: Vec<&str> = step
                .candidate
                .metadata
                .dependencies
                .iter()
                .map(|d| d.name.as_str())
                .filter(|d| *d != name)
                .collect();

            if let Some(dep) = deps.iter().find(|d| failed.contains(**d)) {
                let msg = format!("dependency {} was not installed", dep);
                report.fail(&name, msg.clone());
                self.record_event(changeset_id, EventAction::Install, &step.candidate.metadata, Some(msg));
                failed.insert(name);
                deferred = 0;
                continue;
            }

            let ready = deps.iter().all(|d| processed.contains(*d) || !planned.contains(*d));
            if !ready {
                if deferred <= queue.len() {
                    debug!("Deferring {} until its dependencies are installed", name);
                    deferred += 1;
                    queue.push_back(step);
                    continue;
                }
                warn!("Installing {} ahead of its dependencies (circular dependency)", name);
            }
            deferred = 0;

            let result = self.execute(&step, changeset_id, report);
            match &result {
                Ok(()) => {
                    processed.insert(name);
                }
                Err(e) => {
                    report.fail(&name, e.to_string());
                    failed.insert(name);
                }
            }
            self.record_event(
                changeset_id,
                EventAction::Install,
                &step.candidate.metadata,
                result.err().map(|e| e.to_string()),
            );
        }

        self.finish(changeset, report);
        Ok(())
    }

    /// Declared conflicts between the plan and installed or co-planned packages
    fn check_package_conflicts(
        &self,
        steps: &mut [Step],
        installed: &[InstalledPackage],
        report: &mut OperationReport,
    ) -> Result<()> {
        let mut gone: HashSet<PathBuf> = steps
            .iter()
            .flat_map(|s| s.replaces.iter().map(|p| p.dir.clone()))
            .collect();

        for i in 0..steps.len() {
            let planned = steps[i].candidate.clone();

            let mut evicted = Vec::new();
            for pkg in installed {
                if gone.contains(&pkg.dir) {
                    continue;
                }
                if !in_conflict(&planned, &installed_candidate(pkg), &self.host) {
                    continue;
                }
                let msg = format!("{} conflicts with installed {}", planned, label(&pkg.metadata));
                if !self.options.force_replace {
                    return Err(Error::ConflictError(msg));
                }
                report.warn(format!("{}; removing it", msg));
                gone.insert(pkg.dir.clone());
                evicted.push(pkg.clone());
            }
            steps[i].replaces.extend(evicted);

            for other in steps.iter().skip(i + 1) {
                if in_conflict(&planned, &other.candidate, &self.host) {
                    let msg = format!("{} conflicts with {}", planned, other.candidate);
                    if !self.options.force_replace {
                        return Err(Error::ConflictError(msg));
                    }
                    report.warn(format!("{} (installing both, forced)", msg));
                }
            }
        }
        Ok(())
    }

    /// Files the plan would place over files of other packages
    ///
    /// Directories are never conflicts.
    fn check_file_conflicts(
        &mut self,
        steps: &[Step],
        installed: &[InstalledPackage],
        report: &mut OperationReport,
    ) -> Result<()> {
        let config = self.config;
        let gone: HashSet<&Path> = steps
            .iter()
            .flat_map(|s| s.replaces.iter().map(|p| p.dir.as_path()))
            .collect();

        let mut owned: Vec<(String, HashSet<PathBuf>)> = installed
            .iter()
            .filter(|p| !gone.contains(p.dir.as_path()))
            .map(|p| (format!("installed {}", label(&p.metadata)), p.files(config).into_iter().collect()))
            .collect();

        let mut conflicts = Vec::new();
        for step in steps {
            let Some(file) = &step.file else {
                continue;
            };
            let ledger = archive::read_ledger(file)?;
            let ours: HashSet<PathBuf> = ledger.installed_files(&config.root, &config.base).into_iter().collect();

            for (owner, theirs) in &owned {
                let mut shared: Vec<&PathBuf> = ours.intersection(theirs).collect();
                shared.sort();
                for path in shared {
                    conflicts.push(format!("{} and {} both contain {}", step.candidate, owner, path.display()));
                }
            }
            owned.push((step.candidate.to_string(), ours));
        }

        if conflicts.is_empty() {
            return Ok(());
        }

        let summary = conflicts.join("\n");
        if self.options.force {
            report.warn(format!("Overwriting conflicting files (forced):\n{}", summary));
            return Ok(());
        }
        if config.prompt
            && let Some(confirm) = self.confirm.as_mut()
            && confirm(summary.as_str())
        {
            report.warn(format!("Overwriting conflicting files (confirmed):\n{}", summary));
            return Ok(());
        }
        Err(Error::ConflictError(summary))
    }

    fn execute(&mut self, step: &Step, changeset_id: Option<i64>, report: &mut OperationReport) -> Result<()> {
        if step.candidate.source == Source::NativeAvailable {
            let md = &step.candidate.metadata;
            info!("Installing native package {}", step.candidate);
            self.repo
                .native()
                .install(&NativePackage::new(&md.name, &md.version, md.package_version.as_deref()))?;
            report.installed.push(label(md));
            return Ok(());
        }

        let file = step
            .file
            .as_deref()
            .ok_or_else(|| Error::NotFoundError(format!("{} has no package file", step.candidate)))?;
        self.install_package(file, &step.candidate, &step.replaces, changeset_id, report)
    }

    fn install_package(
        &mut self,
        file: &Path,
        candidate: &Candidate,
        replaces: &[InstalledPackage],
        changeset_id: Option<i64>,
        report: &mut OperationReport,
    ) -> Result<()> {
        let config = self.config;
        let work = tempfile::Builder::new()
            .prefix("install")
            .tempdir_in(config.tmp_dir())
            .map_err(|e| Error::IoError(format!("Failed to create unpack directory: {}", e)))?;
        let tpkg_dir = archive::unpack(file, work.path())?;

        let mut metadata = Metadata::load_from_dir(&tpkg_dir)?;
        metadata.filename = candidate
            .metadata
            .filename
            .clone()
            .or_else(|| file.file_name().map(|n| n.to_string_lossy().into_owned()));

        // Datascripts run after preinstall; until then only hooks with
        // static data can be matched against a replaced version's
        let static_externals = metadata
            .externals
            .iter()
            .filter(|e| e.datascript.is_none())
            .map(|e| scripts::resolve_external(e, &tpkg_dir))
            .collect::<Result<Vec<_>>>()?;

        let ledger_path = tpkg_dir.join(LEDGER_FILE);
        let mut ledger = if ledger_path.exists() {
            FileLedger::read(&ledger_path)?
        } else {
            FileLedger::scan(&tpkg_dir, &[])?
        };
        let package_file = metadata.filename.clone().unwrap_or_else(|| metadata.package_filename());
        let name = label(&metadata);

        // Paths the new version ships are overwritten, not deleted
        let keep: HashSet<PathBuf> = ledger
            .installed_paths(&config.root, &config.base)
            .into_iter()
            .collect();
        for old in replaces {
            info!("Replacing {} with {}", label(&old.metadata), name);
            let result = self.remove_package(old, &static_externals, &keep, report);
            let outcome = result.as_ref().err().map(|e| e.to_string());
            self.record_event(changeset_id, EventAction::Remove, &old.metadata, outcome);
            result?;
        }

        match scripts::run_script(&tpkg_dir.join("preinstall"), &name, &tpkg_dir, &config.base) {
            Ok(_) => {}
            Err(e) if self.options.force => report.warn(format!("{} (continuing, forced)", e)),
            Err(e) => return Err(e),
        }

        metadata.externals = metadata
            .externals
            .iter()
            .map(|e| scripts::resolve_external(e, &tpkg_dir))
            .collect::<Result<Vec<_>>>()?;

        permissions::Normalizer::new(permissions::is_privileged(), &mut report.warnings)
            .normalize(&tpkg_dir, &metadata, &ledger, config)?;

        for entry in metadata.files.files.iter().filter(|f| f.is_encrypted()) {
            let path = entry.package_path(&tpkg_dir);
            if path.is_file() {
                crypto::decrypt_file(&path, self.passphrase.as_mut())?;
            }
        }

        // The installed record keeps the normalized modes and ownership
        ledger.refresh_attributes(&tpkg_dir);
        ledger.write(&ledger_path)?;

        let common: Vec<&External> = replaces
            .iter()
            .flat_map(|p| p.metadata.externals.iter())
            .filter(|e| static_externals.contains(*e))
            .collect();
        for external in metadata.externals.iter().filter(|e| !common.contains(e)) {
            if let Err(e) = scripts::run_external(&config.externals_dir, external, &package_file, HookAction::Install) {
                report.warn(e.to_string());
            }
        }

        files::place_tree(&tpkg_dir, &ledger, &metadata, config, &mut report.warnings)?;

        for entry in &metadata.files.files {
            let installed_path = config.install_path(&entry.path);
            if let Some(init) = &entry.init
                && let Err(e) = links::install_init_script(config, init, &installed_path)
            {
                report.status.set(ExitStatus::INIT_SCRIPT_FAILED);
                return Err(e);
            }
            if entry.crontab.is_some() {
                links::install_crontab(config, &installed_path)?;
            }
        }

        if let Err(e) = scripts::run_script(&tpkg_dir.join("postinstall"), &name, &tpkg_dir, &config.base) {
            report.status.set(ExitStatus::POSTINSTALL_FAILED);
            report.warn(e.to_string());
        }

        self.store.record(&metadata, &tpkg_dir)?;
        info!("Installed {}", name);
        report.installed.push(name);
        Ok(())
    }

    /// Remove one installed package
    ///
    /// `keep_externals` and `keep` are what a replacing package brings
    /// along: those hooks are not run and those paths are not deleted.
    fn remove_package(
        &mut self,
        pkg: &InstalledPackage,
        keep_externals: &[External],
        keep: &HashSet<PathBuf>,
        report: &mut OperationReport,
    ) -> Result<()> {
        let config = self.config;
        let name = label(&pkg.metadata);

        if let Some(script) = pkg.script("preremove") {
            match scripts::run_script(&script, &name, &pkg.dir, &config.base) {
                Ok(_) => {}
                Err(e) if self.options.force => report.warn(format!("{} (continuing, forced)", e)),
                Err(e) => return Err(e),
            }
        }

        let package_file = pkg
            .metadata
            .filename
            .clone()
            .unwrap_or_else(|| pkg.metadata.package_filename());
        for external in pkg.metadata.externals.iter().filter(|e| !keep_externals.contains(*e)) {
            if let Err(e) = scripts::run_external(&config.externals_dir, external, &package_file, HookAction::Remove) {
                report.warn(e.to_string());
            }
        }

        for entry in &pkg.metadata.files.files {
            let installed_path = config.install_path(&entry.path);
            if let Some(init) = &entry.init
                && let Err(e) = links::remove_init_script(config, init, &installed_path)
            {
                report.warn(e.to_string());
            }
            if entry.crontab.is_some()
                && let Err(e) = links::remove_crontab(config, &installed_path)
            {
                report.warn(e.to_string());
            }
        }

        let mut shared = keep.clone();
        for other in self.store.list()?.iter().filter(|o| o.dir != pkg.dir) {
            shared.extend(other.ledger.installed_paths(&config.root, &config.base));
        }
        let deleted = files::remove_installed(&pkg.ledger, config, &shared, &mut report.warnings);
        debug!("Deleted {} path(s) of {}", deleted, name);

        if let Some(script) = pkg.script("postremove")
            && let Err(e) = scripts::run_script(&script, &name, &pkg.dir, &config.base)
        {
            report.status.set(ExitStatus::POSTREMOVE_FAILED);
            report.warn(e.to_string());
        }

        self.store.forget(pkg)?;
        info!("Removed {}", name);
        report.removed.push(name);
        Ok(())
    }

    fn begin(&mut self, operation: Operation, description: String) -> Option<Changeset> {
        if self.history.is_none() {
            match db::init(&self.config.history_db()) {
                Ok(conn) => self.history = Some(conn),
                Err(e) => {
                    warn!("Operation history unavailable: {}", e);
                    return None;
                }
            }
        }

        let conn = self.history.as_ref()?;
        let mut changeset = Changeset::new(operation, description);
        match changeset.insert(conn) {
            Ok(_) => Some(changeset),
            Err(e) => {
                warn!("Failed to record changeset: {}", e);
                None
            }
        }
    }

    fn record_event(&self, changeset_id: Option<i64>, action: EventAction, metadata: &Metadata, error: Option<String>) {
        let (Some(conn), Some(id)) = (self.history.as_ref(), changeset_id) else {
            return;
        };

        let mut event = PackageEvent::new(id, action, metadata.name.clone(), metadata.version.clone());
        event.package_version = metadata.package_version.clone();
        event.filename = metadata.filename.clone();
        if let Some(msg) = error {
            event.succeeded = false;
            event.message = Some(msg);
        }
        if let Err(e) = event.insert(conn) {
            warn!("Failed to record history event: {}", e);
        }
    }

    fn finish(&self, changeset: Option<Changeset>, report: &OperationReport) {
        let (Some(conn), Some(mut changeset)) = (self.history.as_ref(), changeset) else {
            return;
        };

        let status = if report.status.contains(ExitStatus::FAILURE) {
            ChangesetStatus::Failed
        } else {
            ChangesetStatus::Applied
        };
        if let Err(e) = changeset.finish(conn, status, report.status.code()) {
            warn!("Failed to finish changeset: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::crypto::FixedPassphrase;
    use crate::repository::native::NoNative;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    struct Fixture {
        work: tempfile::TempDir,
        config: Config,
    }

    impl Fixture {
        fn new() -> Self {
            let work = tempfile::tempdir().unwrap();
            let config = Config::new(work.path().join("base"), work.path().join("root"));
            Self { work, config }
        }

        /// Build a package with relocatable files and scripts
        fn package(&self, manifest: &str, files: &[(&str, &str)], scripts: &[(&str, &str)]) -> String {
            let src = tempfile::tempdir_in(self.work.path()).unwrap();
            fs::write(src.path().join("tpkg.yml"), manifest).unwrap();
            for (path, body) in files {
                let full = src.path().join("reloc").join(path);
                fs::create_dir_all(full.parent().unwrap()).unwrap();
                fs::write(full, body).unwrap();
            }
            for (script, body) in scripts {
                let path = src.path().join(script);
                fs::write(&path, body).unwrap();
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            }
            archive::build(src.path(), &self.work.path().join("pkgs"), None)
                .unwrap()
                .display()
                .to_string()
        }

        fn run<F>(&self, options: Options, f: F) -> Result<OperationReport>
        where
            F: FnOnce(&mut Orchestrator<'_>) -> Result<OperationReport>,
        {
            let native = NoNative;
            let repo = Repository::new(Vec::new(), Vec::new(), &native);
            let mut orchestrator = Orchestrator::new(
                &self.config,
                repo,
                Box::new(FixedPassphrase("pw".to_string())),
                options,
            )
            .with_host(HostFacts::new("Linux", "x86_64"));
            f(&mut orchestrator)
        }
    }

    fn store_names(config: &Config) -> Vec<String> {
        InstalledStore::open(config)
            .list()
            .unwrap()
            .into_iter()
            .map(|p| label(&p.metadata))
            .collect()
    }

    #[test]
    fn test_exit_status_bits() {
        let mut status = ExitStatus::default();
        assert!(status.is_success());
        status.set(ExitStatus::POSTINSTALL_FAILED);
        status.set(ExitStatus::INIT_SCRIPT_FAILED);
        assert!(status.contains(ExitStatus::POSTINSTALL_FAILED));
        assert!(!status.contains(ExitStatus::FAILURE));
        assert_eq!(status.code(), 10);
    }

    #[test]
    fn test_removal_order_puts_dependents_first() {
        let pkg = |name: &str, deps: &[&str]| {
            let mut md = Metadata::new(name, "1.0", "me");
            md.dependencies = deps.iter().map(|d| Requirement::named(*d)).collect();
            InstalledPackage {
                metadata: md,
                ledger: FileLedger::default(),
                dir: PathBuf::from(name),
            }
        };

        let ordered = removal_order(vec![pkg("lib", &[]), pkg("app", &["lib"]), pkg("tool", &["app"])]);
        let names: Vec<&str> = ordered.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["tool", "app", "lib"]);
    }

    #[test]
    fn test_install_then_remove() {
        let fx = Fixture::new();
        let pkg = fx.package(
            "name: foo\nversion: '1.0'\nmaintainer: me\n",
            &[("bin/foo", "foo v1")],
            &[("postinstall", "#!/bin/sh\necho \"$TPKG_HOME\" > installed-from\n")],
        );

        let report = fx.run(Options::default(), |o| o.install(&[pkg.clone()])).unwrap();
        assert!(report.status.is_success());
        assert_eq!(report.installed, vec!["foo-1.0"]);
        assert_eq!(fs::read_to_string(fx.config.base.join("bin/foo")).unwrap(), "foo v1");
        assert_eq!(store_names(&fx.config), vec!["foo-1.0"]);

        // Installing again is a no-op
        let report = fx.run(Options::default(), |o| o.install(&[pkg.clone()])).unwrap();
        assert!(report.installed.is_empty());

        let report = fx.run(Options::default(), |o| o.remove(&["foo".to_string()])).unwrap();
        assert!(report.status.is_success());
        assert_eq!(report.removed, vec!["foo-1.0"]);
        assert!(!fx.config.base.join("bin/foo").exists());
        assert!(store_names(&fx.config).is_empty());
        assert!(!fx.config.lock_dir().exists());

        let conn = db::open(&fx.config.history_db()).unwrap();
        let history = Changeset::list_recent(&conn, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].operation, Operation::Remove);
        assert_eq!(history[1].status, ChangesetStatus::Applied);
    }

    #[test]
    fn test_failed_postinstall_still_installs() {
        let fx = Fixture::new();
        let pkg = fx.package(
            "name: foo\nversion: '1.0'\nmaintainer: me\n",
            &[("bin/foo", "x")],
            &[("postinstall", "#!/bin/sh\nexit 1\n")],
        );

        let report = fx.run(Options::default(), |o| o.install(&[pkg])).unwrap();
        assert!(report.status.contains(ExitStatus::POSTINSTALL_FAILED));
        assert!(!report.status.contains(ExitStatus::FAILURE));
        assert_eq!(store_names(&fx.config), vec!["foo-1.0"]);
    }

    #[test]
    fn test_failed_preinstall_aborts_package() {
        let fx = Fixture::new();
        let manifest = "name: foo\nversion: '1.0'\nmaintainer: me\n";
        let pkg = fx.package(manifest, &[("bin/foo", "x")], &[("preinstall", "#!/bin/sh\nexit 2\n")]);

        let report = fx.run(Options::default(), |o| o.install(&[pkg.clone()])).unwrap();
        assert!(report.status.contains(ExitStatus::FAILURE));
        assert_eq!(report.failures.len(), 1);
        assert!(!fx.config.base.join("bin/foo").exists());
        assert!(store_names(&fx.config).is_empty());

        let forced = Options {
            force: true,
            ..Default::default()
        };
        let report = fx.run(forced, |o| o.install(&[pkg])).unwrap();
        assert!(report.status.is_success());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_dependencies_install_first_and_block_removal() {
        let fx = Fixture::new();
        let lib = fx.package("name: lib\nversion: '1.0'\nmaintainer: me\n", &[("lib/liblib", "l")], &[]);
        let app = fx.package(
            "name: app\nversion: '1.0'\nmaintainer: me\ndependencies:\n  - name: lib\n",
            &[("bin/app", "a")],
            &[],
        );

        let report = fx.run(Options::default(), |o| o.install(&[app, lib])).unwrap();
        assert_eq!(report.installed, vec!["lib-1.0", "app-1.0"]);

        let err = fx.run(Options::default(), |o| o.remove(&["lib".to_string()])).unwrap_err();
        assert!(matches!(err, Error::ConflictError(_)));

        let report = fx.run(Options::default(), |o| o.remove(&[])).unwrap();
        assert_eq!(report.removed, vec!["app-1.0", "lib-1.0"]);
    }

    #[test]
    fn test_remove_unknown_package() {
        let fx = Fixture::new();
        let err = fx.run(Options::default(), |o| o.remove(&["ghost".to_string()])).unwrap_err();
        assert!(matches!(err, Error::NotFoundError(_)));
    }

    #[test]
    fn test_upgrade_replaces_old_version() {
        let fx = Fixture::new();
        let v1 = fx.package(
            "name: foo\nversion: '1.0'\nmaintainer: me\n",
            &[("bin/foo", "v1"), ("share/foo/old", "gone")],
            &[],
        );
        fx.run(Options::default(), |o| o.install(&[v1])).unwrap();

        let v2 = fx.package("name: foo\nversion: '2.0'\nmaintainer: me\n", &[("bin/foo", "v2")], &[]);
        let report = fx.run(Options::default(), |o| o.upgrade(&[v2])).unwrap();
        assert!(report.status.is_success());
        assert_eq!(report.removed, vec!["foo-1.0"]);
        assert_eq!(report.installed, vec!["foo-2.0"]);
        assert_eq!(fs::read_to_string(fx.config.base.join("bin/foo")).unwrap(), "v2");
        assert!(!fx.config.base.join("share/foo/old").exists());
        assert_eq!(store_names(&fx.config), vec!["foo-2.0"]);
    }

    #[test]
    fn test_external_datascript_runs_after_preinstall() {
        let fx = Fixture::new();
        let manifest = "name: foo\nversion: '1.0'\nmaintainer: me\n\
                        externals:\n  - name: users\n    datascript: ./hookdata\n";
        let pkg = fx.package(
            manifest,
            &[("bin/foo", "x")],
            &[
                ("preinstall", "#!/bin/sh\necho prepared > stamp\n"),
                ("hookdata", "#!/bin/sh\ncat stamp\n"),
            ],
        );

        let report = fx.run(Options::default(), |o| o.install(&[pkg])).unwrap();
        assert!(!report.status.contains(ExitStatus::FAILURE), "{:?}", report.failures);

        let installed = InstalledStore::open(&fx.config).list().unwrap();
        let external = &installed[0].metadata.externals[0];
        assert_eq!(external.data.as_deref(), Some("prepared\n"));
        assert!(external.datascript.is_none());
    }

    #[test]
    fn test_installed_ledger_records_normalized_modes() {
        let fx = Fixture::new();
        let manifest = "name: foo\nversion: '1.0'\nmaintainer: me\n\
                        files:\n  files:\n    - path: bin/foo\n      posix:\n        perms: 0700\n";
        let pkg = fx.package(manifest, &[("bin/foo", "x")], &[]);
        fx.run(Options::default(), |o| o.install(&[pkg])).unwrap();

        let installed = InstalledStore::open(&fx.config).list().unwrap();
        let entry = installed[0].ledger.get("bin/foo").unwrap();
        assert_eq!(entry.perms, Some(0o700));
        assert!(entry.uid.is_some());
        assert!(crate::installed::verify_installed(&installed[0], &fx.config).unwrap().is_clean());

        fs::set_permissions(fx.config.base.join("bin/foo"), fs::Permissions::from_mode(0o777)).unwrap();
        let report = crate::installed::verify_installed(&installed[0], &fx.config).unwrap();
        assert_eq!(report.attributes, vec![fx.config.base.join("bin/foo")]);
    }

    #[test]
    fn test_upgrade_refuses_downgrade() {
        let fx = Fixture::new();
        let v2 = fx.package("name: foo\nversion: '2.0'\nmaintainer: me\n", &[("bin/foo", "v2")], &[]);
        fx.run(Options::default(), |o| o.install(&[v2])).unwrap();
        fx.package("name: foo\nversion: '1.0'\nmaintainer: me\n", &[("bin/foo", "v1")], &[]);

        let err = fx.run(Options::default(), |o| o.upgrade(&["foo=1.0".to_string()])).unwrap_err();
        assert!(err.is_resolution());
    }
}
