// src/repository/mod.rs

//! Package sources and candidate lookup
//!
//! This module provides functionality for:
//! - Reading local package directories and single package files
//! - Fetching `metadata.yml` indexes from HTTP(S) sources
//! - Downloading remote packages into the cache with retries
//! - Writing `metadata.yml` for a directory of packages
//! - Answering candidate queries for the resolver

pub mod native;

use crate::archive;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::installed::InstalledStore;
use crate::metadata::{self, Metadata, Requirement};
use crate::resolver::{Candidate, CandidateProvider, Source};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub use native::{NativePackage, NativePackages, NoNative, StaticNative};

/// Index file name in a package directory or remote source
pub const INDEX_FILE: &str = "metadata.yml";

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts for failed downloads
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn join_url(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// HTTP client wrapper with retry support
pub struct RepositoryClient {
    client: Client,
    max_retries: u32,
}

impl RepositoryClient {
    /// Create a new repository client
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    /// Fetch the `metadata.yml` index of a source with retry support
    pub fn fetch_index(&self, url: &str) -> Result<String> {
        let index_url = join_url(url, INDEX_FILE);
        info!("Fetching package index from {}", index_url);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(&index_url).send() {
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {}",
                            response.status(),
                            index_url
                        )));
                    }

                    return response.text().map_err(|e| {
                        Error::DownloadError(format!("Failed to read {}: {}", index_url, e))
                    });
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to fetch index after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    warn!("Index fetch attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    /// Download a file to the specified path with retry support
    pub fn download_file(&self, url: &str, dest_path: &Path) -> Result<()> {
        info!("Downloading {} to {}", url, dest_path.display());

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create directory {}: {}", parent.display(), e))
            })?;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(mut response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }

                    // Write to a temporary file, then rename into place
                    let temp_path = dest_path.with_extension("tmp");
                    let mut file = File::create(&temp_path).map_err(|e| {
                        Error::IoError(format!("Failed to create file {}: {}", temp_path.display(), e))
                    })?;

                    io::copy(&mut response, &mut file).map_err(|e| {
                        Error::IoError(format!("Failed to write downloaded data: {}", e))
                    })?;

                    fs::rename(&temp_path, dest_path).map_err(|e| {
                        Error::IoError(format!(
                            "Failed to move {} to {}: {}",
                            temp_path.display(),
                            dest_path.display(),
                            e
                        ))
                    })?;

                    info!("Successfully downloaded to {}", dest_path.display());
                    return Ok(());
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to download after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }
}

/// Packages of a local directory: from its index when present, otherwise
/// by verifying each `.tpkg` file
fn load_directory(dir: &Path) -> Result<Vec<Candidate>> {
    let index = dir.join(INDEX_FILE);
    if index.is_file() {
        let text = fs::read_to_string(&index)
            .map_err(|e| Error::IoError(format!("Failed to read {}: {}", index.display(), e)))?;
        let mut out = Vec::new();
        for md in metadata::parse_index(&text) {
            let Some(filename) = md.filename.clone() else {
                warn!("Index entry {} in {} has no filename", md.name, index.display());
                continue;
            };
            out.push(Candidate::new(md, Source::LocalFile(dir.join(filename))));
        }
        debug!("Read {} package(s) from {}", out.len(), index.display());
        return Ok(out);
    }

    let mut out = Vec::new();
    for path in package_files(dir)? {
        match archive::extract_metadata(&path) {
            Ok(md) => out.push(Candidate::new(md, Source::LocalFile(path))),
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }
    Ok(out)
}

/// `.tpkg` files of a directory in name order
fn package_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| Error::IoError(format!("Failed to read {}: {}", dir.display(), e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "tpkg"))
        .collect();
    files.sort();
    Ok(files)
}

/// Write `metadata.yml` for the packages in `dir`
pub fn write_index(dir: &Path) -> Result<PathBuf> {
    let mut entries = Vec::new();
    for path in package_files(dir)? {
        entries.push(archive::extract_metadata(&path)?);
    }

    let index = dir.join(INDEX_FILE);
    fs::write(&index, metadata::write_index(&entries)?)
        .map_err(|e| Error::IoError(format!("Failed to write {}: {}", index.display(), e)))?;
    info!("Indexed {} package(s) in {}", entries.len(), index.display());
    Ok(index)
}

/// Installed packages, preferred over anything else for their name
fn installed_candidates(config: &Config) -> Result<Vec<Candidate>> {
    Ok(InstalledStore::open(config)
        .list()?
        .into_iter()
        .map(|pkg| Candidate::new(pkg.metadata, Source::Installed).preferred(true))
        .collect())
}

/// Everything tpkg knows about: source packages, installed packages and
/// the native oracle
pub struct Repository<'a> {
    available: Vec<Candidate>,
    installed: Vec<Candidate>,
    native: &'a dyn NativePackages,
}

impl<'a> Repository<'a> {
    /// Assemble a repository from explicit lists
    pub fn new(available: Vec<Candidate>, installed: Vec<Candidate>, native: &'a dyn NativePackages) -> Self {
        Self {
            available,
            installed,
            native,
        }
    }

    /// Read the configured sources and the installed package records
    pub fn load(config: &Config, native: &'a dyn NativePackages) -> Result<Self> {
        let mut available = Vec::new();
        let mut client: Option<RepositoryClient> = None;

        for source in &config.sources {
            if is_remote(source) {
                if client.is_none() {
                    client = Some(RepositoryClient::new()?);
                }
                let Some(client) = client.as_ref() else {
                    continue;
                };
                match client.fetch_index(source) {
                    Ok(text) => {
                        for md in metadata::parse_index(&text) {
                            if let Some(filename) = md.filename.clone() {
                                available.push(Candidate::new(md, Source::Remote(join_url(source, &filename))));
                            }
                        }
                    }
                    Err(e) => warn!("Skipping source {}: {}", source, e),
                }
                continue;
            }

            let path = Path::new(source);
            if path.is_dir() {
                available.extend(load_directory(path)?);
            } else if path.is_file() {
                let md = archive::extract_metadata(path)?;
                available.push(Candidate::new(md, Source::LocalFile(path.to_path_buf())));
            } else {
                warn!("Source {} does not exist", source);
            }
        }

        Ok(Self::new(available, installed_candidates(config)?, native))
    }

    /// Re-read the installed package records
    pub fn refresh_installed(&mut self, config: &Config) -> Result<()> {
        self.installed = installed_candidates(config)?;
        Ok(())
    }

    pub fn available(&self) -> &[Candidate] {
        &self.available
    }

    pub fn installed(&self) -> &[Candidate] {
        &self.installed
    }

    pub fn native(&self) -> &dyn NativePackages {
        self.native
    }

    /// Verify a package file and make it available
    pub fn add_local_file(&mut self, path: &Path) -> Result<Metadata> {
        let md = archive::extract_metadata(path)?;
        self.available
            .push(Candidate::new(md.clone(), Source::LocalFile(path.to_path_buf())));
        Ok(md)
    }

    /// Parse a command-line request
    ///
    /// Paths ending in `.tpkg` name a package file: an existing local file
    /// is verified and added, otherwise the name must match a known
    /// package file.
    pub fn parse_request(&mut self, spec: &str) -> Result<Requirement> {
        if !spec.ends_with(".tpkg") {
            return Requirement::parse_request(spec);
        }

        let path = Path::new(spec);
        let (name, filename) = if path.is_file() {
            let md = self.add_local_file(path)?;
            (md.name, md.filename.unwrap_or_default())
        } else {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let known = self
                .available
                .iter()
                .find(|c| c.metadata.filename.as_deref() == Some(filename.as_str()))
                .ok_or_else(|| Error::NotFoundError(format!("Package file {} not found", spec)))?;
            (known.metadata.name.clone(), filename)
        };

        let mut req = Requirement::named(name);
        req.filename = Some(filename);
        Ok(req)
    }

    /// Local path of a candidate's package file, downloading if needed
    pub fn fetch(&self, candidate: &Candidate, config: &Config) -> Result<PathBuf> {
        match &candidate.source {
            Source::LocalFile(path) => Ok(path.clone()),
            Source::Remote(url) => {
                let filename = candidate
                    .metadata
                    .filename
                    .clone()
                    .or_else(|| url.rsplit('/').next().map(String::from))
                    .unwrap_or_else(|| candidate.metadata.package_filename());
                let dest = config.cache_dir().join(filename);

                if dest.exists() {
                    match archive::verify(&dest) {
                        Ok(_) => {
                            debug!("Using cached {}", dest.display());
                            return Ok(dest);
                        }
                        Err(e) => warn!("Discarding cached {}: {}", dest.display(), e),
                    }
                }

                RepositoryClient::new()?.download_file(url, &dest)?;
                archive::verify(&dest)?;
                Ok(dest)
            }
            other => Err(Error::NotFoundError(format!(
                "{} ({:?}) has no package file",
                candidate, other
            ))),
        }
    }
}

impl CandidateProvider for Repository<'_> {
    fn candidates(&self, req: &Requirement) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = self
            .installed
            .iter()
            .chain(self.available.iter())
            .filter(|c| c.name() == req.name)
            .cloned()
            .collect();
        out.extend(self.native.candidates(&req.name));
        out
    }
}
