// src/install/links.rs

//! Init script and crontab registration
//!
//! An init script is linked into `<init_dir>/rc<level>.d/` as
//! `S<start><name>` for each of its run levels; a crontab is linked into
//! the crontab directory under its own file name. If the canonical name
//! is already taken by something else, the suffixes 1 through 9 are tried
//! in order. Removal only touches links that point at the package's file.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metadata::InitSpec;
use std::fs;
use std::iter;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Start position when the manifest gives none
pub const DEFAULT_START: u32 = 99;

/// Run levels when the manifest gives none
pub const DEFAULT_LEVELS: [&str; 4] = ["2", "3", "4", "5"];

const MAX_SUFFIX: u32 = 9;

fn names(name: &str) -> impl Iterator<Item = String> + '_ {
    iter::once(name.to_string()).chain((1..=MAX_SUFFIX).map(move |n| format!("{}{}", name, n)))
}

fn points_to(link: &Path, target: &Path) -> bool {
    fs::read_link(link).is_ok_and(|t| t == target)
}

fn base_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::LinkError(format!("{} has no file name", path.display())))
}

/// Link `target` into `dir` as `name`, or the first free suffixed name
pub fn link_with_suffix(dir: &Path, name: &str, target: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .map_err(|e| Error::LinkError(format!("Failed to create {}: {}", dir.display(), e)))?;

    for candidate in names(name) {
        let link = dir.join(&candidate);
        if points_to(&link, target) {
            return Ok(link);
        }
        if fs::symlink_metadata(&link).is_ok() {
            debug!("{} is taken", link.display());
            continue;
        }

        symlink(target, &link).map_err(|e| {
            Error::LinkError(format!(
                "Failed to link {} to {}: {}",
                link.display(),
                target.display(),
                e
            ))
        })?;
        debug!("Linked {} -> {}", link.display(), target.display());
        return Ok(link);
    }

    Err(Error::LinkError(format!(
        "{} and its suffixes 1-{} are all taken in {}",
        name,
        MAX_SUFFIX,
        dir.display()
    )))
}

/// Remove links named `name` (or a suffixed variant) that point at `target`
pub fn unlink_matching(dir: &Path, name: &str, target: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for candidate in names(name) {
        let link = dir.join(&candidate);
        if points_to(&link, target) {
            fs::remove_file(&link).map_err(|e| {
                Error::LinkError(format!("Failed to remove {}: {}", link.display(), e))
            })?;
            removed.push(link);
        }
    }
    Ok(removed)
}

/// (rc directory, link name) for each run level of an init script
fn init_slots(config: &Config, spec: &InitSpec, installed: &Path) -> Result<Vec<(PathBuf, String)>> {
    let name = format!("S{:02}{}", spec.start.unwrap_or(DEFAULT_START), base_name(installed)?);
    let levels: Vec<&str> = if spec.levels.is_empty() {
        DEFAULT_LEVELS.to_vec()
    } else {
        spec.levels.iter().map(String::as_str).collect()
    };

    Ok(levels
        .into_iter()
        .map(|level| (config.init_dir.join(format!("rc{}.d", level)), name.clone()))
        .collect())
}

pub fn install_init_script(config: &Config, spec: &InitSpec, installed: &Path) -> Result<Vec<PathBuf>> {
    init_slots(config, spec, installed)?
        .into_iter()
        .map(|(dir, name)| link_with_suffix(&dir, &name, installed))
        .collect()
}

pub fn remove_init_script(config: &Config, spec: &InitSpec, installed: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for (dir, name) in init_slots(config, spec, installed)? {
        removed.extend(unlink_matching(&dir, &name, installed)?);
    }
    Ok(removed)
}

pub fn install_crontab(config: &Config, installed: &Path) -> Result<PathBuf> {
    link_with_suffix(&config.crontab_dir, &base_name(installed)?, installed)
}

pub fn remove_crontab(config: &Config, installed: &Path) -> Result<Vec<PathBuf>> {
    unlink_matching(&config.crontab_dir, &base_name(installed)?, installed)
}
