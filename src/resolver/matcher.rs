// src/resolver/matcher.rs

//! Requirement matching
//!
//! Checks run in a fixed order and stop at the first failure: package
//! kind, exact filename, name, allowed_versions glob, version bounds,
//! operating system, architecture.

use crate::host::HostFacts;
use crate::metadata::{PackageKind, Requirement};
use crate::resolver::candidate::Candidate;
use crate::version;
use regex::Regex;
use std::cmp::Ordering;
use tracing::warn;

/// Does `candidate` satisfy `req` on `host`?
pub fn matches(candidate: &Candidate, req: &Requirement, host: &HostFacts) -> bool {
    let metadata = &candidate.metadata;

    match (req.kind, candidate.kind()) {
        (Some(PackageKind::Native), PackageKind::Tpkg) => return false,
        (Some(PackageKind::Tpkg), PackageKind::Native) => return false,
        _ => {}
    }

    if let Some(filename) = &req.filename {
        return metadata.filename.as_deref() == Some(filename.as_str()) && metadata.name == req.name;
    }

    if metadata.name != req.name {
        return false;
    }

    if let Some(pattern) = &req.allowed_versions {
        match glob::Pattern::new(pattern) {
            Ok(glob) => {
                if !glob.matches(&metadata.full_version()) {
                    return false;
                }
            }
            Err(e) => {
                warn!("Invalid allowed_versions pattern '{}' for {}: {}", pattern, req.name, e);
                return false;
            }
        }
    }

    let package_version = metadata.package_version.as_deref().unwrap_or("0");

    if let Some(min) = &req.minimum_version {
        match version::compare(&metadata.version, min) {
            Ordering::Less => return false,
            Ordering::Equal => {
                if let Some(min_pv) = &req.minimum_package_version
                    && version::compare(package_version, min_pv) == Ordering::Less
                {
                    return false;
                }
            }
            Ordering::Greater => {}
        }
    }

    if let Some(max) = &req.maximum_version {
        match version::compare(&metadata.version, max) {
            Ordering::Greater => return false,
            Ordering::Equal => {
                if let Some(max_pv) = &req.maximum_package_version
                    && version::compare(package_version, max_pv) == Ordering::Greater
                {
                    return false;
                }
            }
            Ordering::Less => {}
        }
    }

    platform_matches(&metadata.operatingsystem, &host.os)
        && platform_matches(&metadata.architecture, &host.arch)
}

/// Empty means any; otherwise an entry must equal or fully match `actual`
fn platform_matches(allowed: &[String], actual: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }

    allowed.iter().any(|entry| {
        entry == actual
            || Regex::new(&format!("^(?:{})$", entry))
                .map(|re| re.is_match(actual))
                .unwrap_or(false)
    })
}
