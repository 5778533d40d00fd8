// src/resolver/candidate.rs

//! Candidate packages and their preference order

use crate::metadata::{Metadata, PackageKind};
use crate::version;
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

/// Count used for an empty (any) OS or architecture list
const ANY_PLATFORM_SENTINEL: usize = 1000;

/// Where a candidate package comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A `.tpkg` file on local disk
    LocalFile(PathBuf),
    /// A package in a remote source, by URL
    Remote(String),
    /// Installed by tpkg
    Installed,
    /// Installed by the OS package manager
    NativeInstalled,
    /// Installable through the OS package manager
    NativeAvailable,
}

/// A package that could satisfy a requirement
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub metadata: Metadata,
    pub source: Source,
    /// Installed candidates the caller wants kept rather than replaced
    pub preferred: bool,
}

impl Candidate {
    pub fn new(metadata: Metadata, source: Source) -> Self {
        Self {
            metadata,
            source,
            preferred: false,
        }
    }

    pub fn preferred(mut self, preferred: bool) -> Self {
        self.preferred = preferred;
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_installed(&self) -> bool {
        matches!(self.source, Source::Installed | Source::NativeInstalled)
    }

    pub fn is_native(&self) -> bool {
        matches!(self.source, Source::NativeInstalled | Source::NativeAvailable)
    }

    pub fn kind(&self) -> PackageKind {
        if self.is_native() {
            PackageKind::Native
        } else {
            PackageKind::Tpkg
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.metadata.filename {
            Some(filename) => write!(f, "{}", filename),
            None => write!(f, "{}-{}", self.metadata.name, self.metadata.full_version()),
        }
    }
}

fn platform_count(list: &[String]) -> usize {
    if list.is_empty() {
        ANY_PLATFORM_SENTINEL
    } else {
        list.len()
    }
}

/// Best-first ordering of candidates for one name
///
/// Preferred installed packages win outright. Then higher version, higher
/// package version, more specific OS list, more specific architecture
/// list, and finally installed over not installed.
pub fn preference_order(a: &Candidate, b: &Candidate) -> Ordering {
    let a_kept = a.preferred && a.is_installed();
    let b_kept = b.preferred && b.is_installed();

    b_kept
        .cmp(&a_kept)
        .then_with(|| version::compare(&b.metadata.version, &a.metadata.version))
        // No package version compares as "0", as in requirement matching
        .then_with(|| {
            version::compare(
                b.metadata.package_version.as_deref().unwrap_or("0"),
                a.metadata.package_version.as_deref().unwrap_or("0"),
            )
        })
        .then_with(|| {
            platform_count(&a.metadata.operatingsystem)
                .cmp(&platform_count(&b.metadata.operatingsystem))
        })
        .then_with(|| {
            platform_count(&a.metadata.architecture).cmp(&platform_count(&b.metadata.architecture))
        })
        .then_with(|| b.is_installed().cmp(&a.is_installed()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(version: &str, source: Source) -> Candidate {
        Candidate::new(Metadata::new("foo", version, "me"), source)
    }

    fn sorted(mut list: Vec<Candidate>) -> Vec<Candidate> {
        list.sort_by(preference_order);
        list
    }

    #[test]
    fn test_higher_version_first() {
        let list = sorted(vec![
            pkg("1.9", Source::Remote("a".into())),
            pkg("1.10", Source::Remote("b".into())),
        ]);
        assert_eq!(list[0].metadata.version, "1.10");
    }

    #[test]
    fn test_preferred_installed_beats_newer() {
        let list = sorted(vec![
            pkg("2.0", Source::Remote("a".into())),
            pkg("1.0", Source::Installed).preferred(true),
        ]);
        assert!(list[0].is_installed());

        // Without the preference flag the newer one wins
        let list = sorted(vec![
            pkg("2.0", Source::Remote("a".into())),
            pkg("1.0", Source::Installed),
        ]);
        assert_eq!(list[0].metadata.version, "2.0");
    }

    #[test]
    fn test_package_version_breaks_ties() {
        let mut a = pkg("1.0", Source::Remote("a".into()));
        a.metadata.package_version = Some("2".into());
        let mut b = pkg("1.0", Source::Remote("b".into()));
        b.metadata.package_version = Some("10".into());
        let c = pkg("1.0", Source::Remote("c".into()));

        let list = sorted(vec![a, c, b]);
        assert_eq!(list[0].metadata.package_version.as_deref(), Some("10"));
        assert_eq!(list[1].metadata.package_version.as_deref(), Some("2"));
        assert!(list[2].metadata.package_version.is_none());
    }

    #[test]
    fn test_missing_package_version_ties_with_zero() {
        let mut zero = pkg("1.0", Source::Remote("zero".into()));
        zero.metadata.package_version = Some("0".into());
        let mut unset = pkg("1.0", Source::Remote("unset".into()));
        unset.metadata.operatingsystem = vec!["Linux".into()];

        let list = sorted(vec![zero, unset]);
        assert_eq!(list[0].source, Source::Remote("unset".into()));
    }

    #[test]
    fn test_specific_os_beats_generic() {
        let generic = pkg("1.0", Source::Remote("generic".into()));
        let mut specific = pkg("1.0", Source::Remote("specific".into()));
        specific.metadata.operatingsystem = vec!["RedHat-5".into(), "CentOS-5".into()];

        let list = sorted(vec![generic, specific]);
        assert_eq!(list[0].source, Source::Remote("specific".into()));
    }

    #[test]
    fn test_installed_is_final_tie_break() {
        let list = sorted(vec![
            pkg("1.0", Source::Remote("a".into())),
            pkg("1.0", Source::Installed),
        ]);
        assert!(list[0].is_installed());
    }

    #[test]
    fn test_kind_follows_source() {
        assert_eq!(pkg("1", Source::NativeAvailable).kind(), PackageKind::Native);
        assert_eq!(pkg("1", Source::Installed).kind(), PackageKind::Tpkg);
    }
}
