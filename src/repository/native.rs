// src/repository/native.rs

//! Native package manager oracle
//!
//! tpkg packages may depend on packages managed by the host OS. The
//! oracle reports installed and installable native packages as
//! `(name, version, package_version)` tuples and installs them on request.

use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::resolver::{Candidate, Source};

/// One native package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativePackage {
    pub name: String,
    pub version: String,
    pub package_version: Option<String>,
}

impl NativePackage {
    pub fn new(name: impl Into<String>, version: impl Into<String>, package_version: Option<&str>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            package_version: package_version.map(String::from),
        }
    }

    fn into_candidate(self, source: Source) -> Candidate {
        let mut metadata = Metadata::new(self.name, self.version, "native");
        metadata.package_version = self.package_version;
        Candidate::new(metadata, source)
    }
}

pub trait NativePackages {
    /// Installed native packages named `name`
    fn installed(&self, name: &str) -> Vec<NativePackage>;

    /// Native packages named `name` the OS could install
    fn available(&self, name: &str) -> Vec<NativePackage>;

    /// Install a native package
    fn install(&self, pkg: &NativePackage) -> Result<()> {
        Err(Error::NotFoundError(format!(
            "No native package manager available to install {}",
            pkg.name
        )))
    }

    /// Installed and available packages as candidates
    fn candidates(&self, name: &str) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = self
            .installed(name)
            .into_iter()
            .map(|p| p.into_candidate(Source::NativeInstalled).preferred(true))
            .collect();
        out.extend(
            self.available(name)
                .into_iter()
                .map(|p| p.into_candidate(Source::NativeAvailable)),
        );
        out
    }
}

/// Oracle for hosts without a supported native package manager
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNative;

impl NativePackages for NoNative {
    fn installed(&self, _name: &str) -> Vec<NativePackage> {
        Vec::new()
    }

    fn available(&self, _name: &str) -> Vec<NativePackage> {
        Vec::new()
    }
}

/// Fixed package lists; useful when facts were gathered elsewhere
#[derive(Debug, Clone, Default)]
pub struct StaticNative {
    pub installed: Vec<NativePackage>,
    pub available: Vec<NativePackage>,
}

impl NativePackages for StaticNative {
    fn installed(&self, name: &str) -> Vec<NativePackage> {
        self.installed.iter().filter(|p| p.name == name).cloned().collect()
    }

    fn available(&self, name: &str) -> Vec<NativePackage> {
        self.available.iter().filter(|p| p.name == name).cloned().collect()
    }
}
