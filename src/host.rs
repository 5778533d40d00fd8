// src/host.rs

//! Operating system and architecture of the running host
//!
//! Requirement matching only needs two strings. Fact gathering proper is
//! left to the caller; `detect` falls back to the compile-time target.

/// OS/architecture oracle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    pub os: String,
    pub arch: String,
}

impl HostFacts {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Describe the running host
    ///
    /// `TPKG_OS` and `TPKG_ARCH` override the detected values so a package
    /// repository can be queried on behalf of another platform.
    pub fn detect() -> Self {
        let os = std::env::var("TPKG_OS").unwrap_or_else(|_| std::env::consts::OS.to_string());
        let arch =
            std::env::var("TPKG_ARCH").unwrap_or_else(|_| std::env::consts::ARCH.to_string());
        Self { os, arch }
    }
}

impl Default for HostFacts {
    fn default() -> Self {
        Self::detect()
    }
}
