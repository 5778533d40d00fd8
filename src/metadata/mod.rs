// src/metadata/mod.rs

//! Package metadata model
//!
//! A package manifest (`tpkg.yml`) is parsed into a typed [`Metadata`]
//! record. Optional fields are modeled explicitly; scalars that YAML may
//! read as numbers (versions, permissions) are normalized back to strings
//! or octal modes during deserialization.
//!
//! Repository indexes are several manifests concatenated with `---`
//! document markers; [`split_documents`] lets consumers parse each chunk
//! on its own.

pub mod ledger;

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

pub use ledger::{EntryKind, FileLedger, LedgerEntry};

/// Manifest file name inside a package
pub const METADATA_FILE: &str = "tpkg.yml";

/// Manifest file name used by old packages
pub const LEGACY_METADATA_FILE: &str = "tpkg.xml";

/// Whether a package (or requirement) is managed by tpkg or by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Tpkg,
    Native,
}

/// A named constraint a chosen package must satisfy
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RequirementDoc")]
pub struct Requirement {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_package_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_package_version: Option<String>,
    /// Glob matched against "version[-package_version]"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_versions: Option<String>,
    /// Exact package file name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// `None` accepts both tpkg and native packages
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<PackageKind>,
}

/// On-disk shape of a requirement; accepts the `native: true` shorthand
#[derive(Deserialize)]
struct RequirementDoc {
    name: String,
    #[serde(default, deserialize_with = "de_opt_scalar")]
    minimum_version: Option<String>,
    #[serde(default, deserialize_with = "de_opt_scalar")]
    maximum_version: Option<String>,
    #[serde(default, deserialize_with = "de_opt_scalar")]
    minimum_package_version: Option<String>,
    #[serde(default, deserialize_with = "de_opt_scalar")]
    maximum_package_version: Option<String>,
    #[serde(default, deserialize_with = "de_opt_scalar")]
    allowed_versions: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<PackageKind>,
    #[serde(default)]
    native: Option<bool>,
}

impl From<RequirementDoc> for Requirement {
    fn from(doc: RequirementDoc) -> Self {
        let kind = match (doc.kind, doc.native) {
            (Some(kind), _) => Some(kind),
            (None, Some(true)) => Some(PackageKind::Native),
            (None, Some(false)) => Some(PackageKind::Tpkg),
            (None, None) => None,
        };

        Self {
            name: doc.name.trim().to_string(),
            minimum_version: doc.minimum_version,
            maximum_version: doc.maximum_version,
            minimum_package_version: doc.minimum_package_version,
            maximum_package_version: doc.maximum_package_version,
            allowed_versions: doc.allowed_versions,
            filename: doc.filename,
            kind,
        }
    }
}

impl Requirement {
    /// Requirement on a name with no further constraints
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a command-line package request
    ///
    /// Accepted forms:
    /// - `name`
    /// - `name=version`
    /// - `name=version=package_version`
    ///
    /// File names (`*.tpkg`) are handled by the repository layer, which
    /// knows the package name behind a file.
    pub fn parse_request(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let mut parts = spec.split('=');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(Error::ParseError(format!("Invalid package request '{}'", spec)));
        }

        let mut req = Requirement::named(name);

        if let Some(version) = parts.next().map(str::trim).filter(|v| !v.is_empty()) {
            req.minimum_version = Some(version.to_string());
            req.maximum_version = Some(version.to_string());
        }
        if let Some(pkgver) = parts.next().map(str::trim).filter(|v| !v.is_empty()) {
            req.minimum_package_version = Some(pkgver.to_string());
            req.maximum_package_version = Some(pkgver.to_string());
        }
        if parts.next().is_some() {
            return Err(Error::ParseError(format!("Invalid package request '{}'", spec)));
        }

        Ok(req)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(filename) = &self.filename {
            return write!(f, " ({})", filename);
        }
        if let Some(min) = &self.minimum_version {
            write!(f, " >= {}", min)?;
            if let Some(pv) = &self.minimum_package_version {
                write!(f, "-{}", pv)?;
            }
        }
        if let Some(max) = &self.maximum_version {
            write!(f, " <= {}", max)?;
            if let Some(pv) = &self.maximum_package_version {
                write!(f, "-{}", pv)?;
            }
        }
        if let Some(glob) = &self.allowed_versions {
            write!(f, " ~ {}", glob)?;
        }
        if self.kind == Some(PackageKind::Native) {
            write!(f, " [native]")?;
        }
        Ok(())
    }
}

/// POSIX ownership and permissions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posix {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, with = "mode", skip_serializing_if = "Option::is_none")]
    pub perms: Option<u32>,
}

/// Defaults applied to every file (or directory) before per-file overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posix: Option<Posix>,
}

/// Encryption marker on a file entry
///
/// `encrypt: true` asks the builder to encrypt the file;
/// `encrypt: {precrypt: true}` declares it was encrypted beforehand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Encrypt {
    Flag(bool),
    Options {
        #[serde(default)]
        precrypt: bool,
    },
}

impl Encrypt {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Encrypt::Flag(false))
    }

    pub fn is_precrypt(&self) -> bool {
        matches!(self, Encrypt::Options { precrypt: true })
    }
}

/// Init script registration for a file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u32>,
    #[serde(default, deserialize_with = "de_string_list", skip_serializing_if = "Vec::is_empty")]
    pub levels: Vec<String>,
}

/// Crontab registration for a file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrontabSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// A file listed in the manifest
///
/// Absolute paths live under `root/` in the package; relative paths are
/// relocatable and live under `reloc/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub config: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt: Option<Encrypt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crontab: Option<CrontabSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posix: Option<Posix>,
}

impl FileEntry {
    pub fn is_relocatable(&self) -> bool {
        !self.path.starts_with('/')
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypt.as_ref().is_some_and(Encrypt::is_enabled)
    }

    /// Location of this file inside an unpacked `tpkg/` directory
    pub fn package_path(&self, tpkg_dir: &Path) -> std::path::PathBuf {
        if self.is_relocatable() {
            tpkg_dir.join("reloc").join(&self.path)
        } else {
            tpkg_dir.join("root").join(self.path.trim_start_matches('/'))
        }
    }
}

/// The `files:` section of a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Files {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_defaults: Option<Defaults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirs_defaults: Option<Defaults>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileEntry>,
}

impl Files {
    pub fn is_empty(&self) -> bool {
        self.file_defaults.is_none() && self.dirs_defaults.is_none() && self.files.is_empty()
    }
}

/// An out-of-tree hook invoked on install/remove
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct External {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datafile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datascript: Option<String>,
}

/// Package metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(deserialize_with = "de_scalar")]
    pub version: String,
    #[serde(default, deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub package_version: Option<String>,
    pub maintainer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "de_string_list", skip_serializing_if = "Vec::is_empty")]
    pub operatingsystem: Vec<String>,
    #[serde(default, deserialize_with = "de_string_list", skip_serializing_if = "Vec::is_empty")]
    pub architecture: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Requirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Requirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub externals: Vec<External>,
    #[serde(default, skip_serializing_if = "Files::is_empty")]
    pub files: Files,
    /// Set when loaded from an archive or an index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl Metadata {
    /// Minimal metadata with the mandatory fields
    pub fn new(name: impl Into<String>, version: impl Into<String>, maintainer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            package_version: None,
            maintainer: maintainer.into(),
            description: None,
            operatingsystem: Vec::new(),
            architecture: Vec::new(),
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            externals: Vec::new(),
            files: Files::default(),
            filename: None,
        }
    }

    /// Parse, normalize and validate a YAML manifest
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut metadata: Metadata = serde_yaml::from_str(text)
            .map_err(|e| Error::MetadataError(e.to_string()))?;
        metadata.normalize();
        metadata.validate()?;
        Ok(metadata)
    }

    /// Serialize to a YAML manifest
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load a manifest file
    pub fn load(path: &Path) -> Result<Self> {
        if path.file_name().is_some_and(|n| n == LEGACY_METADATA_FILE) {
            return Err(Error::MetadataError(format!(
                "{}: XML manifests are no longer supported, convert to {}",
                path.display(),
                METADATA_FILE
            )));
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::IoError(format!("Failed to read {}: {}", path.display(), e)))?;
        debug!("Loaded manifest {}", path.display());
        Self::from_yaml(&text)
    }

    /// Load the manifest of a package source or unpacked package directory
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let yml = dir.join(METADATA_FILE);
        if yml.exists() {
            return Self::load(&yml);
        }
        let xml = dir.join(LEGACY_METADATA_FILE);
        if xml.exists() {
            return Self::load(&xml);
        }
        Err(Error::MetadataError(format!(
            "No {} found in {}",
            METADATA_FILE,
            dir.display()
        )))
    }

    /// Trim whitespace and drop empty optional values
    pub fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.version = self.version.trim().to_string();
        self.maintainer = self.maintainer.trim().to_string();
        self.package_version = self
            .package_version
            .take()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        self.description = self
            .description
            .take()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self.operatingsystem.retain(|os| !os.is_empty());
        self.architecture.retain(|arch| !arch.is_empty());
    }

    /// Check the mandatory-field invariants
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("name", &self.name),
            ("version", &self.version),
            ("maintainer", &self.maintainer),
        ] {
            if value.trim().is_empty() {
                return Err(Error::MetadataError(format!("Required field '{}' is empty", field)));
            }
        }

        if !starts_with_digit(&self.version) {
            return Err(Error::MetadataError(format!(
                "version '{}' of {} must begin with a digit",
                self.version, self.name
            )));
        }
        if let Some(pkgver) = &self.package_version
            && !starts_with_digit(pkgver)
        {
            return Err(Error::MetadataError(format!(
                "package_version '{}' of {} must begin with a digit",
                pkgver, self.name
            )));
        }

        for dep in self.dependencies.iter().chain(self.conflicts.iter()) {
            if dep.name.is_empty() {
                return Err(Error::MetadataError(format!(
                    "{} declares a dependency or conflict without a name",
                    self.name
                )));
            }
        }

        Ok(())
    }

    /// "version[-package_version]"
    pub fn full_version(&self) -> String {
        match &self.package_version {
            Some(pv) => format!("{}-{}", self.version, pv),
            None => self.version.clone(),
        }
    }

    /// Dependency requirements; untyped entries default to tpkg packages
    pub fn dependency_requirements(&self) -> Vec<Requirement> {
        self.dependencies
            .iter()
            .map(|dep| {
                let mut req = dep.clone();
                req.kind.get_or_insert(PackageKind::Tpkg);
                req
            })
            .collect()
    }

    /// Manifest entry for a declared path
    pub fn file_entry(&self, path: &str) -> Option<&FileEntry> {
        self.files.files.iter().find(|f| f.path == path)
    }

    /// `<name>-<version>[-<package_version>][-<os>][-<arch>]`
    pub fn package_stem(&self) -> String {
        let mut stem = format!("{}-{}", self.name, self.version);
        if let Some(pv) = &self.package_version {
            stem.push('-');
            stem.push_str(pv);
        }
        if !self.operatingsystem.is_empty() {
            stem.push('-');
            stem.push_str(&os_label(&self.operatingsystem));
        }
        if !self.architecture.is_empty() {
            stem.push('-');
            if self.architecture.len() == 1 {
                stem.push_str(&sanitize_label(&self.architecture[0]));
            } else {
                stem.push_str("multiarch");
            }
        }
        stem
    }

    /// File name a package built from this manifest gets
    pub fn package_filename(&self) -> String {
        format!("{}.tpkg", self.package_stem())
    }
}

fn starts_with_digit(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn sanitize_label(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == '/' { '_' } else { c })
        .collect()
}

/// One OS is used verbatim; several versions of one OS collapse to its name
fn os_label(oses: &[String]) -> String {
    if oses.len() == 1 {
        return sanitize_label(&oses[0]);
    }

    let first = oses[0].split('-').next().unwrap_or_default();
    if !first.is_empty() && oses.iter().all(|os| os.split('-').next() == Some(first)) {
        sanitize_label(first)
    } else {
        "multios".to_string()
    }
}

/// Split a multi-document index on `---` marker lines
pub fn split_documents(text: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if line.trim_end() == "---" {
            if !current.trim().is_empty() {
                documents.push(std::mem::take(&mut current));
            }
            current.clear();
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        documents.push(current);
    }

    documents
}

/// Parse every manifest of an index, skipping (and logging) bad documents
pub fn parse_index(text: &str) -> Vec<Metadata> {
    split_documents(text)
        .iter()
        .filter_map(|doc| match Metadata::from_yaml(doc) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!("Skipping unparsable index entry: {}", e);
                None
            }
        })
        .collect()
}

/// Serialize manifests into a multi-document index
pub fn write_index<'a, I>(entries: I) -> Result<String>
where
    I: IntoIterator<Item = &'a Metadata>,
{
    let mut out = String::new();
    for metadata in entries {
        out.push_str("---\n");
        out.push_str(&metadata.to_yaml()?);
    }
    Ok(out)
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Scalar fields keep their source text, so `1.10` stays `1.10`
struct ScalarText;

impl<'de> serde::de::Visitor<'de> for ScalarText {
    type Value = String;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a scalar value")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_string<E: serde::de::Error>(self, v: String) -> std::result::Result<String, E> {
        Ok(v)
    }

    fn visit_bool<E: serde::de::Error>(self, v: bool) -> std::result::Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_f64<E: serde::de::Error>(self, v: f64) -> std::result::Result<String, E> {
        Ok(v.to_string())
    }
}

struct OptScalarText;

impl<'de> serde::de::Visitor<'de> for OptScalarText {
    type Value = Option<String>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a scalar value or nothing")
    }

    fn visit_none<E: serde::de::Error>(self) -> std::result::Result<Option<String>, E> {
        Ok(None)
    }

    fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<Option<String>, E> {
        Ok(None)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<Option<String>, D::Error> {
        de_scalar(d).map(Some)
    }
}

fn de_scalar<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    d.deserialize_str(ScalarText)
}

fn de_opt_scalar<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    d.deserialize_option(OptScalarText)
}

/// A list of scalars, or one comma separated string
fn de_string_list<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<String>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(items)) => items
            .into_iter()
            .map(|item| {
                scalar_to_string(item)
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| serde::de::Error::custom("expected a list of scalars"))
            })
            .collect(),
        Some(value) => {
            let text = scalar_to_string(value)
                .ok_or_else(|| serde::de::Error::custom("expected a list or a string"))?;
            Ok(text
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect())
        }
    }
}

/// Octal permission modes
///
/// YAML 1.2 reads `0644` as the decimal integer 644, so integers are
/// reinterpreted digit by digit as octal. Modes are written back as
/// quoted octal strings.
mod mode {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_yaml::Value;

    pub fn serialize<S: Serializer>(mode: &Option<u32>, s: S) -> Result<S::Ok, S::Error> {
        match mode {
            Some(m) => s.serialize_str(&format!("{:04o}", m)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        let text = match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s,
            Some(_) => return Err(serde::de::Error::custom("expected an octal mode")),
        };
        let digits = text.trim();
        let digits = digits.strip_prefix("0o").unwrap_or(digits);
        u32::from_str_radix(digits, 8)
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid octal mode '{}'", text)))
    }
}
