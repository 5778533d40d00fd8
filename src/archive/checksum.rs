// src/archive/checksum.rs

//! Digests and the `checksum.xml` manifest
//!
//! The manifest names the digest algorithm and carries the hex digest of
//! the sibling `tpkg.tar`:
//!
//! ```xml
//! <?xml version="1.0"?>
//! <tpkg_checksums>
//!   <checksum>
//!     <algorithm>SHA256</algorithm>
//!     <digest>9f86d0...</digest>
//!   </checksum>
//! </tpkg_checksums>
//! ```

use crate::error::{Error, Result};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use sha2::{Digest, Sha256, Sha512};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Manifest file name inside the outer archive
pub const CHECKSUM_FILE: &str = "checksum.xml";

/// Bytes read per digest update
pub const CHUNK_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "SHA256",
            ChecksumAlgorithm::Sha512 => "SHA512",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_uppercase().replace('-', "").as_str() {
            "SHA256" => Ok(ChecksumAlgorithm::Sha256),
            "SHA512" => Ok(ChecksumAlgorithm::Sha512),
            other => Err(Error::MalformedArchive(format!(
                "Unsupported checksum algorithm '{}'",
                other
            ))),
        }
    }
}

/// Incremental hasher over the supported algorithms
pub enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Digest a stream in fixed-size chunks
pub fn digest_reader<R: Read>(mut reader: R, algorithm: ChecksumAlgorithm) -> Result<String> {
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize_hex())
}

pub fn digest_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    let file = File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {} for checksum: {}", path.display(), e)))?;
    digest_reader(file, algorithm)
}

/// Parsed `checksum.xml`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumManifest {
    pub algorithm: ChecksumAlgorithm,
    pub digest: String,
}

impl ChecksumManifest {
    pub fn new(algorithm: ChecksumAlgorithm, digest: impl Into<String>) -> Self {
        Self {
            algorithm,
            digest: digest.into(),
        }
    }

    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        fn xml_err<E: std::fmt::Display>(e: E) -> Error {
            Error::IoError(format!("Failed to write {}: {}", CHECKSUM_FILE, e))
        }

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", None, None)))
            .map_err(xml_err)?;
        writer
            .write_event(Event::Start(BytesStart::new("tpkg_checksums")))
            .map_err(xml_err)?;
        writer
            .write_event(Event::Start(BytesStart::new("checksum")))
            .map_err(xml_err)?;
        for (tag, value) in [("algorithm", self.algorithm.name()), ("digest", self.digest.as_str())] {
            writer
                .write_event(Event::Start(BytesStart::new(tag)))
                .map_err(xml_err)?;
            writer
                .write_event(Event::Text(BytesText::new(value)))
                .map_err(xml_err)?;
            writer
                .write_event(Event::End(BytesEnd::new(tag)))
                .map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("checksum")))
            .map_err(xml_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("tpkg_checksums")))
            .map_err(xml_err)?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| Error::IoError(format!("Invalid UTF-8 in {}: {}", CHECKSUM_FILE, e)))
    }

    /// Parse the first `<checksum>` entry
    pub fn from_xml(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut buf = Vec::new();
        let mut current_tag: Option<Vec<u8>> = None;
        let mut in_checksum = false;
        let mut algorithm: Option<String> = None;
        let mut digest: Option<String> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    let name = e.name().as_ref().to_vec();
                    if name == b"checksum" {
                        in_checksum = true;
                    }
                    current_tag = Some(name);
                }
                Ok(Event::Text(e)) if in_checksum => {
                    let text = e
                        .unescape()
                        .map_err(|e| Error::MalformedArchive(format!("{}: {}", CHECKSUM_FILE, e)))?
                        .to_string();
                    match current_tag.as_deref() {
                        Some(b"algorithm") => algorithm = Some(text),
                        Some(b"digest") => digest = Some(text),
                        _ => {}
                    }
                }
                Ok(Event::End(e)) => {
                    if e.name().as_ref() == b"checksum" && algorithm.is_some() && digest.is_some() {
                        break;
                    }
                    current_tag = None;
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(Error::MalformedArchive(format!(
                        "Failed to parse {}: {}",
                        CHECKSUM_FILE, e
                    )));
                }
                _ => {}
            }
            buf.clear();
        }

        match (algorithm, digest) {
            (Some(algorithm), Some(digest)) => Ok(Self {
                algorithm: ChecksumAlgorithm::from_name(&algorithm)?,
                digest: digest.trim().to_ascii_lowercase(),
            }),
            _ => Err(Error::MalformedArchive(format!(
                "{} has no algorithm/digest entry",
                CHECKSUM_FILE
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        let digest = digest_reader(&b"test"[..], ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(
            digest,
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn test_chunked_matches_whole() {
        let data = vec![7u8; CHUNK_SIZE * 2 + 13];
        let chunked = digest_reader(&data[..], ChecksumAlgorithm::Sha512).unwrap();
        let whole = hex::encode(Sha512::digest(&data));
        assert_eq!(chunked, whole);
    }

    #[test]
    fn test_manifest_xml() {
        let manifest = ChecksumManifest::new(ChecksumAlgorithm::Sha256, "abc123");
        let xml = manifest.to_xml().unwrap();
        assert!(xml.contains("<algorithm>SHA256</algorithm>"));
        assert!(xml.contains("<digest>abc123</digest>"));
        assert_eq!(ChecksumManifest::from_xml(&xml).unwrap(), manifest);
    }

    #[test]
    fn test_manifest_without_digest_is_malformed() {
        let xml = "<tpkg_checksums><checksum><algorithm>SHA256</algorithm></checksum></tpkg_checksums>";
        let err = ChecksumManifest::from_xml(xml).unwrap_err();
        assert!(matches!(err, Error::MalformedArchive(_)));
    }

    #[test]
    fn test_unknown_algorithm() {
        let xml = "<tpkg_checksums><checksum><algorithm>CRC32</algorithm><digest>00</digest></checksum></tpkg_checksums>";
        assert!(ChecksumManifest::from_xml(xml).is_err());
    }
}
