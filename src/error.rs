// src/error.rs

use thiserror::Error;

/// Core error types for tpkg
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O errors with context
    #[error("I/O error: {0}")]
    IoError(String),

    /// YAML (de)serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Initialization error (directories, database, clients)
    #[error("Failed to initialize: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Configuration file is unreadable or malformed
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic parse error (XML manifests, requests)
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Package metadata is missing a mandatory field or is malformed
    #[error("Invalid package metadata: {0}")]
    MetadataError(String),

    /// Archive digest does not match its checksum manifest
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Archive lacks the expected container structure
    #[error("Malformed package archive: {0}")]
    MalformedArchive(String),

    /// No combination of candidates satisfies the requirements
    #[error("Unable to resolve dependencies: {0}")]
    NoSolution(String),

    /// The resolver examined too many combinations
    #[error("Checked {0} possible solutions to requirements and dependencies, no solution found")]
    SearchLimitExceeded(usize),

    /// chmod/chown/symlink failures while running privileged
    #[error("Permission error: {0}")]
    PermissionError(String),

    /// A package script exited unsuccessfully
    #[error("{script} script for {package} failed: {status}")]
    ScriptError {
        package: String,
        script: String,
        status: String,
    },

    /// File or package conflict
    #[error("Conflict: {0}")]
    ConflictError(String),

    /// Decryption failed because the passphrase is wrong
    #[error("Passphrase error: {0}")]
    PassphraseError(String),

    /// Encrypted file is truncated or lacks the salt header
    #[error("Corrupt encrypted file: {0}")]
    CorruptEncryptedFile(String),

    /// Repository lock is held by someone else
    #[error("Lock error: {0}")]
    LockError(String),

    /// Init script or crontab registration failed
    #[error("Link error: {0}")]
    LinkError(String),

    /// External hook failed
    #[error("External hook error: {0}")]
    ExternalError(String),

    /// Remote source download failed
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Requested package or resource does not exist
    #[error("Not found: {0}")]
    NotFoundError(String),
}

impl Error {
    /// Integrity errors are never retried and abort the whole operation
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::ChecksumMismatch { .. } | Error::MalformedArchive(_))
    }

    /// Resolution errors abort before any filesystem mutation
    pub fn is_resolution(&self) -> bool {
        matches!(self, Error::NoSolution(_) | Error::SearchLimitExceeded(_))
    }
}

/// Result type alias using tpkg's Error type
pub type Result<T> = std::result::Result<T, Error>;
