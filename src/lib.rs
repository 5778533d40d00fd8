// src/lib.rs

//! tpkg Package Manager
//!
//! Host package manager for self-contained `.tpkg` archives, with
//! dependency resolution, checksummed and optionally encrypted payloads,
//! and install/remove runs that keep going package by package.
//!
//! # Architecture
//!
//! - Metadata: `tpkg.yml` manifests plus a per-file checksum ledger
//! - Resolver: worklist search over candidate pools with depth-vector
//!   enumeration of alternatives
//! - Archives: a checksum manifest wrapping an inner tar
//! - Installed state: one metadata directory per installed package
//! - History: every operation recorded as a changeset in SQLite

pub mod archive;
pub mod config;
pub mod db;
mod error;
pub mod host;
pub mod install;
pub mod installed;
pub mod lock;
pub mod metadata;
pub mod repository;
pub mod resolver;
pub mod version;

pub use error::{Error, Result};
