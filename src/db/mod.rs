// src/db/mod.rs

//! Operation history database
//!
//! Every install, upgrade and removal run is recorded as a changeset in
//! `<var_dir>/history.db`, with one event row per package touched. The
//! installed package records under `metadata/` remain the source of truth
//! for what is installed; the database only answers "what happened".

pub mod models;
pub mod schema;

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::{debug, info};

/// Create (if needed) and migrate the history database
///
/// Idempotent: calling it on an existing database only applies pending
/// migrations.
pub fn init(db_path: &Path) -> Result<Connection> {
    debug!("Initializing history database at: {}", db_path.display());

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::InitError(format!("Failed to create database directory: {}", e)))?;
    }

    let conn = Connection::open(db_path)?;

    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    schema::migrate(&conn)?;
    info!("History database ready at {}", db_path.display());
    Ok(conn)
}

/// Open an existing history database
pub fn open(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        return Err(Error::DatabaseNotFound(db_path.display().to_string()));
    }

    let conn = Connection::open(db_path)?;

    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("var/history.db");

        let conn = init(&db_path).unwrap();
        assert!(db_path.exists());
        assert_eq!(schema::get_schema_version(&conn).unwrap(), schema::SCHEMA_VERSION);
    }

    #[test]
    fn test_open_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("history.db");
        init(&db_path).unwrap();
        assert!(open(&db_path).is_ok());
    }

    #[test]
    fn test_open_nonexistent_database() {
        let result = open(Path::new("/nonexistent/path/history.db"));
        assert!(matches!(result.unwrap_err(), Error::DatabaseNotFound(_)));
    }
}
