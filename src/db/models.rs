// src/db/models.rs

//! History records
//!
//! Rust structs for the `changesets` and `package_events` tables with
//! their insert/query helpers.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// Kind of run a changeset records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Install,
    Upgrade,
    Remove,
}

impl Operation {
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Install => "install",
            Operation::Upgrade => "upgrade",
            Operation::Remove => "remove",
        }
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "install" => Ok(Operation::Install),
            "upgrade" => Ok(Operation::Upgrade),
            "remove" => Ok(Operation::Remove),
            _ => Err(format!("Invalid operation: {}", s)),
        }
    }
}

/// Changeset status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangesetStatus {
    Pending,
    Applied,
    Failed,
}

impl ChangesetStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ChangesetStatus::Pending => "pending",
            ChangesetStatus::Applied => "applied",
            ChangesetStatus::Failed => "failed",
        }
    }
}

impl FromStr for ChangesetStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangesetStatus::Pending),
            "applied" => Ok(ChangesetStatus::Applied),
            "failed" => Ok(ChangesetStatus::Failed),
            _ => Err(format!("Invalid changeset status: {}", s)),
        }
    }
}

/// One install, upgrade or remove run
#[derive(Debug, Clone)]
pub struct Changeset {
    pub id: Option<i64>,
    pub operation: Operation,
    pub description: String,
    pub status: ChangesetStatus,
    /// Exit bitmask of the run
    pub exit_status: i32,
    pub created_at: Option<String>,
    pub finished_at: Option<String>,
}

impl Changeset {
    pub fn new(operation: Operation, description: String) -> Self {
        Self {
            id: None,
            operation,
            description,
            status: ChangesetStatus::Pending,
            exit_status: 0,
            created_at: None,
            finished_at: None,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO changesets (operation, description, status) VALUES (?1, ?2, ?3)",
            params![self.operation.as_str(), &self.description, self.status.as_str()],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, operation, description, status, exit_status, created_at, finished_at
             FROM changesets WHERE id = ?1",
        )?;

        Ok(stmt.query_row([id], Self::from_row).optional()?)
    }

    /// Most recent first
    pub fn list_recent(conn: &Connection, limit: usize) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, operation, description, status, exit_status, created_at, finished_at
             FROM changesets ORDER BY id DESC LIMIT ?1",
        )?;

        let changesets = stmt
            .query_map([limit as i64], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(changesets)
    }

    /// Mark the run finished
    pub fn finish(&mut self, conn: &Connection, status: ChangesetStatus, exit_status: i32) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InitError("Cannot finish changeset without ID".to_string()))?;

        conn.execute(
            "UPDATE changesets SET status = ?1, exit_status = ?2, finished_at = CURRENT_TIMESTAMP
             WHERE id = ?3",
            params![status.as_str(), exit_status, id],
        )?;

        self.status = status;
        self.exit_status = exit_status;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let operation: String = row.get(1)?;
        let status: String = row.get(3)?;

        Ok(Self {
            id: Some(row.get(0)?),
            operation: operation.parse().map_err(|e| conversion_error(1, e))?,
            description: row.get(2)?,
            status: status.parse().map_err(|e| conversion_error(3, e))?,
            exit_status: row.get(4)?,
            created_at: row.get(5)?,
            finished_at: row.get(6)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Install,
    Remove,
}

impl EventAction {
    pub fn as_str(&self) -> &str {
        match self {
            EventAction::Install => "install",
            EventAction::Remove => "remove",
        }
    }
}

impl FromStr for EventAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "install" => Ok(EventAction::Install),
            "remove" => Ok(EventAction::Remove),
            _ => Err(format!("Invalid package action: {}", s)),
        }
    }
}

/// One package installed or removed within a changeset
#[derive(Debug, Clone)]
pub struct PackageEvent {
    pub id: Option<i64>,
    pub changeset_id: i64,
    pub action: EventAction,
    pub name: String,
    pub version: String,
    pub package_version: Option<String>,
    pub filename: Option<String>,
    pub succeeded: bool,
    pub message: Option<String>,
    pub created_at: Option<String>,
}

impl PackageEvent {
    pub fn new(changeset_id: i64, action: EventAction, name: String, version: String) -> Self {
        Self {
            id: None,
            changeset_id,
            action,
            name,
            version,
            package_version: None,
            filename: None,
            succeeded: true,
            message: None,
            created_at: None,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO package_events
                (changeset_id, action, name, version, package_version, filename, succeeded, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                self.changeset_id,
                self.action.as_str(),
                &self.name,
                &self.version,
                &self.package_version,
                &self.filename,
                self.succeeded,
                &self.message,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_changeset(conn: &Connection, changeset_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, changeset_id, action, name, version, package_version, filename,
                    succeeded, message, created_at
             FROM package_events WHERE changeset_id = ?1 ORDER BY id",
        )?;

        let events = stmt
            .query_map([changeset_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, changeset_id, action, name, version, package_version, filename,
                    succeeded, message, created_at
             FROM package_events WHERE name = ?1 ORDER BY id",
        )?;

        let events = stmt
            .query_map([name], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let action: String = row.get(2)?;

        Ok(Self {
            id: Some(row.get(0)?),
            changeset_id: row.get(1)?,
            action: action.parse().map_err(|e| conversion_error(2, e))?,
            name: row.get(3)?,
            version: row.get(4)?,
            package_version: row.get(5)?,
            filename: row.get(6)?,
            succeeded: row.get(7)?,
            message: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_changeset_lifecycle() {
        let (_temp, conn) = create_test_db();

        let mut changeset = Changeset::new(Operation::Install, "install foo".to_string());
        let id = changeset.insert(&conn).unwrap();
        assert!(id > 0);

        let found = Changeset::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(found.status, ChangesetStatus::Pending);
        assert_eq!(found.operation, Operation::Install);

        changeset.finish(&conn, ChangesetStatus::Applied, 2).unwrap();
        let found = Changeset::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(found.status, ChangesetStatus::Applied);
        assert_eq!(found.exit_status, 2);
        assert!(found.finished_at.is_some());
    }

    #[test]
    fn test_list_recent_orders_newest_first() {
        let (_temp, conn) = create_test_db();
        for op in [Operation::Install, Operation::Upgrade, Operation::Remove] {
            Changeset::new(op, op.as_str().to_string()).insert(&conn).unwrap();
        }

        let recent = Changeset::list_recent(&conn, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].operation, Operation::Remove);
        assert_eq!(recent[1].operation, Operation::Upgrade);
    }

    #[test]
    fn test_package_events() {
        let (_temp, conn) = create_test_db();
        let changeset_id = Changeset::new(Operation::Upgrade, "upgrade foo".to_string())
            .insert(&conn)
            .unwrap();

        let mut removed = PackageEvent::new(changeset_id, EventAction::Remove, "foo".into(), "1.0".into());
        removed.insert(&conn).unwrap();

        let mut installed = PackageEvent::new(changeset_id, EventAction::Install, "foo".into(), "2.0".into());
        installed.package_version = Some("3".into());
        installed.filename = Some("foo-2.0-3.tpkg".into());
        installed.succeeded = false;
        installed.message = Some("preinstall failed".into());
        installed.insert(&conn).unwrap();

        let events = PackageEvent::find_by_changeset(&conn, changeset_id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, EventAction::Remove);
        assert!(!events[1].succeeded);
        assert_eq!(events[1].filename.as_deref(), Some("foo-2.0-3.tpkg"));

        assert_eq!(PackageEvent::find_by_name(&conn, "foo").unwrap().len(), 2);
        assert!(PackageEvent::find_by_name(&conn, "bar").unwrap().is_empty());
    }
}
