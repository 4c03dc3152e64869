// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Audit trail — append-only SQLite log of every access-control decision and
// state-mutating IPP operation.
//
// Schema:
//   audit_log(
//     id          INTEGER PRIMARY KEY AUTOINCREMENT,
//     timestamp   TEXT    NOT NULL,   -- RFC 3339
//     operation   TEXT    NOT NULL,   -- IPP operation name, e.g. "Cancel-Job"
//     actor       TEXT    NOT NULL,   -- authenticated username, or "-"
//     object_ref  TEXT    NOT NULL,   -- e.g. "job:42", "printer:p1"
//     success     INTEGER NOT NULL,   -- 0 = denied/failed, 1 = allowed
//     details     TEXT                -- optional free-form context
//   )

use std::path::Path;

use chrono::Utc;
use inftprint_core::error::InftError;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

fn db_err(e: rusqlite::Error) -> InftError {
    InftError::Internal(format!("audit database error: {e}"))
}

/// A single entry in the audit log, used for queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub operation: String,
    pub actor: String,
    pub object_ref: String,
    pub success: bool,
    pub details: Option<String>,
}

/// Append-only audit log backed by a SQLite database.
///
/// Every access-control decision (admin-group gate, owner check) and every
/// state-mutating operation the dispatcher routes is recorded with a
/// timestamp, the operation name, the authenticated actor, and the object
/// it targeted.
pub struct AuditLog {
    conn: Connection,
}

impl AuditLog {
    /// Open (or create) the audit database at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, InftError> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;").map_err(db_err)?;
        Self::create_schema(&conn)?;
        debug!("audit log opened");
        Ok(Self { conn })
    }

    /// Open an in-memory audit database (useful for tests).
    pub fn open_in_memory() -> Result<Self, InftError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::create_schema(&conn)?;
        debug!("in-memory audit log opened");
        Ok(Self { conn })
    }

    fn create_schema(conn: &Connection) -> Result<(), InftError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp   TEXT    NOT NULL,
                operation   TEXT    NOT NULL,
                actor       TEXT    NOT NULL,
                object_ref  TEXT    NOT NULL,
                success     INTEGER NOT NULL,
                details     TEXT
            );",
        )
        .map_err(db_err)
    }

    /// Record a new audit entry.
    #[instrument(skip(self, details), fields(%operation, %actor, %object_ref, success))]
    pub fn record(
        &self,
        operation: &str,
        actor: &str,
        object_ref: &str,
        success: bool,
        details: Option<&str>,
    ) -> Result<(), InftError> {
        let timestamp = Utc::now().to_rfc3339();
        let success_int: i32 = if success { 1 } else { 0 };

        self.conn
            .execute(
                "INSERT INTO audit_log (timestamp, operation, actor, object_ref, success, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![timestamp, operation, actor, object_ref, success_int, details],
            )
            .map_err(db_err)?;

        debug!("audit entry recorded");
        Ok(())
    }

    /// Retrieve all entries for a given object, ordered by timestamp
    /// ascending.
    pub fn entries_for_object(&self, object_ref: &str) -> Result<Vec<AuditEntry>, InftError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, timestamp, operation, actor, object_ref, success, details
                 FROM audit_log
                 WHERE object_ref = ?1
                 ORDER BY timestamp ASC",
            )
            .map_err(db_err)?;

        let rows = stmt.query_map(params![object_ref], Self::row_to_entry).map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(db_err)?);
        }
        Ok(entries)
    }

    /// Retrieve the most recent `limit` entries, ordered newest-first.
    pub fn recent_entries(&self, limit: u32) -> Result<Vec<AuditEntry>, InftError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, timestamp, operation, actor, object_ref, success, details
                 FROM audit_log
                 ORDER BY id DESC
                 LIMIT ?1",
            )
            .map_err(db_err)?;

        let rows = stmt.query_map(params![limit], Self::row_to_entry).map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(db_err)?);
        }
        Ok(entries)
    }

    /// Return the total number of entries in the audit log.
    pub fn count(&self) -> Result<u64, InftError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .map_err(db_err)
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
        Ok(AuditEntry {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            operation: row.get(2)?,
            actor: row.get(3)?,
            object_ref: row.get(4)?,
            success: row.get::<_, i32>(5)? != 0,
            details: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_log() -> AuditLog {
        AuditLog::open_in_memory().expect("open in-memory audit log")
    }

    #[test]
    fn record_and_count() {
        let log = make_log();
        assert_eq!(log.count().unwrap(), 0);

        log.record("Cancel-Job", "alice", "job:1", true, None).unwrap();
        log.record("Hold-Job", "alice", "job:1", true, Some("retry")).unwrap();

        assert_eq!(log.count().unwrap(), 2);
    }

    #[test]
    fn entries_for_object() {
        let log = make_log();
        log.record("Cancel-Job", "alice", "job:1", true, None).unwrap();
        log.record("Pause-Printer", "bob", "printer:p1", true, None).unwrap();
        log.record("Release-Job", "alice", "job:1", false, Some("not owner")).unwrap();

        let entries = log.entries_for_object("job:1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].operation, "Cancel-Job");
        assert!(entries[0].success);
        assert_eq!(entries[1].operation, "Release-Job");
        assert!(!entries[1].success);
    }

    #[test]
    fn recent_entries_ordering() {
        let log = make_log();
        for i in 0..5 {
            log.record("Get-Job-Attributes", "alice", &format!("job:{i}"), true, None)
                .unwrap();
        }

        let recent = log.recent_entries(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent[0].id > recent[1].id);
        assert!(recent[1].id > recent[2].id);
    }

    #[test]
    fn denied_entry_carries_details() {
        let log = make_log();
        log.record("Delete-Printer", "eve", "printer:p1", false, Some("not in lpadmin"))
            .unwrap();

        let entries = log.entries_for_object("printer:p1").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
        assert_eq!(entries[0].details.as_deref(), Some("not in lpadmin"));
    }
}
