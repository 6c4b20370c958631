use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::PlaygroundError;

pub const LEDGER_TABLE: &str = "schema_migrations";

const CREATE_LEDGER_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version TEXT NOT NULL UNIQUE,
    description TEXT,
    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    execution_time_ms INTEGER NOT NULL DEFAULT 0
);
"#;

/// One applied migration. Rows are only ever inserted.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MigrationRecord {
    pub version: String,
    pub description: String,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: i64,
}

/// The `schema_migrations` table.
pub struct Ledger;

impl Ledger {
    pub fn ensure(conn: &Connection) -> Result<(), PlaygroundError> {
        conn.execute_batch(CREATE_LEDGER_SQL)?;
        Ok(())
    }

    pub fn is_applied(conn: &Connection, version: &str) -> Result<bool, PlaygroundError> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?",
                [version],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn record(
        conn: &Connection,
        version: &str,
        description: &str,
        execution_time_ms: i64,
    ) -> Result<MigrationRecord, PlaygroundError> {
        let applied_at = Utc::now();
        conn.execute(
            "INSERT INTO schema_migrations (version, description, applied_at, execution_time_ms)
             VALUES (?, ?, ?, ?)",
            params![version, description, applied_at, execution_time_ms],
        )?;

        Ok(MigrationRecord {
            version: version.to_string(),
            description: description.to_string(),
            applied_at,
            execution_time_ms,
        })
    }

    /// All applied migrations ordered by version. An absent ledger reads as empty.
    pub fn applied(conn: &Connection) -> Result<Vec<MigrationRecord>, PlaygroundError> {
        let ledger_exists: bool = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            [LEDGER_TABLE],
            |row| row.get::<_, i64>(0),
        )? > 0;

        if !ledger_exists {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(
            "SELECT version, COALESCE(description, ''), applied_at, execution_time_ms
             FROM schema_migrations ORDER BY version",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(MigrationRecord {
                    version: row.get(0)?,
                    description: row.get(1)?,
                    applied_at: row.get(2)?,
                    execution_time_ms: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        Ledger::ensure(&conn).unwrap();
        conn
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let conn = ledger_conn();
        Ledger::ensure(&conn).unwrap();
        Ledger::ensure(&conn).unwrap();
    }

    #[test]
    fn test_record_then_is_applied() {
        let conn = ledger_conn();
        assert!(!Ledger::is_applied(&conn, "001-init").unwrap());

        let record = Ledger::record(&conn, "001-init", "Migration from 001-init.sql", 12).unwrap();
        assert_eq!(record.version, "001-init");
        assert!(Ledger::is_applied(&conn, "001-init").unwrap());
        assert!(!Ledger::is_applied(&conn, "002-add-index").unwrap());
    }

    #[test]
    fn test_version_is_unique() {
        let conn = ledger_conn();
        Ledger::record(&conn, "001-init", "first", 1).unwrap();
        let err = Ledger::record(&conn, "001-init", "again", 1).unwrap_err();
        match err {
            PlaygroundError::DatabaseError(rusqlite::Error::SqliteFailure(e, _)) => {
                assert_eq!(e.code, rusqlite::ErrorCode::ConstraintViolation)
            }
            other => panic!("expected constraint violation, got {:?}", other),
        }
    }

    #[test]
    fn test_applied_lists_in_version_order() {
        let conn = ledger_conn();
        Ledger::record(&conn, "002-add-index", "second", 5).unwrap();
        Ledger::record(&conn, "001-init", "first", 7).unwrap();

        let records = Ledger::applied(&conn).unwrap();
        let versions: Vec<&str> = records.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, vec!["001-init", "002-add-index"]);
        assert_eq!(records[0].execution_time_ms, 7);
    }

    #[test]
    fn test_applied_at_defaults_to_now() {
        let conn = ledger_conn();
        let before = Utc::now() - chrono::Duration::seconds(5);
        conn.execute(
            "INSERT INTO schema_migrations (version, description) VALUES ('003-seed', 'manual')",
            [],
        )
        .unwrap();

        let records = Ledger::applied(&conn).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].execution_time_ms, 0);
        assert!(records[0].applied_at > before);
    }

    #[test]
    fn test_applied_without_ledger_is_empty() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(Ledger::applied(&conn).unwrap().is_empty());
    }
}
