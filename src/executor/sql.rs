use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use rusqlite::fallible_iterator::FallibleIterator;
use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection, Statement};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use tokio::sync::OnceCell;

use super::{ConsoleMessage, MessageType};
use crate::database::{Database, SchemaDescription};
use crate::error::PlaygroundError;
use crate::migration::{Ledger, MigrationRecord};
use crate::retry::RetryPolicy;

/// Tabular result of one SQL request.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SqlOutcome {
    pub data: Vec<Map<String, Value>>,
    #[serde(rename = "rowCount")]
    pub row_count: usize,
    pub columns: Vec<String>,
}

impl SqlOutcome {
    /// Runs every statement in `sql` in order. The outcome holds the rows of
    /// the last row-returning statement; without one it reports the number
    /// of rows changed. Text with no statements yields an empty outcome.
    pub fn query(conn: &Connection, sql: &str) -> Result<Self, PlaygroundError> {
        let mut rows: Option<Self> = None;
        let mut changed = 0;

        let mut batch = Batch::new(conn, sql);
        while let Some(mut stmt) = batch.next()? {
            if stmt.column_count() == 0 {
                changed += stmt.execute([])?;
            } else {
                rows = Some(Self::collect_rows(&mut stmt)?);
            }
        }

        Ok(rows.unwrap_or(Self {
            data: Vec::new(),
            row_count: changed,
            columns: Vec::new(),
        }))
    }

    fn collect_rows(stmt: &mut Statement<'_>) -> Result<Self, PlaygroundError> {
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut data = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut object = Map::new();
            for (i, name) in columns.iter().enumerate() {
                object.insert(name.clone(), to_json(row.get_ref(i)?));
            }
            data.push(object);
        }

        Ok(Self {
            row_count: data.len(),
            data,
            columns,
        })
    }

    /// Console rendering used when SQL runs through the uniform endpoint.
    pub fn to_messages(&self) -> Vec<ConsoleMessage> {
        let mut messages = vec![ConsoleMessage::new(
            MessageType::Log,
            format!("Query executed successfully. Rows returned: {}", self.row_count),
        )];

        if !self.columns.is_empty() {
            messages.push(ConsoleMessage::new(MessageType::Log, self.columns.join(" | ")));
        }

        for row in &self.data {
            let line = row
                .values()
                .map(|value| match value {
                    Value::Null => "NULL".to_string(),
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" | ");
            messages.push(ConsoleMessage::new(MessageType::Log, line));
        }

        messages.push(ConsoleMessage::new(
            MessageType::Log,
            format!("Total rows: {}", self.data.len()),
        ));
        messages
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

/// SQL against the playground database. The pool is opened on first use,
/// retrying while the database is unreachable.
pub struct SqlRunner {
    path: PathBuf,
    pool_size: u32,
    pool_timeout: Duration,
    policy: RetryPolicy,
    db: OnceCell<Database>,
}

impl SqlRunner {
    pub fn new(path: &Path, pool_size: u32, pool_timeout: Duration, policy: RetryPolicy) -> Self {
        Self {
            path: path.to_path_buf(),
            pool_size,
            pool_timeout,
            policy,
            db: OnceCell::new(),
        }
    }

    /// A runner over an already open database.
    #[cfg(test)]
    pub(crate) fn with_database(db: Database, policy: RetryPolicy) -> Self {
        Self {
            path: db.path().to_path_buf(),
            pool_size: 0,
            pool_timeout: Duration::ZERO,
            policy,
            db: OnceCell::new_with(Some(db)),
        }
    }

    pub async fn database(&self) -> Result<&Database, PlaygroundError> {
        self.db
            .get_or_try_init(|| async {
                let db = self
                    .policy
                    .retry(|| {
                        let path = self.path.clone();
                        let pool_size = self.pool_size;
                        let pool_timeout = self.pool_timeout;
                        async move {
                            tokio::task::spawn_blocking(move || {
                                Database::open(&path, pool_size, pool_timeout)
                            })
                            .await?
                        }
                    })
                    .await?;
                info!("Connected to SQL database {}", self.path.display());
                Ok(db)
            })
            .await
    }

    pub async fn execute(&self, query: &str) -> Result<SqlOutcome, PlaygroundError> {
        let db = self.database().await?.clone();
        let query = query.to_string();

        let outcome = tokio::task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            SqlOutcome::query(&conn, &query)
        })
        .await??;

        debug!("SQL returned {} rows", outcome.row_count);
        Ok(outcome)
    }

    pub async fn describe_schema(&self) -> Result<SchemaDescription, PlaygroundError> {
        let db = self.database().await?.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            Database::describe_schema(&conn)
        })
        .await?
    }

    pub async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>, PlaygroundError> {
        let db = self.database().await?.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            Ledger::applied(&conn)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn memory() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_select_literal() {
        let conn = memory();
        let outcome = SqlOutcome::query(&conn, "SELECT 1 AS x").unwrap();
        assert_eq!(outcome.columns, vec!["x".to_string()]);
        assert_eq!(outcome.row_count, 1);
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"data": [{"x": 1}], "rowCount": 1, "columns": ["x"]})
        );
    }

    #[test]
    fn test_value_mapping_and_column_order() {
        let conn = memory();
        let outcome = SqlOutcome::query(
            &conn,
            "SELECT 'Laptop' AS name, 999.5 AS price, NULL AS discount, x'00ff' AS raw, 3 AS qty",
        )
        .unwrap();

        assert_eq!(outcome.columns, vec!["name", "price", "discount", "raw", "qty"]);
        let row = &outcome.data[0];
        let keys: Vec<&String> = row.keys().collect();
        assert_eq!(keys, vec!["name", "price", "discount", "raw", "qty"]);
        assert_eq!(row["name"], json!("Laptop"));
        assert_eq!(row["price"], json!(999.5));
        assert_eq!(row["discount"], Value::Null);
        assert_eq!(row["raw"], json!("00ff"));
        assert_eq!(row["qty"], json!(3));
    }

    #[test]
    fn test_statements_without_rows_report_changes() {
        let conn = memory();
        let created = SqlOutcome::query(&conn, "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        assert_eq!(created.row_count, 0);
        assert!(created.columns.is_empty());

        let inserted = SqlOutcome::query(&conn, "INSERT INTO t (v) VALUES ('a'), ('b'), ('c')").unwrap();
        assert_eq!(inserted.row_count, 3);

        let empty = SqlOutcome::query(&conn, "SELECT * FROM t WHERE id > 10").unwrap();
        assert_eq!(empty.row_count, 0);
        assert_eq!(empty.columns, vec!["id", "v"]);
    }

    #[test]
    fn test_multiple_statements_run_as_batch() {
        let conn = memory();
        let outcome = SqlOutcome::query(
            &conn,
            "CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1); INSERT INTO t VALUES (2);",
        )
        .unwrap();
        assert_eq!(outcome.row_count, 2);
        assert!(outcome.columns.is_empty());
        assert!(outcome.data.is_empty());

        let count = SqlOutcome::query(&conn, "SELECT COUNT(*) AS n FROM t").unwrap();
        assert_eq!(count.data[0]["n"], json!(2));
    }

    #[test]
    fn test_batch_returns_last_rows() {
        let conn = memory();
        let outcome = SqlOutcome::query(
            &conn,
            "CREATE TABLE u (v INTEGER);
             INSERT INTO u VALUES (1), (2);
             SELECT 'ignored' AS first;
             SELECT v FROM u ORDER BY v DESC;
             INSERT INTO u VALUES (3);",
        )
        .unwrap();
        assert_eq!(outcome.columns, vec!["v"]);
        assert_eq!(outcome.row_count, 2);
        assert_eq!(outcome.data[0]["v"], json!(2));
    }

    #[test]
    fn test_batch_stops_at_first_error() {
        let conn = memory();
        let err = SqlOutcome::query(
            &conn,
            "CREATE TABLE w (v INTEGER); INSERT INTO nowhere VALUES (1); INSERT INTO w VALUES (1);",
        )
        .unwrap_err();
        assert!(err.to_string().contains("no such table: nowhere"), "{}", err);

        let count = SqlOutcome::query(&conn, "SELECT COUNT(*) AS n FROM w").unwrap();
        assert_eq!(count.data[0]["n"], json!(0));
    }

    #[test]
    fn test_text_without_statements_is_empty() {
        let conn = memory();
        assert_eq!(SqlOutcome::query(&conn, "-- only a comment").unwrap(), SqlOutcome::default());
        assert_eq!(SqlOutcome::query(&conn, ";").unwrap(), SqlOutcome::default());
        assert_eq!(SqlOutcome::query(&conn, "/* note */ ;;").unwrap(), SqlOutcome::default());
    }

    #[test]
    fn test_errors_keep_driver_message() {
        let conn = memory();
        let err = SqlOutcome::query(&conn, "SELECT * FROM missing_table").unwrap_err();
        assert!(err.to_string().contains("no such table: missing_table"), "{}", err);
    }

    #[test]
    fn test_to_messages() {
        let conn = memory();
        let outcome = SqlOutcome::query(&conn, "SELECT 1 AS id, NULL AS note, 'x' AS tag").unwrap();
        let lines: Vec<String> = outcome.to_messages().into_iter().map(|m| m.message).collect();
        assert_eq!(
            lines,
            vec![
                "Query executed successfully. Rows returned: 1",
                "id | note | tag",
                "1 | NULL | x",
                "Total rows: 1",
            ]
        );
    }

    #[tokio::test]
    async fn test_runner_connects_lazily() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lazy.db");
        let runner = SqlRunner::new(&path, 2, Duration::from_secs(5), RetryPolicy::gateway(2, 10));

        runner.execute("CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT NOT NULL)").await.unwrap();
        runner.execute("INSERT INTO products (name) VALUES ('Mouse')").await.unwrap();
        let outcome = runner.execute("SELECT name FROM products").await.unwrap();
        assert_eq!(outcome.data[0]["name"], json!("Mouse"));

        let schema = runner.describe_schema().await.unwrap();
        assert_eq!(schema["products"].len(), 2);
        assert_eq!(schema["products"][0].key, "PRIMARY");

        assert!(runner.applied_migrations().await.unwrap().is_empty());
    }
}
