use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use r2d2::{CustomizeConnection, Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde::Serialize;

use crate::error::PlaygroundError;
use crate::migration::LEDGER_TABLE;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Per-connection pragmas applied whenever the pool hands out a connection.
#[derive(Debug)]
struct SqlitePragmaCustomizer;

impl CustomizeConnection<Connection, rusqlite::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
    }
}

/// Column description returned by `GET /api/schema`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    pub key: String,
}

pub type SchemaDescription = BTreeMap<String, Vec<ColumnInfo>>;

/// Handle to the playground database. Cloning is cheap: clones share the pool.
#[derive(Clone, Debug)]
pub struct Database {
    path: PathBuf,
    pool: DbPool,
}

impl Database {
    /// Makes sure the database file (and its directory) exists. Returns true
    /// when the database had to be created.
    pub fn ensure_database(path: &Path) -> Result<bool, PlaygroundError> {
        if path.exists() {
            info!("Database {} already exists", path.display());
            return Ok(false);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        info!("Creating database {}", path.display());
        Connection::open(path)?;
        Ok(true)
    }

    /// Opens a bounded connection pool. `pool_timeout` is how long a caller
    /// waits for a free connection before the checkout fails.
    pub fn open(path: &Path, pool_size: u32, pool_timeout: Duration) -> Result<Self, PlaygroundError> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(pool_size)
            .min_idle(Some(0))
            .connection_timeout(pool_timeout)
            .connection_customizer(Box::new(SqlitePragmaCustomizer))
            .build(manager)?;

        // Establish one connection up front so open failures surface here
        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        debug!("Database pool ready for {} (max {} connections)", path.display(), pool_size);

        Ok(Self {
            path: path.to_path_buf(),
            pool,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_connection(&self) -> Result<DbConnection, PlaygroundError> {
        self.pool.get().map_err(|e| {
            PlaygroundError::Timeout(format!("waiting for a database connection: {}", e))
        })
    }

    /// Describes every user table: columns in declaration order with their
    /// declared type, nullability and key role.
    pub fn describe_schema(conn: &Connection) -> Result<SchemaDescription, PlaygroundError> {
        let mut tables_stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name <> ?1
             ORDER BY name",
        )?;
        let tables = tables_stmt
            .query_map([LEDGER_TABLE], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut schema = SchemaDescription::new();

        for table in tables {
            let foreign_columns = {
                let mut fk_stmt =
                    conn.prepare("SELECT \"from\" FROM pragma_foreign_key_list(?1)")?;
                let from_columns = fk_stmt
                    .query_map([&table], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                from_columns
            };

            let mut col_stmt = conn.prepare(
                "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
            )?;
            let columns = col_stmt
                .query_map([&table], |row| {
                    let name: String = row.get(0)?;
                    let data_type: String = row.get(1)?;
                    let not_null: i64 = row.get(2)?;
                    let pk: i64 = row.get(3)?;
                    Ok((name, data_type, not_null, pk))
                })?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|(name, data_type, not_null, pk)| {
                    let key = if pk > 0 {
                        "PRIMARY"
                    } else if foreign_columns.contains(&name) {
                        "FOREIGN"
                    } else {
                        ""
                    };
                    ColumnInfo {
                        nullable: not_null == 0 && pk == 0,
                        key: key.to_string(),
                        name,
                        data_type,
                    }
                })
                .collect();

            schema.insert(table, columns);
        }

        Ok(schema)
    }
}
