use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlaygroundError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into PlaygroundError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Worker task failed: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Build error: {0}")]
    BuildError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Migration {version} failed in batch {batch}: {message}")]
    MigrationError {
        version: String,
        batch: usize,
        message: String,
    },

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl PlaygroundError {
    /// True for errors that come from infrastructure not being reachable yet.
    /// These are the only errors a retry policy should retry.
    pub fn is_connectivity(&self) -> bool {
        match self {
            PlaygroundError::ConnectionError(_)
            | PlaygroundError::PoolError(_)
            | PlaygroundError::IoError(_) => true,
            PlaygroundError::DatabaseError(RusqliteError::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
