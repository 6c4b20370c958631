mod ledger;
mod script;

use std::path::Path;
use std::time::Instant;

use log::{error, info, Level};
use logging_timer::timer;
use rusqlite::Connection;

use crate::config::Config;
use crate::database::Database;
use crate::error::PlaygroundError;
use crate::retry::RetryPolicy;

pub use ledger::{Ledger, MigrationRecord, LEDGER_TABLE};
pub use script::{MigrationScript, ScriptDirectory, ScriptListing};

/// Lifecycle of one script within a run. `Applied` is persisted in the
/// ledger; `Failed` only lasts for the run that hit it.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptState {
    Pending,
    Applying,
    Applied,
    Skipped,
    Failed(String),
}

/// Tally of a `run()` call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSummary {
    pub applied: usize,
    pub skipped: usize,
    pub total: usize,
}

/// A version known to the runner and whether the ledger has it.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationStatus {
    pub version: String,
    pub record: Option<MigrationRecord>,
}

/// Applies versioned `.sql` scripts, each exactly once, in file name order.
///
/// Each script's ledger row is committed as soon as that script succeeds, so
/// a failure part way through a run leaves the earlier scripts applied. A
/// failing script is not rolled back either: batches that already ran stay
/// in effect.
pub struct MigrationRunner {
    db: Database,
    scripts: ScriptDirectory,
}

impl MigrationRunner {
    pub fn new(db: Database, scripts_dir: &Path) -> Self {
        Self {
            db,
            scripts: ScriptDirectory::new(scripts_dir),
        }
    }

    /// Ensures the database exists and connects to it, retrying while the
    /// database is unavailable. Exhausting the retries is fatal to the caller.
    pub fn connect(config: &Config) -> Result<Self, PlaygroundError> {
        let db_path = Path::new(&config.database.path);
        let policy = RetryPolicy::migrations(
            config.migrations.max_retries,
            config.migrations.retry_base_ms,
            config.migrations.retry_max_ms,
        );

        let db = policy.retry_blocking(|| {
            Database::ensure_database(db_path)?;
            Database::open(
                db_path,
                config.database.pool_size,
                config.database.pool_timeout(),
            )
        })?;
        info!("Successfully connected to database {}", db_path.display());

        Ok(Self::new(db, Path::new(&config.migrations.directory)))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn ensure_ledger(&self) -> Result<(), PlaygroundError> {
        let conn = self.db.get_connection()?;
        Ledger::ensure(&conn)?;
        info!("Migrations table ready");
        Ok(())
    }

    pub fn list_scripts(&self) -> Result<ScriptListing, PlaygroundError> {
        self.scripts.list()
    }

    pub fn is_applied(&self, version: &str) -> Result<bool, PlaygroundError> {
        let conn = self.db.get_connection()?;
        Ledger::is_applied(&conn, version)
    }

    /// Runs the script's batches in order and records it in the ledger.
    /// The first failing batch stops the script.
    pub fn apply(&self, script: &MigrationScript) -> Result<MigrationRecord, PlaygroundError> {
        let _tmr = timer!(Level::Debug; "MigrationRunner::apply", "{}", script.version);
        let start = Instant::now();
        let conn = self.db.get_connection()?;

        info!(
            "Executing migration {} ({} batches)",
            script.version,
            script.batches.len()
        );
        Self::execute_batches(&conn, script)?;

        let elapsed_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
        let record = Ledger::record(&conn, &script.version, &script.description(), elapsed_ms)?;
        info!("Migration {} completed in {}ms", script.version, elapsed_ms);

        Ok(record)
    }

    fn execute_batches(conn: &Connection, script: &MigrationScript) -> Result<(), PlaygroundError> {
        let total = script.batches.len();
        for (index, batch) in script.batches.iter().enumerate() {
            conn.execute_batch(batch).map_err(|e| {
                error!("Error in batch {} of {}: {}", index + 1, script.version, e);
                PlaygroundError::MigrationError {
                    version: script.version.clone(),
                    batch: index + 1,
                    message: e.to_string(),
                }
            })?;

            if (index + 1) % 10 == 0 {
                info!("Completed {}/{} batches", index + 1, total);
            }
        }
        Ok(())
    }

    /// Applies every pending script. Stops at the first failure; scripts
    /// applied before it stay recorded.
    pub fn run(&self) -> Result<RunSummary, PlaygroundError> {
        let listing = self.list_scripts()?;
        let mut summary = RunSummary {
            total: listing.len(),
            ..RunSummary::default()
        };

        if listing.is_empty() {
            info!("No migration files found in {}", self.scripts.path().display());
            return Ok(summary);
        }

        for entry in listing.iter() {
            let version = entry.version();
            let mut state = ScriptState::Pending;

            if self.is_applied(&version)? {
                info!("Skipping {} (already applied)", version);
                state = ScriptState::Skipped;
            } else {
                state = Self::transition(&version, state, ScriptState::Applying);
                log::debug!("Loading {}", entry.path().display());
                let outcome = entry.load().and_then(|script| self.apply(&script));
                match outcome {
                    Ok(_) => state = Self::transition(&version, state, ScriptState::Applied),
                    Err(e) => {
                        Self::transition(&version, state, ScriptState::Failed(e.to_string()));
                        return Err(e);
                    }
                }
            }

            match state {
                ScriptState::Applied => summary.applied += 1,
                ScriptState::Skipped => summary.skipped += 1,
                _ => {}
            }
        }

        info!(
            "Migration summary: applied {}, skipped {}, total {}",
            summary.applied, summary.skipped, summary.total
        );
        Ok(summary)
    }

    fn transition(version: &str, from: ScriptState, to: ScriptState) -> ScriptState {
        log::debug!("Migration {}: {:?} -> {:?}", version, from, to);
        if let ScriptState::Failed(reason) = &to {
            error!("Migration {} failed: {}", version, reason);
        }
        to
    }

    /// Every known script version with its ledger record, if applied.
    /// Ledger rows for versions with no file are listed too.
    pub fn status(&self) -> Result<Vec<MigrationStatus>, PlaygroundError> {
        let conn = self.db.get_connection()?;
        let mut records = Ledger::applied(&conn)?;
        let listing = self.list_scripts()?;

        let mut statuses: Vec<MigrationStatus> = listing
            .versions()
            .into_iter()
            .map(|version| {
                let record = records
                    .iter()
                    .position(|r| r.version == version)
                    .map(|i| records.remove(i));
                MigrationStatus { version, record }
            })
            .collect();

        statuses.extend(records.into_iter().map(|record| MigrationStatus {
            version: record.version.clone(),
            record: Some(record),
        }));
        statuses.sort_by(|a, b| a.version.cmp(&b.version));

        Ok(statuses)
    }
}
