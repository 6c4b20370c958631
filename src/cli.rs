use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::info;

use crate::api::state::{AppState, ExecutorState};
use crate::config::Config;
use crate::error::PlaygroundError;
use crate::executor::{ArtifactStore, ExecutionGateway};
use crate::migration::MigrationRunner;
use crate::server::WebServer;

#[derive(Parser)]
#[command(
    name = "playground",
    version,
    about = "Playground: database migrations and sandboxed code execution backend"
)]
pub struct Cli {
    /// Config file to use instead of config.toml in the app data directory
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Start the server (default if no command specified)
    Serve,

    /// Apply pending SQL migrations to the database
    Migrate {
        /// List every migration and whether it is applied, without applying anything
        #[arg(long)]
        status: bool,
    },

    /// Start the stand-alone C# execution service
    #[command(name = "csharp-executor")]
    CsharpExecutor {
        #[arg(long, default_value_t = 3002)]
        port: u16,
    },

    /// Evict old compiled C# artifacts once and exit
    Cleanup,
}

impl Cli {
    pub fn run(self, config: &Config) -> Result<(), PlaygroundError> {
        // Default to Serve if no command specified
        match self.command.unwrap_or(Command::Serve) {
            Command::Serve => Self::start_server(config),
            Command::Migrate { status: true } => Self::migration_status(config),
            Command::Migrate { status: false } => Self::migrate(config),
            Command::CsharpExecutor { port } => Self::start_executor_service(config, port),
            Command::Cleanup => Self::cleanup(config),
        }
    }

    fn runtime() -> Result<tokio::runtime::Runtime, PlaygroundError> {
        tokio::runtime::Runtime::new()
            .map_err(|e| PlaygroundError::Error(format!("Failed to create runtime: {}", e)))
    }

    fn start_server(config: &Config) -> Result<(), PlaygroundError> {
        let host = config.server.host.clone();
        let port = config.server.port;

        info!("Starting server on {}:{}", host, port);

        let rt = Self::runtime()?;
        rt.block_on(async {
            let gateway = Arc::new(ExecutionGateway::from_config(config)?);
            let web_server = WebServer::new(host, port);
            web_server.start(AppState::new(gateway), &config.cache).await
        })
    }

    fn start_executor_service(config: &Config, port: u16) -> Result<(), PlaygroundError> {
        let host = config.server.host.clone();

        info!("Starting C# execution service on {}:{}", host, port);

        let rt = Self::runtime()?;
        rt.block_on(async {
            let runner = ExecutionGateway::csharp_runner(config, false)?;
            let web_server = WebServer::new(host, port);
            web_server
                .start_executor_service(ExecutorState::new(Arc::new(runner)))
                .await
        })
    }

    fn migrate(config: &Config) -> Result<(), PlaygroundError> {
        println!("🚀 Starting database migrations...");

        let runner = MigrationRunner::connect(config)?;
        println!("   Database: {}", runner.database().path().display());
        runner.ensure_ledger()?;
        let summary = runner.run()?;

        println!(
            "✅ Migrations complete: {} applied, {} skipped, {} total",
            summary.applied, summary.skipped, summary.total
        );
        Ok(())
    }

    fn migration_status(config: &Config) -> Result<(), PlaygroundError> {
        let runner = MigrationRunner::connect(config)?;
        runner.ensure_ledger()?;

        let statuses = runner.status()?;
        if statuses.is_empty() {
            println!("No migrations found in {}", config.migrations.directory);
            return Ok(());
        }

        for status in statuses {
            match status.record {
                Some(record) => println!(
                    "  applied  {}  {}  ({} ms)",
                    status.version,
                    record.applied_at.format("%Y-%m-%d %H:%M:%S"),
                    record.execution_time_ms
                ),
                None => println!("  pending  {}", status.version),
            }
        }
        Ok(())
    }

    fn cleanup(config: &Config) -> Result<(), PlaygroundError> {
        let store = ArtifactStore::new(Path::new(&config.executor.artifact_dir));
        let report = store.cleanup(config.cache.max_age(), config.cache.max_size)?;

        println!(
            "🧹 Artifact cleanup: scanned {}, removed {}",
            report.scanned, report.removed
        );
        Ok(())
    }
}
