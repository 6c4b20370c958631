mod api;
mod cli;
mod config;
mod database;
mod error;
mod executor;
mod hash;
mod migration;
mod retry;
mod server;

use clap::Parser;
use cli::Cli;
use flexi_logger::{
    Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming, WriteMode,
};
use log::{debug, error};

use crate::config::{Config, LoggingConfig, CONFIG};
use crate::error::PlaygroundError;

fn setup_logging(logging: &LoggingConfig) -> Result<LoggerHandle, PlaygroundError> {
    let logger = Logger::try_with_str(logging.log_spec())
        .map_err(|e| PlaygroundError::ConfigError(format!("Invalid log spec: {}", e)))?
        .format(flexi_logger::detailed_format);

    let logger = match &logging.directory {
        Some(dir) => logger
            .log_to_file(FileSpec::default().directory(dir).basename("playground"))
            .rotate(
                Criterion::Size(10 * 1024 * 1024),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(7),
            )
            .write_mode(WriteMode::BufferAndFlush)
            .duplicate_to_stderr(Duplicate::Warn),
        None => logger.log_to_stderr(),
    };

    logger
        .start()
        .map_err(|e| PlaygroundError::ConfigError(format!("Failed to start logger: {}", e)))
}

fn main() {
    let args = Cli::parse();

    let config_path = Config::config_path(args.config.as_deref());
    let config = Config::load_config(config_path.as_deref());

    // Keep the handle alive for the life of the process so file output is flushed
    let logger = match setup_logging(&config.logging) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("{}", e);
            None
        }
    };
    debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

    if CONFIG.set(config).is_err() {
        debug!("Configuration was already initialized");
    }

    if let Err(err) = args.run(Config::get()) {
        error!("{:?}", err);
        eprintln!("{}", err);
        if let Some(handle) = &logger {
            handle.flush();
        }
        std::process::exit(1);
    }
}
