use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

pub static CONFIG: OnceCell<Config> = OnceCell::new();

const ENV_PREFIX: &str = "PLAYGROUND_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub playground: String,
    pub rusqlite: String,
    pub directory: Option<String>,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const PLAYGROUND_LEVEL: &str = "info";
    const RUSQLITE_LEVEL: &str = "warn";

    fn default() -> Self {
        LoggingConfig {
            playground: Self::PLAYGROUND_LEVEL.to_string(),
            rusqlite: Self::RUSQLITE_LEVEL.to_string(),
            directory: None,
        }
    }

    /// Builds the flexi_logger spec string, e.g. `info, rusqlite=warn`
    pub fn log_spec(&self) -> String {
        format!("{}, rusqlite={}", self.playground, self.rusqlite)
    }

    fn ensure_valid(&mut self) {
        Self::ensure_level("playground", &mut self.playground, Self::PLAYGROUND_LEVEL);
        Self::ensure_level("rusqlite", &mut self.rusqlite, Self::RUSQLITE_LEVEL);
    }

    fn ensure_level(name: &str, level: &mut String, default: &str) {
        let str_original = level.clone();
        *level = level.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&level.as_str()) {
            eprintln!(
                "Config error: {} log level of '{}' is invalid - using default of '{}'",
                name, str_original, default
            );
            *level = default.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 5445,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub path: String,
    pub pool_size: u32,
    pub pool_timeout_ms: u64,
}

impl DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: "data/it_store_sales.db".to_string(),
            pool_size: 10,
            pool_timeout_ms: 30_000,
        }
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    fn ensure_valid(&mut self) {
        if self.pool_size == 0 {
            eprintln!("Config error: database pool_size must be at least 1 - using default of 10");
            self.pool_size = 10;
        }
        if self.pool_timeout_ms == 0 {
            self.pool_timeout_ms = Self::default().pool_timeout_ms;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MigrationsConfig {
    pub directory: String,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl MigrationsConfig {
    fn default() -> Self {
        MigrationsConfig {
            directory: "migrations/sql".to_string(),
            max_retries: 15,
            retry_base_ms: 2_000,
            retry_max_ms: 15_000,
        }
    }

    fn ensure_valid(&mut self) {
        let defaults = Self::default();
        if self.max_retries == 0 {
            eprintln!(
                "Config error: migrations max_retries must be at least 1 - using default of {}",
                defaults.max_retries
            );
            self.max_retries = defaults.max_retries;
        }
        if self.retry_max_ms < self.retry_base_ms {
            self.retry_max_ms = self.retry_base_ms;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub node_command: String,
    pub dotnet_command: String,
    pub target_framework: String,
    pub artifact_dir: String,
    pub build_timeout_ms: u64,
    pub run_timeout_ms: u64,
    pub csharp_service_url: Option<String>,
    pub sql_max_retries: u32,
    pub sql_retry_delay_ms: u64,
}

impl ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            node_command: "node".to_string(),
            dotnet_command: "dotnet".to_string(),
            target_framework: "net8.0".to_string(),
            artifact_dir: "code/csharp-optimized".to_string(),
            build_timeout_ms: 30_000,
            run_timeout_ms: 10_000,
            csharp_service_url: None,
            sql_max_retries: 5,
            sql_retry_delay_ms: 2_000,
        }
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    fn ensure_valid(&mut self) {
        let defaults = Self::default();
        if self.build_timeout_ms == 0 {
            self.build_timeout_ms = defaults.build_timeout_ms;
        }
        if self.run_timeout_ms == 0 {
            self.run_timeout_ms = defaults.run_timeout_ms;
        }
        if self.sql_max_retries == 0 {
            self.sql_max_retries = defaults.sql_max_retries;
        }
        // An empty URL in the TOML file means "no remote service"
        if let Some(url) = &self.csharp_service_url {
            if url.trim().is_empty() {
                self.csharp_service_url = None;
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub cleanup_interval_secs: u64,
    pub max_age_secs: u64,
    pub max_size: usize,
}

impl CacheConfig {
    fn default() -> Self {
        CacheConfig {
            cleanup_interval_secs: 60 * 60,
            max_age_secs: 24 * 60 * 60,
            max_size: 100,
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    fn ensure_valid(&mut self) {
        if self.cleanup_interval_secs == 0 {
            eprintln!("Config error: cache cleanup_interval_secs must be positive - using default of 3600");
            self.cleanup_interval_secs = Self::default().cleanup_interval_secs;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
    pub executor: ExecutorConfig,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            migrations: MigrationsConfig::default(),
            executor: ExecutorConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Resolves the config file location: an explicit path wins, otherwise
    /// `config.toml` in the app's local data directory.
    pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        ProjectDirs::from("", "", "playground")
            .map(|dirs| dirs.data_local_dir().join("config.toml"))
    }

    /// Loads the configuration from a TOML file, then applies `PLAYGROUND_*`
    /// environment overrides. If the file is missing or fails to parse,
    /// defaults are used. Writes the default config to disk if no file exists.
    pub fn load_config(config_path: Option<&Path>) -> Self {
        let default_config = Config::default();

        if let Some(config_path) = config_path {
            if !config_path.exists() {
                Self::write_default(config_path, &default_config);
            }
        }

        let mut figment = Figment::from(Serialized::defaults(default_config.clone()));
        if let Some(config_path) = config_path {
            figment = figment.merge(Toml::file(config_path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        // Attempt to extract the configuration; on error, log a message and fall back to defaults.
        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!("Could not load configuration: {}. Using default configuration.", err);
            default_config
        });

        config.ensure_valid();

        config
    }

    /// Returns the process-wide config, loading defaults + environment if
    /// nothing was installed yet.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| Config::load_config(None))
    }

    fn write_default(config_path: &Path, default_config: &Config) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        match toml::to_string_pretty(default_config) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.database.ensure_valid();
        self.migrations.ensure_valid();
        self.executor.ensure_valid();
        self.cache.ensure_valid();
    }
}
