mod artifacts;
mod csharp;
mod javascript;
mod process;
mod sql;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::PlaygroundError;
use crate::retry::RetryPolicy;

pub use artifacts::{ArtifactStore, CleanupReport};
pub use csharp::{CSharpRunner, RemoteExecuteRequest};
pub use javascript::JavaScriptRunner;
pub use sql::{SqlOutcome, SqlRunner};

use csharp::{DotnetToolchain, RemoteExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    CSharp,
    Sql,
}

impl FromStr for Language {
    type Err = PlaygroundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "javascript" | "js" => Ok(Language::JavaScript),
            "csharp" | "cs" | "c#" => Ok(Language::CSharp),
            "sql" => Ok(Language::Sql),
            other => Err(PlaygroundError::ValidationError(format!(
                "Unsupported language: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::JavaScript => "javascript",
            Language::CSharp => "csharp",
            Language::Sql => "sql",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Log,
    Error,
    Warn,
    Info,
}

/// One line of console output shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ConsoleMessage {
    pub fn new(message_type: MessageType, message: impl Into<String>) -> Self {
        Self {
            message_type,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Collects the console output of a single execution. Each execution owns
/// its sink, so concurrent executions never see each other's messages.
#[derive(Debug, Default)]
pub struct MessageSink {
    messages: Vec<ConsoleMessage>,
}

impl MessageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message_type: MessageType, message: impl Into<String>) {
        self.messages.push(ConsoleMessage::new(message_type, message));
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.push(MessageType::Log, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(MessageType::Error, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(MessageType::Warn, message);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(MessageType::Info, message);
    }

    pub fn into_messages(self) -> Vec<ConsoleMessage> {
        self.messages
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub messages: Vec<ConsoleMessage>,
}

impl ExecutionResult {
    pub fn new(success: bool, sink: MessageSink) -> Self {
        Self {
            success,
            messages: sink.into_messages(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let mut sink = MessageSink::new();
        sink.error(message);
        Self::new(false, sink)
    }
}

/// Routes source text to the runner for its language.
///
/// Built once at startup and shared with the HTTP layer; it holds no global
/// state of its own.
pub struct ExecutionGateway {
    javascript: JavaScriptRunner,
    csharp: CSharpRunner,
    sql: SqlRunner,
}

impl ExecutionGateway {
    pub fn new(javascript: JavaScriptRunner, csharp: CSharpRunner, sql: SqlRunner) -> Self {
        Self {
            javascript,
            csharp,
            sql,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, PlaygroundError> {
        let exec = &config.executor;

        let javascript = JavaScriptRunner::new(&exec.node_command, exec.run_timeout());
        let csharp = Self::csharp_runner(config, true)?;
        let sql = SqlRunner::new(
            Path::new(&config.database.path),
            config.database.pool_size,
            config.database.pool_timeout(),
            RetryPolicy::gateway(exec.sql_max_retries, exec.sql_retry_delay_ms),
        );

        info!(
            "Execution gateway ready (node: {}, dotnet: {}, artifacts: {})",
            exec.node_command, exec.dotnet_command, exec.artifact_dir
        );

        Ok(Self::new(javascript, csharp, sql))
    }

    /// Builds the C# runner from config. `with_remote` controls whether a
    /// configured execution service is used.
    pub fn csharp_runner(config: &Config, with_remote: bool) -> Result<CSharpRunner, PlaygroundError> {
        let exec = &config.executor;
        let store = ArtifactStore::new(Path::new(&exec.artifact_dir));
        let toolchain = Arc::new(DotnetToolchain::new(&exec.dotnet_command));
        let mut runner = CSharpRunner::new(
            store,
            toolchain,
            &exec.target_framework,
            exec.build_timeout(),
            exec.run_timeout(),
        );

        if with_remote {
            if let Some(url) = exec.csharp_service_url.as_deref() {
                info!("Delegating C# execution to {}", url);
                let timeout = exec.build_timeout() + exec.run_timeout();
                runner = runner.with_remote(RemoteExecutor::new(url, timeout)?);
            }
        }

        Ok(runner)
    }

    pub fn csharp(&self) -> &CSharpRunner {
        &self.csharp
    }

    pub fn sql(&self) -> &SqlRunner {
        &self.sql
    }

    pub async fn execute(&self, language: Language, source: &str) -> ExecutionResult {
        match language {
            Language::JavaScript => self.javascript.execute(source).await,
            Language::CSharp => self.csharp.execute(source).await,
            Language::Sql => match self.sql.execute(source).await {
                Ok(outcome) => ExecutionResult {
                    success: true,
                    messages: outcome.to_messages(),
                },
                Err(e) => ExecutionResult::failure(format!("SQL execution error: {}", e)),
            },
        }
    }

    pub async fn execute_sql(&self, query: &str) -> Result<SqlOutcome, PlaygroundError> {
        self.sql.execute(query).await
    }
}
