use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn, Level};
use logging_timer::timer;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::OwnedMutexGuard;

use super::artifacts::{ArtifactState, ArtifactStore};
use super::process::{run_process, ProcessOutput};
use super::{ExecutionResult, MessageSink};
use crate::error::PlaygroundError;
use crate::hash::Hash;

/// Builds and runs C# projects. `dotnet` in production, fakes in tests.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Builds the project in `project_dir`, writing `<assembly_name>.dll`
    /// and its companions into `output_dir`.
    async fn build(
        &self,
        project_dir: &Path,
        output_dir: &Path,
        assembly_name: &str,
        timeout: Duration,
    ) -> Result<ProcessOutput, PlaygroundError>;

    async fn run(&self, artifact: &Path, timeout: Duration) -> Result<ProcessOutput, PlaygroundError>;
}

pub struct DotnetToolchain {
    command: String,
}

impl DotnetToolchain {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl Toolchain for DotnetToolchain {
    async fn build(
        &self,
        project_dir: &Path,
        output_dir: &Path,
        _assembly_name: &str,
        timeout: Duration,
    ) -> Result<ProcessOutput, PlaygroundError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("publish")
            .arg("-c")
            .arg("Release")
            .arg("-o")
            .arg(output_dir)
            .arg("--nologo")
            .current_dir(project_dir);
        run_process(cmd, None, timeout, "C# build").await
    }

    async fn run(&self, artifact: &Path, timeout: Duration) -> Result<ProcessOutput, PlaygroundError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("exec").arg(artifact);
        if let Some(dir) = artifact.parent() {
            cmd.current_dir(dir);
        }
        run_process(cmd, None, timeout, "C# execution").await
    }
}

/// One async mutex per content key, so a given source is built at most once
/// at a time. Entries nobody holds are pruned on the next acquisition.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks.entry(key.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    pub fn is_locked(&self, key: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .get(key)
            .is_some_and(|m| m.try_lock().is_err())
    }
}

/// Body accepted by the stand-alone C# execution service.
#[derive(Debug, Serialize, Deserialize)]
pub struct RemoteExecuteRequest {
    pub code: String,
}

/// Delegates C# execution to a separate execution service over HTTP.
pub struct RemoteExecutor {
    base_url: String,
    client: reqwest::Client,
}

impl RemoteExecutor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PlaygroundError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub async fn execute(&self, source: &str) -> Result<ExecutionResult, PlaygroundError> {
        let url = format!("{}/execute", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&RemoteExecuteRequest {
                code: source.to_string(),
            })
            .send()
            .await?;
        Ok(response.json::<ExecutionResult>().await?)
    }
}

/// C# execution with a content-addressed cache of compiled assemblies.
pub struct CSharpRunner {
    store: ArtifactStore,
    toolchain: Arc<dyn Toolchain>,
    target_framework: String,
    build_timeout: Duration,
    run_timeout: Duration,
    locks: KeyedLocks,
    remote: Option<RemoteExecutor>,
}

impl CSharpRunner {
    pub fn new(
        store: ArtifactStore,
        toolchain: Arc<dyn Toolchain>,
        target_framework: &str,
        build_timeout: Duration,
        run_timeout: Duration,
    ) -> Self {
        Self {
            store,
            toolchain,
            target_framework: target_framework.to_string(),
            build_timeout,
            run_timeout,
            locks: KeyedLocks::default(),
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: RemoteExecutor) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn state(&self, key: &str) -> ArtifactState {
        match self.store.lookup(key) {
            Some(path) => ArtifactState::Ready(path),
            None if self.locks.is_locked(key) => ArtifactState::Building,
            None => ArtifactState::Absent,
        }
    }

    pub async fn execute(&self, source: &str) -> ExecutionResult {
        let mut sink = MessageSink::new();

        if let Some(remote) = &self.remote {
            match remote.execute(source).await {
                Ok(result) => return result,
                Err(PlaygroundError::HttpError(e)) if e.is_connect() || e.is_timeout() => {
                    warn!("C# execution service unreachable, running locally: {}", e);
                    sink.warn("C# execution service unreachable - running locally");
                }
                Err(e) => {
                    sink.error(format!("C# execution error: {}", e));
                    return ExecutionResult::new(false, sink);
                }
            }
        }

        let success = self.execute_local(source, &mut sink).await;
        ExecutionResult::new(success, sink)
    }

    async fn execute_local(&self, source: &str, sink: &mut MessageSink) -> bool {
        let key = Hash::content_hash(source);

        let (artifact, from_cache) = {
            let _guard = self.locks.lock(&key).await;
            // Re-check under the lock: a concurrent request may have just built it
            match self.state(&key) {
                ArtifactState::Ready(path) => (path, true),
                _ => match self.build(&key, source).await {
                    ArtifactState::Ready(path) => (path, false),
                    ArtifactState::Failed(diagnostic) => {
                        sink.error(format!("C# compilation error: {}", diagnostic));
                        return false;
                    }
                    other => {
                        sink.error(format!("C# compilation error: unexpected build state {:?}", other));
                        return false;
                    }
                },
            }
        };

        debug!(
            "Running C# artifact {} ({})",
            Hash::short_hash(&key),
            if from_cache { "cached" } else { "compiled" }
        );

        match self.toolchain.run(&artifact, self.run_timeout).await {
            Ok(output) if output.success => {
                sink.info(format!(
                    "C# code executed successfully {}",
                    if from_cache { "(cached)" } else { "(compiled)" }
                ));
                for line in output.stdout.lines() {
                    let line = line.trim();
                    if !line.is_empty() {
                        sink.log(line);
                    }
                }
                true
            }
            Ok(output) => {
                sink.error(format!("C# execution error: {}", output.diagnostic()));
                false
            }
            Err(e) => {
                sink.error(format!("C# execution error: {}", e));
                false
            }
        }
    }

    /// Absent -> Building -> Ready | Failed. The caller holds the key's lock.
    async fn build(&self, key: &str, source: &str) -> ArtifactState {
        let _tmr = timer!(Level::Debug; "CSharpRunner::build", "{}", Hash::short_hash(key));
        info!(
            "Compiling C# source {} into {}",
            Hash::short_hash(key),
            self.store.root().display()
        );

        let build_dir = self.store.build_dir(key);
        let staging_dir = self.store.staging_dir(key);
        let assembly_name = ArtifactStore::assembly_name(key);

        let outcome = match self.write_project(&build_dir, &staging_dir, &assembly_name, source).await {
            Ok(()) => {
                self.toolchain
                    .build(&build_dir, &staging_dir, &assembly_name, self.build_timeout)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = remove_dir_if_present(&build_dir).await {
            warn!("Cleanup warning: {}", e);
        }

        let state = match outcome {
            Ok(output) if output.success => match self.store.publish(key, &staging_dir) {
                Ok(path) => ArtifactState::Ready(path),
                Err(e) => ArtifactState::Failed(e.to_string()),
            },
            Ok(output) => ArtifactState::Failed(output.diagnostic()),
            Err(e) => ArtifactState::Failed(e.to_string()),
        };

        if let Err(e) = remove_dir_if_present(&staging_dir).await {
            warn!("Cleanup warning: {}", e);
        }

        state
    }

    async fn write_project(
        &self,
        build_dir: &Path,
        staging_dir: &Path,
        assembly_name: &str,
        source: &str,
    ) -> Result<(), PlaygroundError> {
        // Leftovers from an interrupted build
        remove_dir_if_present(build_dir).await?;
        remove_dir_if_present(staging_dir).await?;

        tokio::fs::create_dir_all(build_dir).await?;
        tokio::fs::create_dir_all(staging_dir).await?;
        tokio::fs::write(
            build_dir.join("Program.csproj"),
            project_file(assembly_name, &self.target_framework),
        )
        .await?;
        tokio::fs::write(build_dir.join("Program.cs"), source).await?;
        Ok(())
    }
}

fn project_file(assembly_name: &str, target_framework: &str) -> String {
    format!(
        r#"<Project Sdk="Microsoft.NET.Sdk">
  <PropertyGroup>
    <OutputType>Exe</OutputType>
    <TargetFramework>{}</TargetFramework>
    <AssemblyName>{}</AssemblyName>
    <PublishTrimmed>false</PublishTrimmed>
  </PropertyGroup>
</Project>
"#,
        target_framework, assembly_name
    )
}

async fn remove_dir_if_present(dir: &Path) -> Result<(), PlaygroundError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
