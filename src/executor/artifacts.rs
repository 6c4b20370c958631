use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::PlaygroundError;
use crate::hash::Hash;

const ARTIFACT_PREFIX: &str = "program-";
const ARTIFACT_EXTENSION: &str = "dll";
const WORK_DIR: &str = ".build";

/// Where a content key stands in the build lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactState {
    Absent,
    Building,
    Ready(PathBuf),
    Failed(String),
}

/// A compiled assembly in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedArtifact {
    pub key: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub removed: usize,
}

/// Flat, content-addressed directory of compiled assemblies.
///
/// An artifact is `program-<key>.dll` plus the files the build emits next to
/// it under the same stem (`.runtimeconfig.json`, `.deps.json`, ...).
/// Artifacts are never modified after publish; they are only removed by
/// `cleanup`. Build scratch space lives under `.build/` inside the store.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn assembly_name(key: &str) -> String {
        format!("{}{}", ARTIFACT_PREFIX, key)
    }

    pub fn artifact_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", Self::assembly_name(key), ARTIFACT_EXTENSION))
    }

    pub fn build_dir(&self, key: &str) -> PathBuf {
        self.root.join(WORK_DIR).join(format!("temp-{}", key))
    }

    pub fn staging_dir(&self, key: &str) -> PathBuf {
        self.root.join(WORK_DIR).join(format!("stage-{}", key))
    }

    pub fn lookup(&self, key: &str) -> Option<PathBuf> {
        let path = self.artifact_path(key);
        path.is_file().then_some(path)
    }

    /// Moves a finished build from `staging` into the store. The assembly is
    /// moved last so a visible `.dll` always has its companions in place.
    pub fn publish(&self, key: &str, staging: &Path) -> Result<PathBuf, PlaygroundError> {
        fs::create_dir_all(&self.root)?;

        let assembly_file = format!("{}.{}", Self::assembly_name(key), ARTIFACT_EXTENSION);
        let staged_assembly = staging.join(&assembly_file);
        if !staged_assembly.is_file() {
            return Err(PlaygroundError::BuildError(format!(
                "build produced no {}",
                assembly_file
            )));
        }

        for entry in fs::read_dir(staging)? {
            let entry = entry?;
            if entry.file_name() == assembly_file.as_str() || !entry.file_type()?.is_file() {
                continue;
            }
            fs::rename(entry.path(), self.root.join(entry.file_name()))?;
        }

        let target = self.artifact_path(key);
        fs::rename(&staged_assembly, &target)?;
        debug!("Published artifact {}", target.display());

        Ok(target)
    }

    /// All published artifacts, newest first.
    pub fn list(&self) -> Result<Vec<CachedArtifact>, PlaygroundError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(key) = Self::key_of(&path) else {
                continue;
            };
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            artifacts.push(CachedArtifact {
                key,
                path,
                modified: metadata.modified()?,
            });
        }

        artifacts.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(artifacts)
    }

    fn key_of(path: &Path) -> Option<String> {
        if path.extension()? != ARTIFACT_EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let key = stem.strip_prefix(ARTIFACT_PREFIX)?;
        Hash::is_content_hash(key).then(|| key.to_string())
    }

    /// Deletes artifacts older than `max_age`, then any beyond the
    /// `max_size` most recent. A missing store is a no-op.
    pub fn cleanup(&self, max_age: Duration, max_size: usize) -> Result<CleanupReport, PlaygroundError> {
        let artifacts = self.list()?;
        let now = SystemTime::now();
        let mut report = CleanupReport {
            scanned: artifacts.len(),
            removed: 0,
        };

        for (index, artifact) in artifacts.iter().enumerate() {
            // Timestamps in the future count as fresh
            let age = now.duration_since(artifact.modified).unwrap_or_default();
            if age > max_age || index >= max_size {
                match self.remove(&artifact.key) {
                    Ok(()) => report.removed += 1,
                    Err(e) => warn!("Cache cleanup warning for {}: {}", artifact.path.display(), e),
                }
            }
        }

        if report.removed > 0 {
            info!("C# cache cleanup: removed {} old assemblies", report.removed);
        }
        Ok(report)
    }

    /// Removes the assembly first, then its companions.
    pub fn remove(&self, key: &str) -> Result<(), PlaygroundError> {
        remove_if_present(&self.artifact_path(key))?;

        let stem = Self::assembly_name(key);
        let with_dot = format!("{}.", stem);
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if (name == stem || name.starts_with(&with_dot)) && entry.file_type()?.is_file() {
                remove_if_present(&entry.path())?;
            }
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<(), PlaygroundError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    pub(crate) fn seed(store: &ArtifactStore, source: &str, age: Duration) -> String {
        let key = Hash::content_hash(source);
        fs::create_dir_all(store.root()).unwrap();
        let dll = store.artifact_path(&key);
        fs::write(&dll, b"MZ").unwrap();
        let config = store
            .root()
            .join(format!("{}.runtimeconfig.json", ArtifactStore::assembly_name(&key)));
        fs::write(&config, b"{}").unwrap();

        let modified = SystemTime::now() - age;
        File::options()
            .write(true)
            .open(&dll)
            .unwrap()
            .set_modified(modified)
            .unwrap();
        key
    }

    #[test]
    fn test_cleanup_keeps_most_recent_within_max_size() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let oldest = seed(&store, "a", Duration::from_secs(300));
        let middle = seed(&store, "b", Duration::from_secs(200));
        let newest = seed(&store, "c", Duration::from_secs(100));

        let report = store.cleanup(Duration::from_secs(86_400), 2).unwrap();
        assert_eq!(report, CleanupReport { scanned: 3, removed: 1 });

        assert!(store.lookup(&oldest).is_none());
        assert!(store.lookup(&middle).is_some());
        assert!(store.lookup(&newest).is_some());

        // Companions of the evicted artifact go with it
        let leftover = dir
            .path()
            .join(format!("{}.runtimeconfig.json", ArtifactStore::assembly_name(&oldest)));
        assert!(!leftover.exists());
    }

    #[test]
    fn test_cleanup_removes_stale_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let stale = seed(&store, "old", Duration::from_secs(2 * 86_400));
        let fresh = seed(&store, "new", Duration::from_secs(10));

        let report = store.cleanup(Duration::from_secs(86_400), 100).unwrap();
        assert_eq!(report.removed, 1);
        assert!(store.lookup(&stale).is_none());
        assert!(store.lookup(&fresh).is_some());
    }

    #[test]
    fn test_cleanup_is_idempotent_and_tolerates_missing_store() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(&dir.path().join("absent"));
        assert_eq!(
            store.cleanup(Duration::from_secs(1), 1).unwrap(),
            CleanupReport::default()
        );

        let store = ArtifactStore::new(dir.path());
        seed(&store, "x", Duration::from_secs(5));
        assert_eq!(store.cleanup(Duration::from_secs(60), 10).unwrap().removed, 0);
        assert_eq!(store.cleanup(Duration::from_secs(60), 10).unwrap().removed, 0);
    }

    #[test]
    fn test_list_ignores_unrelated_files() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let key = seed(&store, "only", Duration::from_secs(1));
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        fs::write(dir.path().join("library.dll"), b"").unwrap();
        fs::create_dir_all(store.build_dir("zzz")).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, key);
    }

    #[test]
    fn test_publish_moves_assembly_and_companions() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(&dir.path().join("store"));
        let key = Hash::content_hash("publish");
        let staging = store.staging_dir(&key);
        fs::create_dir_all(&staging).unwrap();
        let name = ArtifactStore::assembly_name(&key);
        fs::write(staging.join(format!("{}.dll", name)), b"MZ").unwrap();
        fs::write(staging.join(format!("{}.deps.json", name)), b"{}").unwrap();

        let published = store.publish(&key, &staging).unwrap();
        assert_eq!(published, store.artifact_path(&key));
        assert_eq!(store.lookup(&key), Some(published));
        assert!(store.root().join(format!("{}.deps.json", name)).is_file());
    }

    #[test]
    fn test_publish_without_assembly_fails() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let staging = store.staging_dir("k");
        fs::create_dir_all(&staging).unwrap();

        let err = store.publish("k", &staging).unwrap_err();
        assert!(matches!(err, PlaygroundError::BuildError(_)));
        assert!(store.lookup("k").is_none());
    }
}
