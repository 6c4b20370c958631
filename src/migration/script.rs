use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::error::PlaygroundError;

const SCRIPT_EXTENSION: &str = "sql";
const BATCH_SEPARATOR: &str = "GO";

/// A migration file split into batches. Version is the file stem, so
/// `001-init.sql` has version `001-init`.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationScript {
    pub version: String,
    pub file_name: String,
    pub batches: Vec<String>,
}

impl MigrationScript {
    pub fn parse(file_name: &str, text: &str) -> Self {
        MigrationScript {
            version: version_from_file_name(file_name),
            file_name: file_name.to_string(),
            batches: split_batches(text),
        }
    }

    pub fn load(path: &Path) -> Result<Self, PlaygroundError> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                PlaygroundError::Error(format!("Not a migration file: {}", path.display()))
            })?;
        let text = fs::read_to_string(path)?;
        Ok(Self::parse(&file_name, &text))
    }

    pub fn description(&self) -> String {
        format!("Migration from {}", self.file_name)
    }
}

pub fn version_from_file_name(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string())
}

/// Splits script text on separator lines (`GO` alone on a line, any case,
/// surrounding whitespace ignored). Batches are trimmed and empty ones dropped.
pub fn split_batches(text: &str) -> Vec<String> {
    let mut batches = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if line.trim().eq_ignore_ascii_case(BATCH_SEPARATOR) {
            push_batch(&mut batches, &mut current);
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    push_batch(&mut batches, &mut current);

    batches
}

fn push_batch(batches: &mut Vec<String>, current: &mut String) {
    let batch = current.trim();
    if !batch.is_empty() {
        batches.push(batch.to_string());
    }
    current.clear();
}

/// The directory holding migration scripts.
pub struct ScriptDirectory {
    dir: PathBuf,
}

impl ScriptDirectory {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Lists `*.sql` files in lexicographic order. A missing directory is
    /// created and yields an empty listing.
    pub fn list(&self) -> Result<ScriptListing, PlaygroundError> {
        if !self.dir.exists() {
            info!("No migration directory at {}, creating it", self.dir.display());
            fs::create_dir_all(&self.dir)?;
            return Ok(ScriptListing::default());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_script = path
                .extension()
                .is_some_and(|ext| ext == SCRIPT_EXTENSION);
            if is_script && entry.file_type()?.is_file() {
                files.push(path);
            }
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        info!("Found {} migration files in {}", files.len(), self.dir.display());
        Ok(ScriptListing { files })
    }
}

/// Sorted script paths. Iterating is restartable and each script's contents
/// are only read when that item is reached.
#[derive(Debug, Default, Clone)]
pub struct ScriptListing {
    files: Vec<PathBuf>,
}

impl ScriptListing {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Versions in apply order, without touching file contents.
    pub fn versions(&self) -> Vec<String> {
        self.files
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| version_from_file_name(&name.to_string_lossy()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = ScriptEntry<'_>> + '_ {
        self.files.iter().map(|path| ScriptEntry { path })
    }
}

/// One not-yet-loaded script in a listing.
pub struct ScriptEntry<'a> {
    path: &'a Path,
}

impl ScriptEntry<'_> {
    pub fn version(&self) -> String {
        self.path
            .file_name()
            .map(|name| version_from_file_name(&name.to_string_lossy()))
            .unwrap_or_default()
    }

    pub fn path(&self) -> &Path {
        self.path
    }

    pub fn load(&self) -> Result<MigrationScript, PlaygroundError> {
        MigrationScript::load(self.path)
    }
}
