//! Cross-session memory: the artifacts of the last completed full run.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_MEMORY_PATH: &str = "crossprompt_memory.json";

/// Recognized memory keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKey {
    Task,
    WebContext,
    Summary,
    Plan,
    Evaluation,
}

impl ArtifactKey {
    pub const ALL: [ArtifactKey; 5] = [
        ArtifactKey::Task,
        ArtifactKey::WebContext,
        ArtifactKey::Summary,
        ArtifactKey::Plan,
        ArtifactKey::Evaluation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKey::Task => "task",
            ArtifactKey::WebContext => "web_context",
            ArtifactKey::Summary => "summary",
            ArtifactKey::Plan => "plan",
            ArtifactKey::Evaluation => "evaluation",
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent mapping of artifact name to text.
///
/// Keys outside [`ArtifactKey`] found in the durable file are kept as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Memory(BTreeMap<String, String>);

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookup with `""` as the default.
    pub fn get(&self, key: ArtifactKey) -> &str {
        self.get_or(key, "")
    }

    pub fn get_or<'a>(&'a self, key: ArtifactKey, default: &'a str) -> &'a str {
        self.0.get(key.as_str()).map(String::as_str).unwrap_or(default)
    }

    pub fn set(&mut self, key: ArtifactKey, value: impl Into<String>) {
        self.0.insert(key.as_str().to_string(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// All entries in key order, including unrecognized ones.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// This memory with every recognized key overwritten by `artifacts`.
    pub fn with_full_run(&self, artifacts: &FullRunArtifacts) -> Memory {
        let mut next = self.clone();
        next.set(ArtifactKey::Task, artifacts.task.as_str());
        next.set(ArtifactKey::WebContext, artifacts.web_context.as_str());
        next.set(ArtifactKey::Summary, artifacts.summary.as_str());
        next.set(ArtifactKey::Plan, artifacts.plan.as_str());
        next.set(ArtifactKey::Evaluation, artifacts.evaluation.as_str());
        next
    }

    /// Compact JSON rendering injected into stage prompts.
    pub fn to_prompt_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }
}

/// `value` cut to `max_chars` characters, with `...` appended when cut.
pub fn preview(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &value[..idx]),
        None => value.to_string(),
    }
}

/// The five values a full run commits together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullRunArtifacts {
    pub task: String,
    pub web_context: String,
    pub summary: String,
    pub plan: String,
    pub evaluation: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Backing file exists but can't be read or parsed.
    #[error("storage unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },
    /// Durable write failed; the previous file is untouched.
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode {path}: {reason}")]
    Encode { path: PathBuf, reason: String },
}

/// Durable home of [`Memory`].
pub trait MemoryStore: Send + Sync {
    /// Empty memory when nothing has been committed yet.
    fn load(&self) -> Result<Memory, StorageError>;

    /// Replace the durable state with `memory`, all or nothing.
    fn commit(&self, memory: &Memory) -> Result<(), StorageError>;
}

/// Memory kept in a pretty-printed JSON object on disk.
#[derive(Debug, Clone)]
pub struct JsonFileMemoryStore {
    path: PathBuf,
}

impl JsonFileMemoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load, falling back to an empty memory when the file is corrupt.
    ///
    /// The returned error, if any, is the reason for the fallback.
    pub fn load_or_empty(&self) -> (Memory, Option<StorageError>) {
        match self.load() {
            Ok(memory) => (memory, None),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "memory unreadable, starting empty");
                (Memory::new(), Some(err))
            }
        }
    }
}

impl MemoryStore for JsonFileMemoryStore {
    fn load(&self) -> Result<Memory, StorageError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Memory::new()),
            Err(e) => {
                return Err(StorageError::Unavailable {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        };

        serde_json::from_str::<Memory>(&raw).map_err(|e| StorageError::Unavailable {
            path: self.path.clone(),
            reason: format!("malformed memory file: {e}"),
        })
    }

    fn commit(&self, memory: &Memory) -> Result<(), StorageError> {
        let bytes = to_json_indent4(memory).map_err(|e| StorageError::Encode {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&self.path, &bytes)?;
        tracing::info!(path = %self.path.display(), keys = memory.len(), "memory committed");
        Ok(())
    }
}

fn to_json_indent4<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Write `bytes` to a sibling `.tmp` file, then rename it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let write_err = |source: io::Error| StorageError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let tmp_path = tmp_sibling(path);
    if let Err(e) = fs::write(&tmp_path, bytes) {
        let _ = fs::remove_file(&tmp_path);
        return Err(write_err(e));
    }
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(write_err(e));
    }
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
