//! Application configuration: JSON file first, then `CROSSPROMPT_*` overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::BackendConfig;
use crate::export::DEFAULT_EXPORT_PATH;
use crate::gateway::chat_api::DEFAULT_BASE_URL;
use crate::memory::DEFAULT_MEMORY_PATH;
use crate::pipeline::{PipelineConfig, RetrievalPolicy};
use crate::retriever::fetch::DEFAULT_MAX_DOCUMENT_CHARS;
use crate::retriever::index::DEFAULT_INDEX_PATH;

pub const ENV_BASE_URL: &str = "CROSSPROMPT_BASE_URL";
pub const ENV_API_KEY: &str = "CROSSPROMPT_API_KEY";
pub const ENV_TIMEOUT_SECONDS: &str = "CROSSPROMPT_TIMEOUT_SECONDS";
pub const ENV_MEMORY_PATH: &str = "CROSSPROMPT_MEMORY_PATH";
pub const ENV_INDEX_PATH: &str = "CROSSPROMPT_INDEX_PATH";
pub const ENV_SEARCH_URL: &str = "CROSSPROMPT_SEARCH_URL";
pub const ENV_EXPORT_PATH: &str = "CROSSPROMPT_EXPORT_PATH";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {var}: {reason}")]
    InvalidEnv { var: &'static str, reason: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// OpenAI-compatible endpoint shared by the three stage backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// HTTP timeout per call, in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Retries of transient failures per call.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    2
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
        }
    }
}

/// Model and temperature per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageModels {
    #[serde(default = "default_summary_backend")]
    pub summary: BackendConfig,
    #[serde(default = "default_plan_backend")]
    pub plan: BackendConfig,
    #[serde(default = "default_evaluation_backend")]
    pub evaluation: BackendConfig,
}

fn default_summary_backend() -> BackendConfig {
    BackendConfig::new("mistral", 0.4)
}

fn default_plan_backend() -> BackendConfig {
    BackendConfig::new("llama3", 0.5)
}

fn default_evaluation_backend() -> BackendConfig {
    BackendConfig::new("phi3", 0.3)
}

impl Default for StageModels {
    fn default() -> Self {
        Self {
            summary: default_summary_backend(),
            plan: default_plan_backend(),
            evaluation: default_evaluation_backend(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// SearxNG base URL. Without one, every request runs with empty web context.
    #[serde(default)]
    pub search_url: Option<String>,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub policy: RetrievalPolicy,
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,
    /// Embedding model served at `{base_url}/embeddings`. Offline hashing when unset.
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default = "default_reuse_threshold")]
    pub reuse_threshold: f32,
    /// Deadline for one whole retrieval, in seconds. Waits indefinitely when unset.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Per-request HTTP timeout for search and page fetches, in seconds.
    #[serde(default = "default_fetch_timeout_seconds")]
    pub fetch_timeout_seconds: u64,
    #[serde(default = "default_max_document_chars")]
    pub max_document_chars: usize,
}

fn default_k() -> usize {
    3
}

fn default_index_path() -> PathBuf {
    PathBuf::from(DEFAULT_INDEX_PATH)
}

fn default_reuse_threshold() -> f32 {
    0.92
}

fn default_fetch_timeout_seconds() -> u64 {
    20
}

fn default_max_document_chars() -> usize {
    DEFAULT_MAX_DOCUMENT_CHARS
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            search_url: None,
            k: default_k(),
            policy: RetrievalPolicy::default(),
            index_path: default_index_path(),
            embedding_model: None,
            reuse_threshold: default_reuse_threshold(),
            timeout_seconds: None,
            fetch_timeout_seconds: default_fetch_timeout_seconds(),
            max_document_chars: default_max_document_chars(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub stages: StageModels,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default = "default_memory_path")]
    pub memory_path: PathBuf,
    #[serde(default = "default_export_path")]
    pub export_path: PathBuf,
    /// Use Portuguese section headings in exports.
    #[serde(default)]
    pub portuguese_headings: bool,
}

fn default_memory_path() -> PathBuf {
    PathBuf::from(DEFAULT_MEMORY_PATH)
}

fn default_export_path() -> PathBuf {
    PathBuf::from(DEFAULT_EXPORT_PATH)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            stages: StageModels::default(),
            retrieval: RetrievalConfig::default(),
            memory_path: default_memory_path(),
            export_path: default_export_path(),
            portuguese_headings: false,
        }
    }
}

impl AppConfig {
    /// Defaults, overlaid with `path` if given, overlaid with the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `CROSSPROMPT_*` overrides. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_BASE_URL) {
            self.endpoint.base_url = url;
        }
        if let Some(key) = get(ENV_API_KEY) {
            self.endpoint.api_key = Some(key);
        }
        if let Some(raw) = get(ENV_TIMEOUT_SECONDS) {
            self.endpoint.timeout_seconds =
                raw.trim()
                    .parse()
                    .map_err(|e: std::num::ParseIntError| ConfigError::InvalidEnv {
                        var: ENV_TIMEOUT_SECONDS,
                        reason: format!("{raw:?}: {e}"),
                    })?;
        }
        if let Some(path) = get(ENV_MEMORY_PATH) {
            self.memory_path = PathBuf::from(path);
        }
        if let Some(path) = get(ENV_INDEX_PATH) {
            self.retrieval.index_path = PathBuf::from(path);
        }
        if let Some(url) = get(ENV_SEARCH_URL) {
            self.retrieval.search_url = Some(url);
        }
        if let Some(path) = get(ENV_EXPORT_PATH) {
            self.export_path = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint.base_url is empty".into()));
        }
        if self.endpoint.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "endpoint.timeout_seconds must be >= 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.reuse_threshold) {
            return Err(ConfigError::Invalid(format!(
                "retrieval.reuse_threshold must be within [0, 1], got {}",
                self.retrieval.reuse_threshold
            )));
        }
        for (stage, backend) in [
            ("summary", &self.stages.summary),
            ("plan", &self.stages.plan),
            ("evaluation", &self.stages.evaluation),
        ] {
            if backend.model.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("stages.{stage}.model is empty")));
            }
            if !(0.0..=2.0).contains(&backend.temperature) {
                return Err(ConfigError::Invalid(format!(
                    "stages.{stage}.temperature must be within [0, 2], got {}",
                    backend.temperature
                )));
            }
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            retrieval_k: self.retrieval.k,
            retrieval_policy: self.retrieval.policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_local_deployment() {
        let config = AppConfig::default();
        assert_eq!(config.endpoint.base_url, "http://localhost:11434/v1");
        assert_eq!(config.stages.summary, BackendConfig::new("mistral", 0.4));
        assert_eq!(config.stages.plan, BackendConfig::new("llama3", 0.5));
        assert_eq!(config.stages.evaluation, BackendConfig::new("phi3", 0.3));
        assert_eq!(config.retrieval.k, 3);
        assert_eq!(config.memory_path, PathBuf::from("crossprompt_memory.json"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"stages": {"plan": {"model": "qwen2", "temperature": 0.7}}}"#)
                .unwrap();
        assert_eq!(config.stages.plan.model, "qwen2");
        assert_eq!(config.stages.summary.model, "mistral");
        assert_eq!(config.retrieval.reuse_threshold, 0.92);
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_BASE_URL, "http://gpu-box:8000/v1"),
            (ENV_TIMEOUT_SECONDS, "45"),
            (ENV_SEARCH_URL, "http://searx.local"),
            (ENV_MEMORY_PATH, ""),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_env(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.endpoint.base_url, "http://gpu-box:8000/v1");
        assert_eq!(config.endpoint.timeout_seconds, 45);
        assert_eq!(config.retrieval.search_url.as_deref(), Some("http://searx.local"));
        assert_eq!(config.memory_path, PathBuf::from("crossprompt_memory.json"));
    }

    #[test]
    fn bad_timeout_env_is_rejected() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env(|var| (var == ENV_TIMEOUT_SECONDS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: ENV_TIMEOUT_SECONDS, .. }));
    }

    #[test]
    fn out_of_range_temperature_is_rejected() {
        let mut config = AppConfig::default();
        config.stages.evaluation.temperature = 3.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
