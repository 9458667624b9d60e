use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{IndexError, IndexResult};

/// Top-level configuration for the engine, deserializable from TOML.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Maximum chunk size in characters.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Characters shared between consecutive chunks. Must be < `max_size`.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_max_size() -> usize {
    1200
}
fn default_overlap() -> usize {
    150
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// "http" | "openai" | "local" | "disabled"
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Endpoint for the "http" provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Bounded concurrency for per-document pipeline work.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Minimum similarity a chunk must clear to be returned.
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// Candidates fetched per query: `top_k * over_fetch_factor`.
    #[serde(default = "default_over_fetch_factor")]
    pub over_fetch_factor: usize,
    /// Per-document cap applied during deduplication.
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
            over_fetch_factor: default_over_fetch_factor(),
            max_chunks_per_doc: default_max_chunks_per_doc(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_min_score() -> f32 {
    0.0
}
fn default_over_fetch_factor() -> usize {
    4
}
fn default_max_chunks_per_doc() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Coalescing window for bursts of change events on one source.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Re-scan interval for monitored remote sources.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    2000
}
fn default_poll_interval_secs() -> u64 {
    300
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> IndexResult<IndexConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: IndexConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

impl IndexConfig {
    /// Validate field ranges and cross-field constraints.
    pub fn validate(&self) -> IndexResult<()> {
        if self.chunking.max_size == 0 {
            return Err(IndexError::InvalidConfig(
                "chunking.max_size must be > 0".to_string(),
            ));
        }
        if self.chunking.overlap >= self.chunking.max_size {
            return Err(IndexError::InvalidConfig(format!(
                "chunking.overlap ({}) must be strictly less than chunking.max_size ({})",
                self.chunking.overlap, self.chunking.max_size
            )));
        }
        if self.workers.max_concurrent == 0 {
            return Err(IndexError::InvalidConfig(
                "workers.max_concurrent must be >= 1".to_string(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(IndexError::InvalidConfig(
                "retrieval.top_k must be >= 1".to_string(),
            ));
        }
        if self.retrieval.over_fetch_factor == 0 {
            return Err(IndexError::InvalidConfig(
                "retrieval.over_fetch_factor must be >= 1".to_string(),
            ));
        }
        if self.retrieval.max_chunks_per_doc == 0 {
            return Err(IndexError::InvalidConfig(
                "retrieval.max_chunks_per_doc must be >= 1".to_string(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.retrieval.min_score) {
            return Err(IndexError::InvalidConfig(
                "retrieval.min_score must be in [-1.0, 1.0]".to_string(),
            ));
        }
        if self.embedding.is_enabled() {
            if self.embedding.model.is_none() {
                return Err(IndexError::InvalidConfig(format!(
                    "embedding.model must be set when provider is '{}'",
                    self.embedding.provider
                )));
            }
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                return Err(IndexError::InvalidConfig(format!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                )));
            }
        }
        match self.embedding.provider.as_str() {
            "disabled" | "http" | "openai" | "local" => {}
            other => {
                return Err(IndexError::InvalidConfig(format!(
                    "unknown embedding provider: '{}'. Must be disabled, http, openai, or local",
                    other
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(chunk_max: usize, overlap: usize) -> IndexConfig {
        IndexConfig {
            store: StoreConfig {
                path: PathBuf::from("index.sqlite"),
            },
            chunking: ChunkingConfig {
                max_size: chunk_max,
                overlap,
            },
            embedding: EmbeddingConfig::default(),
            workers: WorkerConfig::default(),
            retrieval: RetrievalConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }

    #[test]
    fn defaults_validate() {
        minimal(1200, 150).validate().unwrap();
    }

    #[test]
    fn overlap_must_be_less_than_max_size() {
        let err = minimal(100, 100).validate().unwrap_err();
        assert!(matches!(err, IndexError::InvalidConfig(_)));

        let err = minimal(100, 150).validate().unwrap_err();
        assert!(matches!(err, IndexError::InvalidConfig(_)));
    }

    #[test]
    fn enabled_embedding_requires_model_and_dims() {
        let mut config = minimal(1200, 150);
        config.embedding.provider = "http".to_string();
        assert!(config.validate().is_err());

        config.embedding.model = Some("nomic-embed-text".to_string());
        assert!(config.validate().is_err());

        config.embedding.dims = Some(768);
        config.validate().unwrap();
    }

    #[test]
    fn parses_full_toml() {
        let toml = r#"
[store]
path = "data/index.sqlite"

[chunking]
max_size = 800
overlap = 100

[embedding]
provider = "http"
model = "nomic-embed-text"
dims = 768
url = "http://localhost:11434"

[workers]
max_concurrent = 2

[retrieval]
top_k = 5
min_score = 0.1
over_fetch_factor = 3
max_chunks_per_doc = 1

[monitor]
debounce_ms = 500
poll_interval_secs = 60
"#;
        let config: IndexConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.chunking.max_size, 800);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.monitor.debounce_ms, 500);
        assert_eq!(config.embedding.dims, Some(768));
    }

    #[test]
    fn minimal_toml_uses_defaults() {
        let config: IndexConfig = toml::from_str("[store]\npath = \"x.sqlite\"\n").unwrap();
        config.validate().unwrap();
        assert_eq!(config.chunking.max_size, 1200);
        assert_eq!(config.workers.max_concurrent, 4);
        assert_eq!(config.retrieval.max_chunks_per_doc, 2);
        assert!(!config.embedding.is_enabled());
    }
}
