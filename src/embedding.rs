//! Embedding provider abstraction and implementations.
//!
//! The [`Embedder`] trait is the single seam between the pipeline and a
//! loaded model: it exposes the model identifier and output dimension and
//! maps batches of text to vectors, order-preserving and atomic per batch
//! (a failed batch returns no partial vectors).
//!
//! Implementations:
//! - **[`HttpEmbedder`]** — POSTs to an Ollama-compatible `/api/embed`
//!   endpoint with exponential-backoff retry.
//! - **[`OpenAiEmbedder`]** — calls `POST /v1/embeddings`; key from
//!   `OPENAI_API_KEY`.
//! - **`LocalEmbedder`** — runs models in-process via fastembed, behind the
//!   `local-embeddings` feature.
//!
//! Also provides the vector codecs used by the store:
//! [`vec_to_blob`] / [`blob_to_vec`] (little-endian `f32` BLOBs) and
//! [`cosine_similarity`].
//!
//! # Retry strategy
//!
//! HTTP providers retry transient failures with exponential backoff:
//! - HTTP 429 and 5xx → retry
//! - other 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::{IndexError, IndexResult};

/// A loaded embedding model with an explicit identity and dimension.
///
/// Implementations must be safe for concurrent calls (`Send + Sync`);
/// providers that wrap a non-reentrant model serialize calls internally.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier stamped on every chunk at embedding time.
    fn model_id(&self) -> &str;

    /// Output vector dimension.
    fn dimension(&self) -> usize;

    /// Embed a batch of texts, preserving input order.
    ///
    /// Fails atomically: on error no vectors are returned. Inputs that are
    /// empty after whitespace normalization are rejected with
    /// [`IndexError::Embedding`].
    async fn embed_batch(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>>;

    /// Embed a single text (query-time convenience).
    async fn embed(&self, text: &str) -> IndexResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| IndexError::Embedding("empty embedding response".to_string()))
    }
}

/// Reject inputs that are empty once whitespace-normalized.
fn validate_inputs(texts: &[String]) -> IndexResult<()> {
    if texts.is_empty() {
        return Err(IndexError::Embedding("empty batch".to_string()));
    }
    for (i, text) in texts.iter().enumerate() {
        if text.trim().is_empty() {
            return Err(IndexError::Embedding(format!(
                "input {} is empty after normalization",
                i
            )));
        }
    }
    Ok(())
}

/// Check a response batch against the expected count and dimension.
fn validate_vectors(
    vectors: &[Vec<f32>],
    expected_count: usize,
    expected_dims: usize,
) -> IndexResult<()> {
    if vectors.len() != expected_count {
        return Err(IndexError::Embedding(format!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            expected_count
        )));
    }
    for vector in vectors {
        if vector.len() != expected_dims {
            return Err(IndexError::DimensionMismatch {
                expected: expected_dims,
                actual: vector.len(),
            });
        }
    }
    Ok(())
}

// ============ HTTP (Ollama-compatible) provider ============

/// Embedding provider for an Ollama-compatible `/api/embed` endpoint.
#[derive(Debug)]
pub struct HttpEmbedder {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> IndexResult<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| IndexError::InvalidConfig("embedding.model required".to_string()))?;
        let dims = config
            .dims
            .ok_or_else(|| IndexError::InvalidConfig("embedding.dims required".to_string()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string())
            .trim_end_matches('/')
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            url,
            client,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        validate_inputs(texts)?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err: Option<IndexError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/api/embed", self.url))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let vectors = parse_embed_response(&json)?;
                        validate_vectors(&vectors, texts.len(), self.dims)?;
                        return Ok(vectors);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(IndexError::Embedding(format!(
                            "embedding endpoint error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    return Err(IndexError::Embedding(format!(
                        "embedding endpoint error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(IndexError::Embedding(format!(
                        "embedding endpoint unreachable at {}: {}",
                        self.url, e
                    )));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| IndexError::Embedding("embedding failed after retries".to_string())))
    }
}

/// Parse an Ollama-style response: `{"embeddings": [[..], ..]}` or the
/// single-vector `{"embedding": [..]}` form.
fn parse_embed_response(json: &serde_json::Value) -> IndexResult<Vec<Vec<f32>>> {
    if let Some(embeddings) = json.get("embeddings").and_then(|e| e.as_array()) {
        let mut result = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
            result.push(json_vector(embedding)?);
        }
        return Ok(result);
    }

    if let Some(embedding) = json.get("embedding") {
        return Ok(vec![json_vector(embedding)?]);
    }

    Err(IndexError::Embedding(
        "embedding response missing vectors".to_string(),
    ))
}

fn json_vector(value: &serde_json::Value) -> IndexResult<Vec<f32>> {
    let array = value
        .as_array()
        .ok_or_else(|| IndexError::Embedding("embedding is not an array".to_string()))?;
    Ok(array
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ OpenAI-compatible provider ============

/// Embedding provider for the OpenAI embeddings API.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    client: reqwest::Client,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> IndexResult<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| IndexError::InvalidConfig("embedding.model required".to_string()))?;
        let dims = config
            .dims
            .ok_or_else(|| IndexError::InvalidConfig("embedding.dims required".to_string()))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(IndexError::InvalidConfig(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            client,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        validate_inputs(texts)?;

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| IndexError::InvalidConfig("OPENAI_API_KEY not set".to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err: Option<IndexError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let vectors = parse_openai_response(&json)?;
                        validate_vectors(&vectors, texts.len(), self.dims)?;
                        return Ok(vectors);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(IndexError::Embedding(format!(
                            "OpenAI API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    return Err(IndexError::Embedding(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(IndexError::Embedding(format!("network error: {}", e)));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| IndexError::Embedding("embedding failed after retries".to_string())))
    }
}

/// Extract `data[].embedding` arrays in index order.
fn parse_openai_response(json: &serde_json::Value) -> IndexResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| IndexError::Embedding("response missing data array".to_string()))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| IndexError::Embedding("response item missing embedding".to_string()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, json_vector(embedding)?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Local provider (fastembed) ============

/// In-process embedding via fastembed. The model is loaded once at
/// construction and shared behind a mutex (fastembed's `embed` takes
/// `&mut self`, so calls are serialized).
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    model: std::sync::Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
    batch_size: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> IndexResult<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let fastembed_model = resolve_fastembed_model(&model_name)?;
        let dims = config.dims.unwrap_or(default_dims(&model_name));

        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
        )
        .map_err(|e| IndexError::Embedding(format!("failed to load local model: {}", e)))?;

        Ok(Self {
            model_name,
            dims,
            model: std::sync::Arc::new(std::sync::Mutex::new(model)),
            batch_size: config.batch_size,
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn resolve_fastembed_model(name: &str) -> IndexResult<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        other => Err(IndexError::InvalidConfig(format!(
            "unknown local embedding model: '{}'",
            other
        ))),
    }
}

#[cfg(feature = "local-embeddings")]
fn default_dims(name: &str) -> usize {
    match name {
        "all-minilm-l6-v2" | "bge-small-en-v1.5" | "multilingual-e5-small" => 384,
        "bge-base-en-v1.5" | "nomic-embed-text-v1.5" => 768,
        _ => 384,
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_id(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        validate_inputs(texts)?;

        let model = self.model.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();
        let count = texts.len();
        let dims = self.dims;

        let vectors = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| IndexError::Embedding("local model lock poisoned".to_string()))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| IndexError::Embedding(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| IndexError::Embedding(format!("embedding task panicked: {}", e)))??;

        validate_vectors(&vectors, count, dims)?;
        Ok(vectors)
    }
}

/// Create the configured embedding provider.
pub fn create_embedder(config: &EmbeddingConfig) -> IndexResult<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "http" => Ok(Arc::new(HttpEmbedder::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => Err(IndexError::InvalidConfig(
            "local embedding provider requires the 'local-embeddings' feature".to_string(),
        )),
        "disabled" => Err(IndexError::InvalidConfig(
            "embedding provider is disabled".to_string(),
        )),
        other => Err(IndexError::InvalidConfig(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian `f32` bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`] back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`. Returns `0.0` for empty or
/// mismatched-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn cosine_identical_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(validate_inputs(&[]).is_err());
        assert!(validate_inputs(&["   \n".to_string()]).is_err());
        assert!(validate_inputs(&["ok".to_string(), "".to_string()]).is_err());
        assert!(validate_inputs(&["ok".to_string()]).is_ok());
    }

    #[test]
    fn vector_validation_flags_dimension_drift() {
        let vectors = vec![vec![0.0; 4], vec![0.0; 3]];
        let err = validate_vectors(&vectors, 2, 4).unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn parses_batch_and_single_vector_responses() {
        let batch = serde_json::json!({ "embeddings": [[0.1, 0.2], [0.3, 0.4]] });
        let vectors = parse_embed_response(&batch).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1].len(), 2);

        let single = serde_json::json!({ "embedding": [0.5, 0.6] });
        let vectors = parse_embed_response(&single).unwrap();
        assert_eq!(vectors.len(), 1);
    }

    #[test]
    fn factory_rejects_disabled_and_unknown_providers() {
        let mut config = EmbeddingConfig::default();
        assert!(create_embedder(&config).is_err());

        config.provider = "carrier-pigeon".to_string();
        assert!(create_embedder(&config).is_err());
    }

    #[test]
    fn http_provider_requires_model_and_dims() {
        let config = EmbeddingConfig {
            provider: "http".to_string(),
            ..Default::default()
        };
        let err = HttpEmbedder::new(&config).unwrap_err();
        assert!(matches!(err, IndexError::InvalidConfig(_)));
    }

    #[test]
    fn http_provider_exposes_model_identity() {
        let config = EmbeddingConfig {
            provider: "http".to_string(),
            model: Some("nomic-embed-text".to_string()),
            dims: Some(768),
            url: Some("http://localhost:11434/".to_string()),
            ..Default::default()
        };
        let embedder = HttpEmbedder::new(&config).unwrap();
        assert_eq!(embedder.model_id(), "nomic-embed-text");
        assert_eq!(embedder.dimension(), 768);
    }

    #[test]
    fn openai_response_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [1.0] },
                { "index": 0, "embedding": [0.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors[0], vec![0.0]);
        assert_eq!(vectors[1], vec![1.0]);
    }
}
