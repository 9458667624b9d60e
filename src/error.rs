//! Error taxonomy for the indexing and retrieval pipeline.
//!
//! Per-document failures ([`IndexError::Extraction`]) are isolated and
//! aggregated into a `ProcessingReport`; they never abort sibling documents.
//! Store and model-configuration failures abort the calling operation and
//! leave previously committed state untouched.

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// A single document could not be extracted. Non-fatal to the batch.
    #[error("extraction failed for {path}: {cause}")]
    Extraction { path: String, cause: String },

    /// An embedding batch failed after retries. Non-fatal to sibling documents.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// The backing storage is unreachable. Fatal to the current operation.
    #[error("vector store unavailable: {0}")]
    StoreUnavailable(String),

    /// A vector's dimension disagrees with the collection's configured dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The query-time model identifier differs from the one the corpus was
    /// embedded with. Requires a full re-index, not a silent empty result.
    #[error("embedding model mismatch: corpus indexed with '{corpus}', query uses '{query}'")]
    ModelMismatch { corpus: String, query: String },

    /// A source with the same normalized identifier is already registered.
    #[error("source already registered: {0}")]
    DuplicateSource(String),

    /// The source could not be reached during a scan. Prior index preserved.
    #[error("source '{source_id}' unreachable: {cause}")]
    ScanUnreachable { source_id: String, cause: String },

    /// No registered source with this identifier.
    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl IndexError {
    /// Whether this error is isolated to one document (the orchestrator
    /// records it and continues) or fatal to the whole operation.
    pub fn is_per_document(&self) -> bool {
        matches!(self, Self::Extraction { .. } | Self::Embedding(_))
    }
}

pub type IndexResult<T> = Result<T, IndexError>;
