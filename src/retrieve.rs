//! Relevance-ranked retrieval.
//!
//! Embeds the query with the corpus model (a different model id is a hard
//! [`IndexError::ModelMismatch`], never a silently meaningless ranking),
//! overfetches candidates from the store, deduplicates by owning document
//! with a per-document cap, applies the similarity floor, and truncates to
//! `top_k`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::{IndexError, IndexResult};
use crate::models::{RetrievalResult, ScoredChunk};
use crate::store::{QueryFilter, VectorStore};

#[derive(Clone)]
pub struct RetrievalEngine {
    store: VectorStore,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(store: VectorStore, embedder: Arc<dyn Embedder>, config: RetrievalConfig) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// Retrieve the chunks most relevant to `query_text`.
    ///
    /// An empty corpus, a blank query, or no chunk clearing the similarity
    /// floor all return an empty result, not an error.
    pub async fn retrieve(
        &self,
        query_text: &str,
        top_k: Option<usize>,
        filter: &QueryFilter,
    ) -> IndexResult<RetrievalResult> {
        if query_text.trim().is_empty() {
            return Ok(RetrievalResult::default());
        }

        // Reject a model switch before paying for the query embedding.
        if let Some((corpus_model, corpus_dims)) = self.store.expected_model().await? {
            if corpus_model != self.embedder.model_id() {
                return Err(IndexError::ModelMismatch {
                    corpus: corpus_model,
                    query: self.embedder.model_id().to_string(),
                });
            }
            if corpus_dims != self.embedder.dimension() {
                return Err(IndexError::DimensionMismatch {
                    expected: corpus_dims,
                    actual: self.embedder.dimension(),
                });
            }
        } else {
            // Nothing has ever been indexed.
            return Ok(RetrievalResult::default());
        }

        let top_k = top_k.unwrap_or(self.config.top_k);
        let candidate_k = top_k.saturating_mul(self.config.over_fetch_factor.max(1));

        let query_vector = self.embedder.embed(query_text).await?;
        let candidates = self.store.query(&query_vector, candidate_k, filter).await?;

        // Candidates arrive ranked; keep the best `max_chunks_per_doc` per
        // document so one document cannot crowd out the rest.
        let mut per_doc: HashMap<String, usize> = HashMap::new();
        let mut results: Vec<ScoredChunk> = Vec::new();

        for (hit, score) in candidates {
            if score < self.config.min_score {
                continue;
            }
            let taken = per_doc.entry(hit.document_id.clone()).or_insert(0);
            if *taken >= self.config.max_chunks_per_doc {
                continue;
            }
            *taken += 1;

            results.push(ScoredChunk {
                chunk_id: hit.chunk_id,
                document_id: hit.document_id,
                document_path: hit.document_path,
                source_id: hit.source_id,
                text: hit.text,
                score,
            });
            if results.len() >= top_k {
                break;
            }
        }

        debug!(query = %query_text, results = results.len(), "retrieval complete");
        Ok(RetrievalResult { results })
    }
}
