//! SQLite-backed vector store.
//!
//! Owns the persisted `documents` and `chunks` records (the registry owns
//! `sources`). Vectors are stored inline as little-endian `f32` BLOBs and
//! similarity is brute-force cosine computed in Rust, which keeps the
//! store a plain SQLite file with no loadable extensions.
//!
//! Consistency rules:
//! - `upsert_document` replaces a document's whole chunk generation inside
//!   one transaction. A failure mid-upsert rolls back and leaves the prior
//!   generation fully queryable.
//! - The `(model_id, dims)` pair is pinned in the `meta` table on first
//!   write; a different model id raises [`IndexError::ModelMismatch`], a
//!   different dimension [`IndexError::DimensionMismatch`].

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::chunk::ChunkSpan;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{IndexError, IndexResult};
use crate::models::{ContentKind, ExtractedDocument, SourceStats};

/// A stored document's identity and change-detection key.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: String,
    pub path: String,
    pub content_hash: String,
}

/// One chunk row as surfaced by a similarity query.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub document_id: String,
    pub document_path: String,
    pub source_id: String,
    pub text: String,
    pub created_at: i64,
}

/// Optional metadata constraints on a similarity query.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub source_id: Option<String>,
    pub content_kind: Option<ContentKind>,
}

#[derive(Debug, Clone)]
pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    /// Open (creating if missing) the store at `path` and run migrations.
    pub async fn open(path: &Path) -> IndexResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| IndexError::StoreUnavailable(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| IndexError::StoreUnavailable(e.to_string()))?;

        run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Model pinning ============

    /// The `(model_id, dims)` the corpus was embedded with, if any chunks
    /// have ever been written.
    pub async fn expected_model(&self) -> IndexResult<Option<(String, usize)>> {
        let model: Option<String> =
            sqlx::query_scalar("SELECT value FROM meta WHERE key = 'embedding_model'")
                .fetch_optional(&self.pool)
                .await?;
        let dims: Option<String> =
            sqlx::query_scalar("SELECT value FROM meta WHERE key = 'embedding_dims'")
                .fetch_optional(&self.pool)
                .await?;

        match (model, dims.and_then(|d| d.parse::<usize>().ok())) {
            (Some(model), Some(dims)) => Ok(Some((model, dims))),
            _ => Ok(None),
        }
    }

    /// Pin the corpus model on first write; verify it afterwards.
    pub async fn ensure_model(&self, model_id: &str, dims: usize) -> IndexResult<()> {
        match self.expected_model().await? {
            None => {
                sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES ('embedding_model', ?)")
                    .bind(model_id)
                    .execute(&self.pool)
                    .await?;
                sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES ('embedding_dims', ?)")
                    .bind(dims.to_string())
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
            Some((model, _)) if model != model_id => Err(IndexError::ModelMismatch {
                corpus: model,
                query: model_id.to_string(),
            }),
            Some((_, expected)) if expected != dims => Err(IndexError::DimensionMismatch {
                expected,
                actual: dims,
            }),
            Some(_) => Ok(()),
        }
    }

    // ============ Mutation ============

    /// Replace all chunks for one document, atomically.
    ///
    /// Inserts or updates the document row keyed by `(source_id, path)` and
    /// swaps in the new chunk generation inside one transaction. Returns
    /// the document id. `chunks` and `vectors` must correspond 1:1.
    pub async fn upsert_document(
        &self,
        source_id: &str,
        doc: &ExtractedDocument,
        chunks: &[ChunkSpan],
        vectors: &[Vec<f32>],
        model_id: &str,
    ) -> IndexResult<String> {
        if chunks.len() != vectors.len() {
            return Err(IndexError::Embedding(format!(
                "{} chunks but {} vectors for {}",
                chunks.len(),
                vectors.len(),
                doc.path
            )));
        }

        let expected_dims = match self.expected_model().await? {
            Some((_, dims)) => Some(dims),
            None => None,
        };

        let existing_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE source_id = ? AND path = ?")
                .bind(source_id)
                .bind(&doc.path)
                .fetch_optional(&self.pool)
                .await?;
        let doc_id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, source_id, path, content_hash, text_len, chunk_count, modified_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id, path) DO UPDATE SET
                content_hash = excluded.content_hash,
                text_len = excluded.text_len,
                chunk_count = excluded.chunk_count,
                modified_at = excluded.modified_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc_id)
        .bind(source_id)
        .bind(&doc.path)
        .bind(&doc.content_hash)
        .bind(doc.text.len() as i64)
        .bind(chunks.len() as i64)
        .bind(doc.modified_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&doc_id)
            .execute(&mut *tx)
            .await?;

        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            // A bad vector aborts the transaction; the prior generation
            // stays visible.
            if let Some(expected) = expected_dims {
                if vector.len() != expected {
                    return Err(IndexError::DimensionMismatch {
                        expected,
                        actual: vector.len(),
                    });
                }
            }

            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, source_id, chunk_index, text, start_offset, end_offset, kind, embedding, model_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&doc_id)
            .bind(source_id)
            .bind(chunk.index as i64)
            .bind(&chunk.text)
            .bind(chunk.start as i64)
            .bind(chunk.end as i64)
            .bind(doc.kind.as_str())
            .bind(vec_to_blob(vector))
            .bind(model_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(document = %doc_id, path = %doc.path, chunks = chunks.len(), "document upserted");
        Ok(doc_id)
    }

    /// Remove a document and all its chunks.
    pub async fn delete_document(&self, document_id: &str) -> IndexResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove every document and chunk belonging to a source.
    pub async fn delete_source(&self, source_id: &str) -> IndexResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ============ Lookup ============

    /// The stored documents for a source, keyed for scan-plan diffing.
    pub async fn source_documents(&self, source_id: &str) -> IndexResult<Vec<StoredDocument>> {
        let rows = sqlx::query(
            "SELECT id, path, content_hash FROM documents WHERE source_id = ? ORDER BY path",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| StoredDocument {
                id: row.get("id"),
                path: row.get("path"),
                content_hash: row.get("content_hash"),
            })
            .collect())
    }

    /// All chunk ids for a document, ascending by index.
    pub async fn chunk_ids(&self, document_id: &str) -> IndexResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM chunks WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Document and chunk counts for one source, or the whole corpus.
    pub async fn stats(&self, source_id: Option<&str>) -> IndexResult<SourceStats> {
        let (document_count, chunk_count) = match source_id {
            Some(id) => {
                let docs: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE source_id = ?")
                        .bind(id)
                        .fetch_one(&self.pool)
                        .await?;
                let chunks: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE source_id = ?")
                        .bind(id)
                        .fetch_one(&self.pool)
                        .await?;
                (docs, chunks)
            }
            None => {
                let docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
                    .fetch_one(&self.pool)
                    .await?;
                let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
                    .fetch_one(&self.pool)
                    .await?;
                (docs, chunks)
            }
        };

        Ok(SourceStats {
            document_count,
            chunk_count,
        })
    }

    // ============ Similarity query ============

    /// Rank stored chunks by cosine similarity against `vector`.
    ///
    /// Ordered by descending score; ties break by most-recent creation
    /// timestamp, then ascending chunk id for determinism. The query
    /// vector's dimension must match the pinned corpus dimension.
    pub async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &QueryFilter,
    ) -> IndexResult<Vec<(ChunkHit, f32)>> {
        if let Some((_, dims)) = self.expected_model().await? {
            if vector.len() != dims {
                return Err(IndexError::DimensionMismatch {
                    expected: dims,
                    actual: vector.len(),
                });
            }
        }

        let mut sql = String::from(
            r#"
            SELECT c.id, c.document_id, c.source_id, c.text, c.embedding, c.created_at, d.path
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE 1 = 1
            "#,
        );
        if filter.source_id.is_some() {
            sql.push_str(" AND c.source_id = ?");
        }
        if filter.content_kind.is_some() {
            sql.push_str(" AND c.kind = ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(ref source_id) = filter.source_id {
            query = query.bind(source_id);
        }
        if let Some(kind) = filter.content_kind {
            query = query.bind(kind.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;

        let mut scored: Vec<(ChunkHit, f32)> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = blob_to_vec(&blob);
                let score = cosine_similarity(vector, &stored);
                (
                    ChunkHit {
                        chunk_id: row.get("id"),
                        document_id: row.get("document_id"),
                        document_path: row.get("path"),
                        source_id: row.get("source_id"),
                        text: row.get("text"),
                        created_at: row.get("created_at"),
                    },
                    score,
                )
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.0.created_at.cmp(&a.0.created_at))
                .then(a.0.chunk_id.cmp(&b.0.chunk_id))
        });
        scored.truncate(top_k);

        Ok(scored)
    }
}

/// Idempotent schema setup, run on every open.
async fn run_migrations(pool: &SqlitePool) -> IndexResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            locator TEXT NOT NULL,
            filters_json TEXT NOT NULL DEFAULT '{}',
            monitoring_enabled INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            fingerprint TEXT NOT NULL DEFAULT '',
            document_count INTEGER NOT NULL DEFAULT 0,
            last_processed_at INTEGER,
            error_detail TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            text_len INTEGER NOT NULL,
            chunk_count INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(source_id, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            source_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            kind TEXT NOT NULL,
            embedding BLOB NOT NULL,
            model_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(document_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source_id)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractedDocument;

    async fn open_store() -> (tempfile::TempDir, VectorStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(&dir.path().join("index.sqlite"))
            .await
            .unwrap();
        (dir, store)
    }

    fn doc(path: &str, text: &str) -> ExtractedDocument {
        ExtractedDocument::new(path.to_string(), text.to_string(), ContentKind::Prose, 0)
    }

    fn span(index: usize, text: &str) -> ChunkSpan {
        ChunkSpan {
            index,
            text: text.to_string(),
            start: 0,
            end: text.len(),
        }
    }

    #[tokio::test]
    async fn upsert_then_query_reads_own_writes() {
        let (_dir, store) = open_store().await;
        store.ensure_model("stub", 2).await.unwrap();

        store
            .upsert_document(
                "src1",
                &doc("a.txt", "hello"),
                &[span(0, "hello")],
                &[vec![1.0, 0.0]],
                "stub",
            )
            .await
            .unwrap();

        let hits = store
            .query(&[1.0, 0.0], 10, &QueryFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.text, "hello");
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn reupsert_replaces_chunk_generation() {
        let (_dir, store) = open_store().await;
        store.ensure_model("stub", 2).await.unwrap();

        let doc_id = store
            .upsert_document(
                "src1",
                &doc("a.txt", "one two"),
                &[span(0, "one"), span(1, "two")],
                &[vec![1.0, 0.0], vec![0.0, 1.0]],
                "stub",
            )
            .await
            .unwrap();
        let first_gen = store.chunk_ids(&doc_id).await.unwrap();
        assert_eq!(first_gen.len(), 2);

        let doc_id_again = store
            .upsert_document(
                "src1",
                &doc("a.txt", "three"),
                &[span(0, "three")],
                &[vec![0.5, 0.5]],
                "stub",
            )
            .await
            .unwrap();
        assert_eq!(doc_id, doc_id_again);

        let second_gen = store.chunk_ids(&doc_id).await.unwrap();
        assert_eq!(second_gen.len(), 1);
        assert!(first_gen.iter().all(|id| !second_gen.contains(id)));
    }

    #[tokio::test]
    async fn failed_upsert_preserves_prior_generation() {
        let (_dir, store) = open_store().await;
        store.ensure_model("stub", 2).await.unwrap();

        let doc_id = store
            .upsert_document(
                "src1",
                &doc("a.txt", "stable"),
                &[span(0, "stable")],
                &[vec![1.0, 0.0]],
                "stub",
            )
            .await
            .unwrap();

        // Second chunk's vector has the wrong dimension; the whole upsert
        // must roll back.
        let err = store
            .upsert_document(
                "src1",
                &doc("a.txt", "broken update"),
                &[span(0, "broken"), span(1, "update")],
                &[vec![1.0, 0.0], vec![1.0]],
                "stub",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));

        let chunks = store.chunk_ids(&doc_id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        let hits = store
            .query(&[1.0, 0.0], 10, &QueryFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].0.text, "stable");
    }

    #[tokio::test]
    async fn delete_source_cascades() {
        let (_dir, store) = open_store().await;
        store.ensure_model("stub", 2).await.unwrap();

        for (path, vec) in [("a.txt", vec![1.0, 0.0]), ("b.txt", vec![0.0, 1.0])] {
            store
                .upsert_document("src1", &doc(path, path), &[span(0, path)], &[vec], "stub")
                .await
                .unwrap();
        }
        assert_eq!(store.stats(Some("src1")).await.unwrap().document_count, 2);

        store.delete_source("src1").await.unwrap();
        let stats = store.stats(Some("src1")).await.unwrap();
        assert_eq!(stats.document_count, 0);
        assert_eq!(stats.chunk_count, 0);
        assert!(store
            .query(&[1.0, 0.0], 10, &QueryFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn query_rejects_mismatched_dimension() {
        let (_dir, store) = open_store().await;
        store.ensure_model("stub", 3).await.unwrap();

        let err = store
            .query(&[1.0, 0.0], 10, &QueryFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn model_pinning_rejects_different_model() {
        let (_dir, store) = open_store().await;
        store.ensure_model("model-a", 2).await.unwrap();

        let err = store.ensure_model("model-b", 2).await.unwrap_err();
        assert!(matches!(err, IndexError::ModelMismatch { .. }));

        let err = store.ensure_model("model-a", 3).await.unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));

        store.ensure_model("model-a", 2).await.unwrap();
    }

    #[tokio::test]
    async fn source_filter_scopes_query() {
        let (_dir, store) = open_store().await;
        store.ensure_model("stub", 2).await.unwrap();

        store
            .upsert_document("src1", &doc("a.txt", "a"), &[span(0, "a")], &[vec![1.0, 0.0]], "stub")
            .await
            .unwrap();
        store
            .upsert_document("src2", &doc("b.txt", "b"), &[span(0, "b")], &[vec![1.0, 0.0]], "stub")
            .await
            .unwrap();

        let filter = QueryFilter {
            source_id: Some("src2".to_string()),
            ..Default::default()
        };
        let hits = store.query(&[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.source_id, "src2");
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.sqlite");

        {
            let store = VectorStore::open(&path).await.unwrap();
            store.ensure_model("stub", 2).await.unwrap();
            store
                .upsert_document(
                    "src1",
                    &doc("a.txt", "durable"),
                    &[span(0, "durable")],
                    &[vec![0.6, 0.8]],
                    "stub",
                )
                .await
                .unwrap();
        }

        let store = VectorStore::open(&path).await.unwrap();
        assert_eq!(
            store.expected_model().await.unwrap(),
            Some(("stub".to_string(), 2))
        );
        let hits = store
            .query(&[0.6, 0.8], 10, &QueryFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.text, "durable");
    }
}
