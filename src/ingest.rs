//! Ingestion orchestration.
//!
//! Coordinates the per-source pipeline: scan → chunk → embed → store.
//! Documents from one scan plan run concurrently under a bounded worker
//! pool; a per-document keyed lock serializes writers of the same document
//! so concurrent re-scans of one source never race on a single upsert.
//!
//! Failure discipline: per-document errors (extraction, embedding) are
//! recorded in the [`ProcessingReport`] and never abort sibling documents.
//! Fatal errors (store unavailable, model mismatch) abort the whole call,
//! leaving already-committed per-document upserts in place.
//!
//! Cancellation is cooperative and checked between documents only;
//! in-flight documents run to completion so the store never sees a
//! half-written generation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, EmbeddingConfig, WorkerConfig};
use crate::embedding::Embedder;
use crate::error::{IndexError, IndexResult};
use crate::extract::ExtractContext;
use crate::models::{
    failure_from_error, DocumentFailure, ExtractedDocument, ProcessingReport, SourceStatus,
};
use crate::registry::SourceRegistry;
use crate::store::VectorStore;

/// Cooperative cancellation: flip once, observed by every in-progress
/// batch between documents.
#[derive(Clone, Debug)]
pub struct CancelFlag {
    rx: watch::Receiver<bool>,
}

impl CancelFlag {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Sender half of the cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Create a linked cancel handle/flag pair.
pub fn cancellation() -> (CancelHandle, CancelFlag) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelFlag { rx })
}

/// A never-cancelled flag for callers without a cancellation requirement.
pub fn never_cancelled() -> CancelFlag {
    let (_tx, rx) = watch::channel(false);
    // A dropped sender freezes the value at `false`.
    CancelFlag { rx }
}

#[derive(Clone)]
pub struct IngestionOrchestrator {
    store: VectorStore,
    registry: SourceRegistry,
    embedder: Arc<dyn Embedder>,
    ctx: ExtractContext,
    chunking: ChunkingConfig,
    embedding: EmbeddingConfig,
    workers: WorkerConfig,
    /// Keyed per-document locks; a single-writer guarantee per document id
    /// without a store-wide lock.
    doc_locks: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

enum DocOutcome {
    Done { updated: bool },
    Failed(DocumentFailure),
    Fatal(IndexError),
}

impl IngestionOrchestrator {
    pub fn new(
        store: VectorStore,
        registry: SourceRegistry,
        embedder: Arc<dyn Embedder>,
        ctx: ExtractContext,
        chunking: ChunkingConfig,
        embedding: EmbeddingConfig,
        workers: WorkerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            embedder,
            ctx,
            chunking,
            embedding,
            workers,
            doc_locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Run the full pipeline for one source.
    ///
    /// State machine: `pending → processing → {indexed | error}`. A source
    /// in `error` stays re-scannable; a later successful pass transitions
    /// it back to `indexed`.
    pub async fn process(
        &self,
        source_id: &str,
        cancel: &CancelFlag,
    ) -> IndexResult<ProcessingReport> {
        self.registry
            .set_status(source_id, SourceStatus::Processing, None)
            .await?;

        // Pin (or verify) the corpus model before any writes.
        if let Err(err) = self
            .store
            .ensure_model(self.embedder.model_id(), self.embedder.dimension())
            .await
        {
            self.registry
                .set_status(source_id, SourceStatus::Error, Some(&err.to_string()))
                .await?;
            return Err(err);
        }

        // scan() transitions to `error` itself when the source is
        // unreachable.
        let plan = self.registry.scan(&self.store, &self.ctx, source_id).await?;

        let mut report = ProcessingReport {
            failed: plan.failed.clone(),
            ..Default::default()
        };

        if plan.is_empty() {
            // Idempotent re-scan: zero store writes.
            self.registry
                .mark_indexed(source_id, &plan.fingerprint, plan_document_count(&self.store, source_id).await?)
                .await?;
            debug!(source = %source_id, "scan plan empty, nothing to do");
            return Ok(report);
        }

        for doc_id in &plan.to_remove {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            self.store.delete_document(doc_id).await?;
            report.removed += 1;
        }

        let semaphore = Arc::new(Semaphore::new(self.workers.max_concurrent.max(1)));
        let mut handles = Vec::new();

        let documents = plan
            .to_add
            .into_iter()
            .map(|d| (d, false))
            .chain(plan.to_update.into_iter().map(|d| (d, true)));

        for (doc, updated) in documents {
            if report.cancelled || cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let worker = self.clone();
            let source_id = source_id.to_string();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                worker.process_document(&source_id, doc, updated).await
            }));
        }

        let mut fatal: Option<IndexError> = None;
        for handle in handles {
            match handle.await {
                Ok(DocOutcome::Done { updated }) => {
                    if updated {
                        report.updated += 1;
                    } else {
                        report.added += 1;
                    }
                }
                Ok(DocOutcome::Failed(failure)) => {
                    warn!(path = %failure.path, error = %failure.error, "document failed");
                    report.failed.push(failure);
                }
                Ok(DocOutcome::Fatal(err)) => fatal = Some(err),
                Err(join_err) => {
                    fatal = Some(IndexError::StoreUnavailable(format!(
                        "worker panicked: {}",
                        join_err
                    )));
                }
            }
        }

        if let Some(err) = fatal {
            self.registry
                .set_status(source_id, SourceStatus::Error, Some(&err.to_string()))
                .await?;
            return Err(err);
        }

        if report.cancelled {
            // Re-scannable; the next pass picks up where this one stopped.
            self.registry
                .set_status(source_id, SourceStatus::Pending, None)
                .await?;
            info!(source = %source_id, added = report.added, updated = report.updated, "processing cancelled");
            return Ok(report);
        }

        let document_count = plan_document_count(&self.store, source_id).await?;
        self.registry
            .mark_indexed(source_id, &plan.fingerprint, document_count)
            .await?;

        info!(
            source = %source_id,
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            failed = report.failed.len(),
            "processing complete"
        );
        Ok(report)
    }

    /// chunk → embed → upsert for one document, under its keyed lock.
    async fn process_document(
        &self,
        source_id: &str,
        doc: ExtractedDocument,
        updated: bool,
    ) -> DocOutcome {
        let lock = self.doc_lock(source_id, &doc.path);
        let _guard = lock.lock().await;

        let chunks = chunk_text(
            &doc.text,
            doc.kind,
            self.chunking.max_size,
            self.chunking.overlap,
        );

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = match self.embed_with_retry(&texts).await {
            Ok(vectors) => vectors,
            Err(err) if err.is_per_document() => {
                return DocOutcome::Failed(failure_from_error(&doc.path, &err));
            }
            Err(err) => return DocOutcome::Fatal(err),
        };

        match self
            .store
            .upsert_document(source_id, &doc, &chunks, &vectors, self.embedder.model_id())
            .await
        {
            Ok(_) => DocOutcome::Done { updated },
            Err(err) if err.is_per_document() => {
                DocOutcome::Failed(failure_from_error(&doc.path, &err))
            }
            Err(err) => DocOutcome::Fatal(err),
        }
    }

    /// Embed in configured batches; a failed batch is retried once at half
    /// size before the document is recorded as failed.
    async fn embed_with_retry(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = self.embedding.batch_size.max(1);
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(batch_size) {
            match self.embedder.embed_batch(batch).await {
                Ok(mut batch_vectors) => vectors.append(&mut batch_vectors),
                Err(IndexError::Embedding(cause)) => {
                    debug!(cause = %cause, "batch embedding failed, retrying at half size");
                    let half = (batch.len() / 2).max(1);
                    for sub in batch.chunks(half) {
                        let mut sub_vectors = self.embedder.embed_batch(sub).await?;
                        vectors.append(&mut sub_vectors);
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Ok(vectors)
    }

    fn doc_lock(&self, source_id: &str, path: &str) -> Arc<Mutex<()>> {
        let key = format!("{}:{}", source_id, path);
        let mut locks = self.doc_locks.lock().expect("lock map poisoned");
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

async fn plan_document_count(store: &VectorStore, source_id: &str) -> IndexResult<i64> {
    Ok(store.stats(Some(source_id)).await?.document_count)
}
