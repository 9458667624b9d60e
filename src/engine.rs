//! Engine facade.
//!
//! `KnowledgeEngine` is the in-process boundary the presentation layer
//! talks to: add/remove sources, trigger processing, run retrieval, read
//! status. It wires the registry, orchestrator, retrieval engine, and
//! (optionally) the change monitor over one store, and owns the
//! cooperative cancellation signal for batch work.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::IndexConfig;
use crate::embedding::Embedder;
use crate::error::IndexResult;
use crate::extract::ExtractContext;
use crate::ingest::{cancellation, CancelFlag, CancelHandle, IngestionOrchestrator};
use crate::models::{
    KnowledgeSource, ProcessingReport, RetrievalResult, SourceFilters, SourceKind, SourceStats,
    SourceStatus,
};
use crate::monitor::{spawn_monitor, MonitorHandle};
use crate::registry::SourceRegistry;
use crate::retrieve::RetrievalEngine;
use crate::store::{QueryFilter, VectorStore};

/// A source-add request from the presentation layer.
#[derive(Debug, Clone)]
pub struct AddSourceRequest {
    pub locator: String,
    pub kind: SourceKind,
    pub name: Option<String>,
    pub filters: SourceFilters,
    pub monitoring_enabled: bool,
}

/// Status snapshot emitted back to the presentation layer.
#[derive(Debug, Clone)]
pub struct SourceStatusReport {
    pub source_id: String,
    pub status: SourceStatus,
    pub document_count: i64,
    pub chunk_count: i64,
    pub error_detail: Option<String>,
}

struct MonitorParts {
    handle: MonitorHandle,
    drain: tokio::task::JoinHandle<()>,
}

pub struct KnowledgeEngine {
    store: VectorStore,
    registry: SourceRegistry,
    orchestrator: IngestionOrchestrator,
    retrieval: RetrievalEngine,
    monitor_config: crate::config::MonitorConfig,
    cancel_handle: CancelHandle,
    cancel_flag: CancelFlag,
    monitor: Option<MonitorParts>,
}

impl KnowledgeEngine {
    /// Open the engine against the configured store with an injected
    /// embedder (the seam test code uses to supply a deterministic stub).
    pub async fn open(config: IndexConfig, embedder: Arc<dyn Embedder>) -> IndexResult<Self> {
        let cache_root = config
            .store
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("cache");
        Self::open_with_context(config, embedder, ExtractContext::new(cache_root)).await
    }

    /// Open with a caller-supplied extraction context (pre-authenticated
    /// drive token, custom HTTP client, repository cache location).
    pub async fn open_with_context(
        config: IndexConfig,
        embedder: Arc<dyn Embedder>,
        ctx: ExtractContext,
    ) -> IndexResult<Self> {
        config.validate()?;

        let store = VectorStore::open(&config.store.path).await?;
        let registry = SourceRegistry::new(store.pool().clone());

        let orchestrator = IngestionOrchestrator::new(
            store.clone(),
            registry.clone(),
            embedder.clone(),
            ctx,
            config.chunking.clone(),
            config.embedding.clone(),
            config.workers.clone(),
        );
        let retrieval = RetrievalEngine::new(store.clone(), embedder, config.retrieval.clone());

        let (cancel_handle, cancel_flag) = cancellation();

        Ok(Self {
            store,
            registry,
            orchestrator,
            retrieval,
            monitor_config: config.monitor.clone(),
            cancel_handle,
            cancel_flag,
            monitor: None,
        })
    }

    // ============ Source lifecycle ============

    /// Register a source. With monitoring requested and the monitor
    /// running, the watch is established immediately.
    pub async fn add_source(&self, request: AddSourceRequest) -> IndexResult<KnowledgeSource> {
        let source = self
            .registry
            .register(
                &request.locator,
                request.kind,
                request.name,
                request.filters,
                request.monitoring_enabled,
            )
            .await?;

        if source.monitoring_enabled {
            if let Some(ref monitor) = self.monitor {
                monitor.handle.watch(source.clone());
            }
        }

        Ok(source)
    }

    /// Remove a source: registry record, watch registration, and every
    /// document and chunk it owns.
    pub async fn remove_source(&self, source_id: &str) -> IndexResult<()> {
        self.registry.unregister(source_id).await?;
        self.store.delete_source(source_id).await?;
        if let Some(ref monitor) = self.monitor {
            monitor.handle.unwatch(source_id);
        }
        info!(source = %source_id, "source removed");
        Ok(())
    }

    /// Run the ingestion pipeline for one source.
    pub async fn process(&self, source_id: &str) -> IndexResult<ProcessingReport> {
        self.orchestrator.process(source_id, &self.cancel_flag).await
    }

    /// Re-process every registered source (e.g. after a model change),
    /// reporting per-source outcomes. One source failing does not stop the
    /// rest.
    pub async fn process_all(&self) -> IndexResult<Vec<(String, IndexResult<ProcessingReport>)>> {
        let mut results = Vec::new();
        for source in self.registry.list().await? {
            if self.cancel_flag.is_cancelled() {
                break;
            }
            let outcome = self.process(&source.id).await;
            if let Err(ref err) = outcome {
                warn!(source = %source.id, error = %err, "processing failed");
            }
            results.push((source.id, outcome));
        }
        Ok(results)
    }

    // ============ Query path ============

    /// Retrieve relevance-ranked context chunks for a query.
    pub async fn retrieve(
        &self,
        query_text: &str,
        top_k: Option<usize>,
        filter: &QueryFilter,
    ) -> IndexResult<RetrievalResult> {
        self.retrieval.retrieve(query_text, top_k, filter).await
    }

    // ============ Introspection ============

    pub async fn list_sources(&self) -> IndexResult<Vec<KnowledgeSource>> {
        self.registry.list().await
    }

    pub async fn source_status(&self, source_id: &str) -> IndexResult<SourceStatusReport> {
        let source = self.registry.get(source_id).await?;
        let stats = self.store.stats(Some(source_id)).await?;
        Ok(SourceStatusReport {
            source_id: source.id,
            status: source.status,
            document_count: stats.document_count,
            chunk_count: stats.chunk_count,
            error_detail: source.error_detail,
        })
    }

    /// Counts for one source, or the whole corpus when `None`.
    pub async fn stats(&self, source_id: Option<&str>) -> IndexResult<SourceStats> {
        self.store.stats(source_id).await
    }

    // ============ Monitoring ============

    /// Start the change monitor and its queue drain loop. Idempotent.
    ///
    /// Monitored sources are processed one at a time off the queue; each
    /// source's documents still fan out across the bounded worker pool.
    pub fn start_monitoring(&mut self) {
        if self.monitor.is_some() {
            return;
        }

        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<String>();
        let handle = spawn_monitor(self.registry.clone(), queue_tx, self.monitor_config.clone());

        let orchestrator = self.orchestrator.clone();
        let cancel = self.cancel_flag.clone();
        let drain = tokio::spawn(async move {
            while let Some(source_id) = queue_rx.recv().await {
                if cancel.is_cancelled() {
                    break;
                }
                if let Err(err) = orchestrator.process(&source_id, &cancel).await {
                    warn!(source = %source_id, error = %err, "monitored re-scan failed");
                }
            }
        });

        self.monitor = Some(MonitorParts { handle, drain });
    }

    /// Signal in-progress batches to stop between documents.
    pub fn cancel(&self) {
        self.cancel_handle.cancel();
    }

    /// Cancel outstanding work and stop the monitor.
    pub async fn shutdown(mut self) {
        self.cancel_handle.cancel();
        if let Some(monitor) = self.monitor.take() {
            monitor.handle.shutdown().await;
            monitor.drain.abort();
            let _ = monitor.drain.await;
        }
    }
}
