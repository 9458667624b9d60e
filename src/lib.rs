//! # Knowledge Loom
//!
//! An embedded semantic indexing and retrieval engine for LLM-assisted
//! applications.
//!
//! Knowledge Loom ingests heterogeneous knowledge sources (local files and
//! folders, git repositories, drive folders, web pages) into a persistent
//! SQLite-backed vector index and serves relevance-ranked context chunks
//! back to the host application's chat flow.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌───────────┐
//! │  Resolvers   │──▶│   Pipeline    │──▶│  SQLite    │
//! │ fs/git/drive │   │ chunk + embed │   │ vectors    │
//! │    /web      │   └───────┬───────┘   └─────┬─────┘
//! └──────▲───────┘           │                 │
//!        │             ┌─────┴─────┐     ┌─────┴─────┐
//! ┌──────┴───────┐     │ Registry  │     │ Retrieval │
//! │   Monitor    │────▶│  + scan   │     │  engine   │
//! │ watch / poll │     └───────────┘     └───────────┘
//! └──────────────┘
//! ```
//!
//! The host application talks to [`KnowledgeEngine`]: add a source, let
//! the orchestrator extract → chunk → embed → store its documents, then
//! call [`KnowledgeEngine::retrieve`] at chat time. Re-scans are
//! incremental: unchanged documents are detected by content hash and
//! skipped, changed ones get a fresh chunk generation atomically.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration surface |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`extract`] | Source resolution and text extraction |
//! | [`chunk`] | Content-type-aware chunking |
//! | [`embedding`] | Embedding providers and vector utilities |
//! | [`store`] | SQLite vector store |
//! | [`registry`] | Source registry and change detection |
//! | [`ingest`] | Ingestion orchestration |
//! | [`retrieve`] | Ranked, deduplicated retrieval |
//! | [`monitor`] | File-system watching and remote polling |
//! | [`engine`] | `KnowledgeEngine` facade |

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod models;
pub mod monitor;
pub mod registry;
pub mod retrieve;
pub mod store;

mod source_drive;
mod source_fs;
mod source_git;
mod source_web;

pub use config::{load_config, IndexConfig};
pub use engine::{AddSourceRequest, KnowledgeEngine, SourceStatusReport};
pub use error::{IndexError, IndexResult};
pub use models::{
    ContentKind, KnowledgeSource, ProcessingReport, RetrievalResult, ScoredChunk, SourceFilters,
    SourceKind, SourceStats, SourceStatus,
};
pub use store::QueryFilter;
