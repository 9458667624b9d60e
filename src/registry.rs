//! Source registry and change detection.
//!
//! Exclusively owns the persisted `sources` records: registration with
//! normalized-identifier uniqueness, status transitions, fingerprints, and
//! the scan that diffs a source's current documents against what the store
//! last saw.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::error::{IndexError, IndexResult};
use crate::extract::{extract_source, ExtractContext};
use crate::models::{
    source_fingerprint, source_identifier, KnowledgeSource, ScanPlan, SourceFilters, SourceKind,
    SourceStatus,
};
use crate::store::VectorStore;

#[derive(Debug, Clone)]
pub struct SourceRegistry {
    pool: SqlitePool,
}

impl SourceRegistry {
    /// The registry shares the store's SQLite database but owns only the
    /// `sources` table.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a new source. The identifier is derived from the
    /// normalized locator, so re-adding the same origin (under any
    /// equivalent spelling) fails with [`IndexError::DuplicateSource`].
    pub async fn register(
        &self,
        locator: &str,
        kind: SourceKind,
        name: Option<String>,
        filters: SourceFilters,
        monitoring_enabled: bool,
    ) -> IndexResult<KnowledgeSource> {
        let id = source_identifier(locator, kind);

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM sources WHERE id = ?")
            .bind(&id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_some() {
            return Err(IndexError::DuplicateSource(locator.to_string()));
        }

        let source = KnowledgeSource {
            id: id.clone(),
            kind,
            name: name.unwrap_or_else(|| display_name(locator, kind)),
            locator: locator.to_string(),
            filters,
            monitoring_enabled,
            status: SourceStatus::Pending,
            fingerprint: String::new(),
            document_count: 0,
            last_processed_at: None,
            error_detail: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO sources (id, kind, name, locator, filters_json, monitoring_enabled, status, fingerprint, document_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source.id)
        .bind(source.kind.as_str())
        .bind(&source.name)
        .bind(&source.locator)
        .bind(serde_json::to_string(&source.filters).unwrap_or_else(|_| "{}".to_string()))
        .bind(source.monitoring_enabled as i64)
        .bind(source.status.as_str())
        .bind(&source.fingerprint)
        .bind(source.document_count)
        .bind(source.created_at.timestamp())
        .execute(&self.pool)
        .await?;

        info!(source = %source.id, kind = %kind, locator = %locator, "source registered");
        Ok(source)
    }

    /// Remove a source's registry record. Cascading deletion of its
    /// documents and chunks is the engine's job (each store owns its own
    /// records).
    pub async fn unregister(&self, source_id: &str) -> IndexResult<()> {
        let result = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(IndexError::UnknownSource(source_id.to_string()));
        }
        info!(source = %source_id, "source unregistered");
        Ok(())
    }

    pub async fn get(&self, source_id: &str) -> IndexResult<KnowledgeSource> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| IndexError::UnknownSource(source_id.to_string()))?;
        row_to_source(&row)
    }

    pub async fn list(&self) -> IndexResult<Vec<KnowledgeSource>> {
        let rows = sqlx::query("SELECT * FROM sources ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_source).collect()
    }

    /// Sources with monitoring enabled, for watch/poll registration.
    pub async fn monitored(&self) -> IndexResult<Vec<KnowledgeSource>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.monitoring_enabled)
            .collect())
    }

    pub async fn set_status(
        &self,
        source_id: &str,
        status: SourceStatus,
        error_detail: Option<&str>,
    ) -> IndexResult<()> {
        sqlx::query("UPDATE sources SET status = ?, error_detail = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error_detail)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transition to `indexed` with a fresh fingerprint and counts.
    pub async fn mark_indexed(
        &self,
        source_id: &str,
        fingerprint: &str,
        document_count: i64,
    ) -> IndexResult<()> {
        sqlx::query(
            r#"
            UPDATE sources
            SET status = 'indexed', fingerprint = ?, document_count = ?,
                last_processed_at = ?, error_detail = NULL
            WHERE id = ?
            "#,
        )
        .bind(fingerprint)
        .bind(document_count)
        .bind(Utc::now().timestamp())
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Disable monitoring after a failed watch registration; the source is
    /// degraded, not removed.
    pub async fn disable_monitoring(&self, source_id: &str, cause: &str) -> IndexResult<()> {
        warn!(source = %source_id, cause = %cause, "monitoring disabled");
        sqlx::query(
            "UPDATE sources SET monitoring_enabled = 0, status = 'error', error_detail = ? WHERE id = ?",
        )
        .bind(cause)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Extract the source's current documents and diff them against the
    /// store: new paths are `to_add`, changed hashes `to_update`, vanished
    /// paths `to_remove`.
    ///
    /// An unreachable source transitions to `error` and keeps its prior
    /// documents (stale-but-present beats silently empty).
    pub async fn scan(
        &self,
        store: &VectorStore,
        ctx: &ExtractContext,
        source_id: &str,
    ) -> IndexResult<ScanPlan> {
        let source = self.get(source_id).await?;

        let outcome = match extract_source(&source, ctx).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.set_status(source_id, SourceStatus::Error, Some(&err.to_string()))
                    .await?;
                return Err(err);
            }
        };

        let existing = store.source_documents(source_id).await?;
        let mut remaining: std::collections::HashMap<&str, &crate::store::StoredDocument> =
            existing.iter().map(|d| (d.path.as_str(), d)).collect();

        let mut plan = ScanPlan {
            failed: outcome.failures,
            ..Default::default()
        };

        let hash_pairs: Vec<(String, String)> = outcome
            .documents
            .iter()
            .map(|d| (d.path.clone(), d.content_hash.clone()))
            .collect();
        plan.fingerprint = source_fingerprint(&hash_pairs);

        for doc in outcome.documents {
            match remaining.remove(doc.path.as_str()) {
                None => plan.to_add.push(doc),
                Some(stored) if stored.content_hash != doc.content_hash => {
                    plan.to_update.push(doc);
                }
                Some(_) => {}
            }
        }
        plan.to_remove = remaining.values().map(|d| d.id.clone()).collect();
        plan.to_remove.sort();

        Ok(plan)
    }
}

fn display_name(locator: &str, kind: SourceKind) -> String {
    match kind {
        SourceKind::LocalFile | SourceKind::LocalFolder => std::path::Path::new(locator)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| locator.to_string()),
        SourceKind::Repository => locator
            .trim_end_matches(".git")
            .rsplit('/')
            .next()
            .unwrap_or(locator)
            .to_string(),
        SourceKind::DriveFolder | SourceKind::WebPage => locator.to_string(),
    }
}

fn row_to_source(row: &sqlx::sqlite::SqliteRow) -> IndexResult<KnowledgeSource> {
    let kind_str: String = row.get("kind");
    let status_str: String = row.get("status");
    let filters_json: String = row.get("filters_json");
    let created_at: i64 = row.get("created_at");
    let last_processed_at: Option<i64> = row.get("last_processed_at");

    Ok(KnowledgeSource {
        id: row.get("id"),
        kind: SourceKind::from_str(&kind_str)
            .map_err(|e| IndexError::InvalidConfig(e.to_string()))?,
        name: row.get("name"),
        locator: row.get("locator"),
        filters: serde_json::from_str(&filters_json).unwrap_or_default(),
        monitoring_enabled: row.get::<i64, _>("monitoring_enabled") != 0,
        status: SourceStatus::from_str(&status_str)
            .map_err(|e| IndexError::InvalidConfig(e.to_string()))?,
        fingerprint: row.get("fingerprint"),
        document_count: row.get("document_count"),
        last_processed_at: last_processed_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        error_detail: row.get("error_detail"),
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (tempfile::TempDir, VectorStore, SourceRegistry, ExtractContext) {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(&dir.path().join("index.sqlite"))
            .await
            .unwrap();
        let registry = SourceRegistry::new(store.pool().clone());
        let ctx = ExtractContext::new(dir.path().join("cache"));
        (dir, store, registry, ctx)
    }

    #[tokio::test]
    async fn register_and_get_round_trip() {
        let (dir, _store, registry, _ctx) = setup().await;
        let folder = dir.path().join("docs");
        std::fs::create_dir_all(&folder).unwrap();

        let source = registry
            .register(
                folder.to_str().unwrap(),
                SourceKind::LocalFolder,
                None,
                SourceFilters::default(),
                false,
            )
            .await
            .unwrap();
        assert_eq!(source.status, SourceStatus::Pending);
        assert_eq!(source.name, "docs");

        let loaded = registry.get(&source.id).await.unwrap();
        assert_eq!(loaded.locator, source.locator);
        assert_eq!(loaded.kind, SourceKind::LocalFolder);
    }

    #[tokio::test]
    async fn duplicate_registration_rejected_across_spellings() {
        let (dir, _store, registry, _ctx) = setup().await;
        let folder = dir.path().join("docs");
        std::fs::create_dir_all(&folder).unwrap();

        registry
            .register(
                folder.to_str().unwrap(),
                SourceKind::LocalFolder,
                None,
                SourceFilters::default(),
                false,
            )
            .await
            .unwrap();

        // Same folder, spelled with a trailing slash and a `.` component.
        let alt = format!("{}/./", folder.display());
        let err = registry
            .register(
                &alt,
                SourceKind::LocalFolder,
                None,
                SourceFilters::default(),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::DuplicateSource(_)));
    }

    #[tokio::test]
    async fn unregister_unknown_source_errors() {
        let (_dir, _store, registry, _ctx) = setup().await;
        let err = registry.unregister("nope").await.unwrap_err();
        assert!(matches!(err, IndexError::UnknownSource(_)));
    }

    #[tokio::test]
    async fn scan_classifies_add_update_remove() {
        let (dir, store, registry, ctx) = setup().await;
        let folder = dir.path().join("docs");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("keep.txt"), "keep me").unwrap();
        std::fs::write(folder.join("change.txt"), "before").unwrap();
        std::fs::write(folder.join("gone.txt"), "doomed").unwrap();

        let source = registry
            .register(
                folder.to_str().unwrap(),
                SourceKind::LocalFolder,
                None,
                SourceFilters::default(),
                false,
            )
            .await
            .unwrap();

        // First scan: everything is new.
        let plan = registry.scan(&store, &ctx, &source.id).await.unwrap();
        assert_eq!(plan.to_add.len(), 3);
        assert!(plan.to_update.is_empty());
        assert!(plan.to_remove.is_empty());

        // Persist the three documents so the next scan has a baseline.
        store.ensure_model("stub", 1).await.unwrap();
        for doc in &plan.to_add {
            store
                .upsert_document(
                    &source.id,
                    doc,
                    &[crate::chunk::ChunkSpan {
                        index: 0,
                        text: doc.text.clone(),
                        start: 0,
                        end: doc.text.len(),
                    }],
                    &[vec![1.0]],
                    "stub",
                )
                .await
                .unwrap();
        }

        // Unchanged tree: empty plan (idempotent re-scan).
        let plan = registry.scan(&store, &ctx, &source.id).await.unwrap();
        assert!(plan.is_empty());

        // Touch one file, delete another, add a third.
        std::fs::write(folder.join("change.txt"), "after").unwrap();
        std::fs::remove_file(folder.join("gone.txt")).unwrap();
        std::fs::write(folder.join("new.txt"), "brand new").unwrap();

        let plan = registry.scan(&store, &ctx, &source.id).await.unwrap();
        assert_eq!(plan.to_add.len(), 1);
        assert_eq!(plan.to_add[0].path, "new.txt");
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].path, "change.txt");
        assert_eq!(plan.to_remove.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_scan_sets_error_and_keeps_documents() {
        let (dir, store, registry, ctx) = setup().await;
        let folder = dir.path().join("volatile");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("a.txt"), "content").unwrap();

        let source = registry
            .register(
                folder.to_str().unwrap(),
                SourceKind::LocalFolder,
                None,
                SourceFilters::default(),
                false,
            )
            .await
            .unwrap();

        let plan = registry.scan(&store, &ctx, &source.id).await.unwrap();
        store.ensure_model("stub", 1).await.unwrap();
        store
            .upsert_document(
                &source.id,
                &plan.to_add[0],
                &[crate::chunk::ChunkSpan {
                    index: 0,
                    text: "content".to_string(),
                    start: 0,
                    end: 7,
                }],
                &[vec![1.0]],
                "stub",
            )
            .await
            .unwrap();

        std::fs::remove_dir_all(&folder).unwrap();

        let err = registry.scan(&store, &ctx, &source.id).await.unwrap_err();
        assert!(matches!(err, IndexError::ScanUnreachable { .. }));

        let reloaded = registry.get(&source.id).await.unwrap();
        assert_eq!(reloaded.status, SourceStatus::Error);
        assert!(reloaded.error_detail.is_some());
        // Prior documents survive the failed scan.
        assert_eq!(store.stats(Some(&source.id)).await.unwrap().document_count, 1);
    }
}
