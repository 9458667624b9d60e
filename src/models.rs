//! Core data models for the ingestion and retrieval pipeline.
//!
//! These types represent the sources, documents, chunks, and results that
//! flow through scanning, chunking, embedding, storage, and retrieval.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::IndexError;

/// Kind of a registered knowledge source.
///
/// Closed set: each variant maps to one extraction strategy. Extraction
/// dispatch is by `match`, never by runtime inspection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    LocalFile,
    LocalFolder,
    Repository,
    DriveFolder,
    WebPage,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalFile => "local_file",
            Self::LocalFolder => "local_folder",
            Self::Repository => "repository",
            Self::DriveFolder => "drive_folder",
            Self::WebPage => "web_page",
        }
    }

    /// Whether this kind is backed by the local filesystem (and therefore
    /// watchable via file-system events rather than polling).
    pub fn is_local(&self) -> bool {
        matches!(self, Self::LocalFile | Self::LocalFolder)
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_file" => Ok(Self::LocalFile),
            "local_folder" => Ok(Self::LocalFolder),
            "repository" => Ok(Self::Repository),
            "drive_folder" => Ok(Self::DriveFolder),
            "web_page" => Ok(Self::WebPage),
            other => Err(format!("unknown source kind: {}", other)),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of a knowledge source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Pending,
    Processing,
    Indexed,
    Error,
    Removed,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Indexed => "indexed",
            Self::Error => "error",
            Self::Removed => "removed",
        }
    }
}

impl FromStr for SourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "indexed" => Ok(Self::Indexed),
            "error" => Ok(Self::Error),
            "removed" => Ok(Self::Removed),
            other => Err(format!("unknown source status: {}", other)),
        }
    }
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content classification of an extracted document. Drives the chunk policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    #[default]
    Prose,
    Code,
    Tabular,
    Other,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prose => "prose",
            Self::Code => "code",
            Self::Tabular => "tabular",
            Self::Other => "other",
        }
    }

    /// Classify a document by its path extension.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "rs" | "py" | "js" | "jsx" | "ts" | "tsx" | "go" | "java" | "c" | "h" | "cpp"
            | "rb" | "php" | "swift" | "kt" | "scala" | "sh" => Self::Code,
            "csv" | "tsv" => Self::Tabular,
            "md" | "markdown" | "rst" | "txt" | "html" | "htm" | "tex" | "adoc" | "pdf"
            | "docx" | "pptx" => Self::Prose,
            _ => Self::Other,
        }
    }
}

impl FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prose" => Ok(Self::Prose),
            "code" => Ok(Self::Code),
            "tabular" => Ok(Self::Tabular),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown content kind: {}", other)),
        }
    }
}

/// Include/exclude filters and crawl options attached to a source.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceFilters {
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Web sources: follow same-domain links up to `max_pages` pages.
    #[serde(default)]
    pub crawl: bool,
    /// Web sources: expand a sitemap instead of following links.
    #[serde(default)]
    pub sitemap: bool,
    /// Page budget for crawl/sitemap expansion.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Repository sources: branch to check out.
    #[serde(default)]
    pub branch: Option<String>,
}

fn default_max_pages() -> usize {
    20
}

/// One registered origin of content.
#[derive(Debug, Clone)]
pub struct KnowledgeSource {
    /// Stable identifier derived from the normalized locator.
    pub id: String,
    pub kind: SourceKind,
    pub name: String,
    /// Path or URL this source resolves from.
    pub locator: String,
    pub filters: SourceFilters,
    pub monitoring_enabled: bool,
    pub status: SourceStatus,
    /// Hash over the sorted member-document hashes; empty before first scan.
    pub fingerprint: String,
    pub document_count: i64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One resolved unit of content under a source.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub source_id: String,
    /// Path or URL relative to the source locator.
    pub path: String,
    /// SHA-256 over the extracted plain text; the change-detection key.
    pub content_hash: String,
    pub text_len: i64,
    pub chunk_count: i64,
    pub modified_at: i64,
}

/// One indexed unit of text. Immutable once stored; re-indexing replaces
/// the whole chunk set for a document rather than mutating rows.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub source_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// Byte offsets into the document's extracted text.
    pub start_offset: i64,
    pub end_offset: i64,
    pub kind: ContentKind,
    pub created_at: i64,
}

/// A document resolved and extracted during a scan, before chunking.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub path: String,
    pub text: String,
    pub content_hash: String,
    pub kind: ContentKind,
    pub modified_at: i64,
}

impl ExtractedDocument {
    pub fn new(path: String, text: String, kind: ContentKind, modified_at: i64) -> Self {
        let content_hash = content_hash(&text);
        Self {
            path,
            text,
            content_hash,
            kind,
            modified_at,
        }
    }
}

/// What a scan decided needs doing for one source.
#[derive(Debug, Default)]
pub struct ScanPlan {
    /// Documents not previously present.
    pub to_add: Vec<ExtractedDocument>,
    /// Documents whose content hash changed.
    pub to_update: Vec<ExtractedDocument>,
    /// Document ids previously present but now absent from the source.
    pub to_remove: Vec<String>,
    /// Per-document extraction failures recorded during the walk.
    pub failed: Vec<DocumentFailure>,
    /// Fingerprint over the source's current document hashes.
    pub fingerprint: String,
}

impl ScanPlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }
}

/// A per-document failure captured without aborting siblings.
#[derive(Debug, Clone)]
pub struct DocumentFailure {
    pub path: String,
    pub error: String,
}

/// Outcome of processing one source.
#[derive(Debug, Default)]
pub struct ProcessingReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub failed: Vec<DocumentFailure>,
    /// True when cancellation stopped the batch before all documents ran.
    pub cancelled: bool,
}

/// A chunk surfaced by retrieval, with its score and document reference.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub document_path: String,
    pub source_id: String,
    pub text: String,
    pub score: f32,
}

/// Ranked, deduplicated retrieval output for one query. Ephemeral.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub results: Vec<ScoredChunk>,
}

/// Aggregate counts for one source (or the whole corpus).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub document_count: i64,
    pub chunk_count: i64,
}

/// SHA-256 hex digest of extracted text; the change-detection key.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fingerprint a source from its current `(path, hash)` pairs.
///
/// Order-independent: pairs are sorted by path before hashing.
pub fn source_fingerprint(docs: &[(String, String)]) -> String {
    let mut pairs: Vec<&(String, String)> = docs.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (path, hash) in pairs {
        hasher.update(path.as_bytes());
        hasher.update(b":");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Derive the stable source identifier from a normalized locator.
pub fn source_identifier(locator: &str, kind: SourceKind) -> String {
    let normalized = normalize_locator(locator, kind);
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// Normalize a locator so that equivalent spellings collapse to one id.
///
/// Local paths are cleaned lexically (no filesystem access): `.` components
/// and trailing separators are dropped, `..` pops the previous component.
/// URLs get a lowercased scheme and host and lose any trailing slash.
pub fn normalize_locator(locator: &str, kind: SourceKind) -> String {
    if kind.is_local() {
        return normalize_path(locator);
    }
    match url::Url::parse(locator) {
        Ok(mut parsed) => {
            if let Some(host) = parsed.host_str().map(|h| h.to_ascii_lowercase()) {
                let _ = parsed.set_host(Some(&host));
            }
            parsed.as_str().trim_end_matches('/').to_string()
        }
        Err(_) => locator.trim_end_matches('/').to_string(),
    }
}

fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() && !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Map a raised error to the per-document failure record for a report.
pub fn failure_from_error(path: &str, err: &IndexError) -> DocumentFailure {
    DocumentFailure {
        path: path.to_string(),
        error: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_kind_from_extension() {
        assert_eq!(ContentKind::from_path(Path::new("a/b.rs")), ContentKind::Code);
        assert_eq!(ContentKind::from_path(Path::new("x.py")), ContentKind::Code);
        assert_eq!(ContentKind::from_path(Path::new("d.csv")), ContentKind::Tabular);
        assert_eq!(ContentKind::from_path(Path::new("n.md")), ContentKind::Prose);
        assert_eq!(ContentKind::from_path(Path::new("n.txt")), ContentKind::Prose);
        assert_eq!(ContentKind::from_path(Path::new("bin.dat")), ContentKind::Other);
        assert_eq!(ContentKind::from_path(Path::new("noext")), ContentKind::Other);
    }

    #[test]
    fn source_kind_round_trips() {
        for kind in [
            SourceKind::LocalFile,
            SourceKind::LocalFolder,
            SourceKind::Repository,
            SourceKind::DriveFolder,
            SourceKind::WebPage,
        ] {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn identifier_stable_across_path_spellings() {
        let a = source_identifier("/data/notes", SourceKind::LocalFolder);
        let b = source_identifier("/data/notes/", SourceKind::LocalFolder);
        let c = source_identifier("/data/./other/../notes", SourceKind::LocalFolder);
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn identifier_distinguishes_kinds() {
        let file = source_identifier("/data/notes", SourceKind::LocalFile);
        let folder = source_identifier("/data/notes", SourceKind::LocalFolder);
        assert_ne!(file, folder);
    }

    #[test]
    fn url_normalization_lowercases_host() {
        let a = source_identifier("https://Example.COM/docs/", SourceKind::WebPage);
        let b = source_identifier("https://example.com/docs", SourceKind::WebPage);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let forward = vec![
            ("a.md".to_string(), "h1".to_string()),
            ("b.md".to_string(), "h2".to_string()),
        ];
        let reversed: Vec<_> = forward.iter().rev().cloned().collect();
        assert_eq!(source_fingerprint(&forward), source_fingerprint(&reversed));
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let before = vec![("a.md".to_string(), content_hash("one"))];
        let after = vec![("a.md".to_string(), content_hash("two"))];
        assert_ne!(source_fingerprint(&before), source_fingerprint(&after));
    }
}
