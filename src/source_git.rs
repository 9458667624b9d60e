//! Repository resolution.
//!
//! Clones (shallow) or updates a checkout under a content-addressed cache
//! directory using the `git` CLI, then walks the working tree like a local
//! folder. Authentication is the ambient git credential setup; the engine
//! never handles credentials itself.

use std::path::{Path, PathBuf};
use std::process::Command;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{IndexError, IndexResult};
use crate::extract::RawDocument;
use crate::models::KnowledgeSource;
use crate::source_fs;

const DEFAULT_BRANCH: &str = "main";

pub(crate) fn resolve(
    source: &KnowledgeSource,
    cache_root: &Path,
) -> IndexResult<Vec<IndexResult<RawDocument>>> {
    let checkout = checkout_dir(cache_root, &source.locator);
    let branch = source.filters.branch.as_deref().unwrap_or(DEFAULT_BRANCH);

    if checkout.join(".git").exists() {
        git_update(&checkout, branch).map_err(|cause| IndexError::ScanUnreachable {
            source_id: source.locator.clone(),
            cause,
        })?;
    } else {
        git_clone(&source.locator, branch, &checkout).map_err(|cause| {
            IndexError::ScanUnreachable {
                source_id: source.locator.clone(),
                cause,
            }
        })?;
    }

    debug!(repo = %source.locator, checkout = %checkout.display(), "repository ready");
    source_fs::resolve_folder(&checkout, &source.filters)
}

/// Cache directory for one repository URL.
fn checkout_dir(cache_root: &Path, url: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    cache_root.join("repos").join(&digest[..12])
}

fn git_clone(url: &str, branch: &str, dest: &Path) -> Result<(), String> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }

    let output = Command::new("git")
        .args([
            "clone",
            "--depth",
            "1",
            "--branch",
            branch,
            "--single-branch",
            url,
        ])
        .arg(dest)
        .output()
        .map_err(|e| format!("failed to run git clone: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("git clone failed: {}", stderr.trim()));
    }
    Ok(())
}

fn git_update(checkout: &Path, branch: &str) -> Result<(), String> {
    let output = Command::new("git")
        .args(["fetch", "--depth", "1", "origin", branch])
        .current_dir(checkout)
        .output()
        .map_err(|e| format!("failed to run git fetch: {}", e))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("git fetch failed: {}", stderr.trim()));
    }

    let remote_ref = format!("origin/{}", branch);
    let output = Command::new("git")
        .args(["reset", "--hard", &remote_ref])
        .current_dir(checkout)
        .output()
        .map_err(|e| format!("failed to run git reset: {}", e))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("git reset failed: {}", stderr.trim()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_dir_is_stable_per_url() {
        let root = Path::new("/tmp/cache");
        let a = checkout_dir(root, "https://example.com/org/repo.git");
        let b = checkout_dir(root, "https://example.com/org/repo.git");
        let c = checkout_dir(root, "https://example.com/org/other.git");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("/tmp/cache/repos"));
    }

    #[test]
    fn unreachable_repo_reports_scan_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let source = KnowledgeSource {
            id: "s1".to_string(),
            kind: crate::models::SourceKind::Repository,
            name: "broken".to_string(),
            locator: dir.path().join("no-such-repo").display().to_string(),
            filters: Default::default(),
            monitoring_enabled: false,
            status: crate::models::SourceStatus::Pending,
            fingerprint: String::new(),
            document_count: 0,
            last_processed_at: None,
            error_detail: None,
            created_at: chrono::Utc::now(),
        };
        let err = resolve(&source, dir.path()).unwrap_err();
        assert!(matches!(err, IndexError::ScanUnreachable { .. }));
    }
}
