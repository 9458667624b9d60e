//! Local file and folder resolution.
//!
//! Walks the filesystem honoring the source's include/exclude globs plus a
//! set of always-excluded directories, producing one raw document per
//! matched file. Unreadable files become per-document errors; a missing
//! root fails the whole resolution.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::error::{IndexError, IndexResult};
use crate::extract::{RawDocument, RawPayload};
use crate::models::{SourceFilters, SourceKind};

/// Directories nobody wants indexed.
const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

pub(crate) fn resolve(
    locator: &str,
    kind: SourceKind,
    filters: &SourceFilters,
) -> IndexResult<Vec<IndexResult<RawDocument>>> {
    let root = Path::new(locator);
    if !root.exists() {
        return Err(IndexError::ScanUnreachable {
            source_id: locator.to_string(),
            cause: "path does not exist".to_string(),
        });
    }

    match kind {
        SourceKind::LocalFile => Ok(vec![read_file(root, file_name(root))]),
        SourceKind::LocalFolder => resolve_folder(root, filters),
        other => Err(IndexError::InvalidConfig(format!(
            "filesystem resolver cannot handle source kind '{}'",
            other
        ))),
    }
}

pub(crate) fn resolve_folder(
    root: &Path,
    filters: &SourceFilters,
) -> IndexResult<Vec<IndexResult<RawDocument>>> {
    let include_set = if filters.include_globs.is_empty() {
        None
    } else {
        Some(build_globset(&filters.include_globs)?)
    };

    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(filters.exclude_globs.clone());
    let exclude_set = build_globset(&excludes)?;

    let mut items = Vec::new();

    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| root.display().to_string());
                items.push(Err(IndexError::Extraction {
                    path,
                    cause: e.to_string(),
                }));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if let Some(ref includes) = include_set {
            if !includes.is_match(&rel_str) {
                continue;
            }
        }

        items.push(read_file(path, rel_str));
    }

    // Deterministic ordering for stable fingerprints and scans.
    items.sort_by(|a, b| {
        let key = |r: &IndexResult<RawDocument>| match r {
            Ok(doc) => doc.path.clone(),
            Err(IndexError::Extraction { path, .. }) => path.clone(),
            Err(_) => String::new(),
        };
        key(a).cmp(&key(b))
    });

    Ok(items)
}

fn read_file(path: &Path, rel_path: String) -> IndexResult<RawDocument> {
    let bytes = std::fs::read(path).map_err(|e| IndexError::Extraction {
        path: rel_path.clone(),
        cause: e.to_string(),
    })?;

    let modified_at = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    Ok(RawDocument {
        path: rel_path,
        payload: RawPayload::Bytes(bytes),
        modified_at,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn build_globset(patterns: &[String]) -> IndexResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| IndexError::InvalidConfig(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| IndexError::InvalidConfig(format!("glob set: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters(include: &[&str], exclude: &[&str]) -> SourceFilters {
        SourceFilters {
            include_globs: include.iter().map(|s| s.to_string()).collect(),
            exclude_globs: exclude.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn missing_root_is_unreachable() {
        let err = resolve(
            "/definitely/not/a/real/path",
            SourceKind::LocalFolder,
            &SourceFilters::default(),
        )
        .unwrap_err();
        assert!(matches!(err, IndexError::ScanUnreachable { .. }));
    }

    #[test]
    fn folder_walk_honors_globs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.md"), "kept").unwrap();
        std::fs::write(dir.path().join("skip.log"), "skipped").unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/inner.md"), "nested").unwrap();

        let items = resolve(
            dir.path().to_str().unwrap(),
            SourceKind::LocalFolder,
            &filters(&["**/*.md"], &[]),
        )
        .unwrap();

        let paths: Vec<String> = items.iter().map(|i| i.as_ref().unwrap().path.clone()).collect();
        assert_eq!(paths, vec!["keep.md", "sub/inner.md"]);
    }

    #[test]
    fn default_excludes_hide_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "noise").unwrap();
        std::fs::write(dir.path().join("real.txt"), "content").unwrap();

        let items = resolve(
            dir.path().to_str().unwrap(),
            SourceKind::LocalFolder,
            &SourceFilters::default(),
        )
        .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().path, "real.txt");
    }

    #[test]
    fn single_file_resolves_to_one_document() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("solo.txt");
        std::fs::write(&file, "alone").unwrap();

        let items = resolve(
            file.to_str().unwrap(),
            SourceKind::LocalFile,
            &SourceFilters::default(),
        )
        .unwrap();
        assert_eq!(items.len(), 1);
        let doc = items[0].as_ref().unwrap();
        assert_eq!(doc.path, "solo.txt");
        assert!(matches!(&doc.payload, RawPayload::Bytes(b) if b == b"alone"));
    }

    #[test]
    fn walk_is_deterministically_ordered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.md", "a.md", "b.md"] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }
        let items = resolve(
            dir.path().to_str().unwrap(),
            SourceKind::LocalFolder,
            &SourceFilters::default(),
        )
        .unwrap();
        let paths: Vec<String> = items.iter().map(|i| i.as_ref().unwrap().path.clone()).collect();
        assert_eq!(paths, vec!["a.md", "b.md", "c.md"]);
    }
}
