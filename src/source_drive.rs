//! Drive-folder resolution.
//!
//! Lists a cloud-drive folder through its REST API and downloads each
//! entry, exporting document-type entries (docs, sheets, slides) to plain
//! text and fetching regular files as raw bytes. The access token arrives
//! pre-authenticated from the credential collaborator; no auth flow runs
//! here. A missing token or an unlistable folder is an unreachable source;
//! an individual file that fails to export is a per-document error.
//!
//! The wire shapes follow the Google Drive v3 API (`files` listing with a
//! parent query, `export` for Workspace MIME types, `alt=media` downloads),
//! which is what the drive collaborator hands us folder ids for.

use serde::Deserialize;
use tracing::debug;

use crate::error::{IndexError, IndexResult};
use crate::extract::{ExtractContext, RawDocument, RawPayload};
use crate::models::KnowledgeSource;

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    name: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
    #[serde(rename = "modifiedTime")]
    modified_time: Option<String>,
}

pub(crate) async fn resolve(
    source: &KnowledgeSource,
    ctx: &ExtractContext,
) -> IndexResult<Vec<IndexResult<RawDocument>>> {
    let token = ctx
        .drive_token
        .as_deref()
        .ok_or_else(|| IndexError::ScanUnreachable {
            source_id: source.locator.clone(),
            cause: "no drive access token supplied".to_string(),
        })?;

    let folder_id = folder_id_from_locator(&source.locator);
    let files = list_folder(&ctx.http, token, &folder_id)
        .await
        .map_err(|cause| IndexError::ScanUnreachable {
            source_id: source.locator.clone(),
            cause,
        })?;

    debug!(folder = %folder_id, files = files.len(), "drive folder listed");

    let mut items = Vec::with_capacity(files.len());
    for file in files {
        items.push(fetch_file(&ctx.http, token, &file).await);
    }

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

/// Accepts a bare folder id or a `.../folders/<id>` share URL.
fn folder_id_from_locator(locator: &str) -> String {
    if let Some(pos) = locator.find("/folders/") {
        let tail = &locator[pos + "/folders/".len()..];
        return tail
            .split(['/', '?', '#'])
            .next()
            .unwrap_or(tail)
            .to_string();
    }
    locator.to_string()
}

async fn list_folder(
    client: &reqwest::Client,
    token: &str,
    folder_id: &str,
) -> Result<Vec<DriveFile>, String> {
    let mut files = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let mut request = client
            .get(format!("{}/files", DRIVE_API))
            .bearer_auth(token)
            .query(&[
                ("q", format!("'{}' in parents and trashed = false", folder_id)),
                ("fields", "nextPageToken, files(id, name, mimeType, modifiedTime)".to_string()),
                ("pageSize", "100".to_string()),
            ]);
        if let Some(ref t) = page_token {
            request = request.query(&[("pageToken", t.as_str())]);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("drive listing failed {}: {}", status, body));
        }

        let page: FileList = response.json().await.map_err(|e| e.to_string())?;
        files.extend(page.files);

        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    // Sub-folders are not expanded; the drive collaborator flattens shares.
    files.retain(|f| f.mime_type != "application/vnd.google-apps.folder");
    Ok(files)
}

async fn fetch_file(
    client: &reqwest::Client,
    token: &str,
    file: &DriveFile,
) -> IndexResult<RawDocument> {
    let modified_at = file
        .modified_time
        .as_deref()
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0);

    let per_doc = |cause: String| IndexError::Extraction {
        path: file.name.clone(),
        cause,
    };

    if let Some(export_mime) = export_mime_for(&file.mime_type) {
        let response = client
            .get(format!("{}/files/{}/export", DRIVE_API, file.id))
            .bearer_auth(token)
            .query(&[("mimeType", export_mime)])
            .send()
            .await
            .map_err(|e| per_doc(e.to_string()))?;
        if !response.status().is_success() {
            return Err(per_doc(format!("export failed: {}", response.status())));
        }
        let text = response.text().await.map_err(|e| per_doc(e.to_string()))?;
        return Ok(RawDocument {
            path: exported_name(&file.name, &file.mime_type),
            payload: RawPayload::Text(text),
            modified_at,
        });
    }

    let response = client
        .get(format!("{}/files/{}", DRIVE_API, file.id))
        .bearer_auth(token)
        .query(&[("alt", "media")])
        .send()
        .await
        .map_err(|e| per_doc(e.to_string()))?;
    if !response.status().is_success() {
        return Err(per_doc(format!("download failed: {}", response.status())));
    }
    let bytes = response.bytes().await.map_err(|e| per_doc(e.to_string()))?;

    Ok(RawDocument {
        path: file.name.clone(),
        payload: RawPayload::Bytes(bytes.to_vec()),
        modified_at,
    })
}

/// Workspace document types must be exported; everything else downloads raw.
fn export_mime_for(mime: &str) -> Option<&'static str> {
    match mime {
        "application/vnd.google-apps.document" => Some("text/plain"),
        "application/vnd.google-apps.spreadsheet" => Some("text/csv"),
        "application/vnd.google-apps.presentation" => Some("text/plain"),
        _ => None,
    }
}

/// Exported Workspace files get an extension matching the export format so
/// downstream content-kind classification works.
fn exported_name(name: &str, mime: &str) -> String {
    match mime {
        "application/vnd.google-apps.spreadsheet" => format!("{}.csv", name),
        _ => format!("{}.txt", name),
    }
}
