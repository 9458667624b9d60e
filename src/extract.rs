//! Content extraction: resolves a source to its documents and turns each
//! one into plain text plus a content hash.
//!
//! Dispatch is a closed match over [`SourceKind`]; each kind has its own
//! resolver module (`source_fs`, `source_git`, `source_drive`,
//! `source_web`). Format handling is shared: text-like files are read
//! directly, PDF and OOXML containers go through format-specific walkers,
//! and unrecognized binary payloads are skipped rather than failed.
//!
//! Failures are isolated per document: one unreadable file becomes an
//! entry in [`ExtractionOutcome::failures`] and never aborts the walk.
//! Only an unreachable source root fails the whole extraction.

use std::io::Read;
use std::path::Path;

use tracing::debug;

use crate::error::{IndexError, IndexResult};
use crate::models::{ContentKind, DocumentFailure, ExtractedDocument, KnowledgeSource, SourceKind};
use crate::source_drive;
use crate::source_fs;
use crate::source_git;
use crate::source_web;

/// Maximum sheets to process in an xlsx workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Shared handles the resolvers need: an HTTP client, an optional
/// pre-authenticated drive token supplied by the host application, and a
/// cache directory for repository clones.
#[derive(Debug, Clone)]
pub struct ExtractContext {
    pub http: reqwest::Client,
    pub drive_token: Option<String>,
    pub cache_root: std::path::PathBuf,
}

impl ExtractContext {
    pub fn new(cache_root: std::path::PathBuf) -> Self {
        Self {
            http: reqwest::Client::new(),
            drive_token: None,
            cache_root,
        }
    }
}

/// A document resolved by a source module, before format extraction.
#[derive(Debug)]
pub(crate) struct RawDocument {
    /// Path or URL relative to the source locator.
    pub path: String,
    pub payload: RawPayload,
    pub modified_at: i64,
}

#[derive(Debug)]
pub(crate) enum RawPayload {
    Text(String),
    Bytes(Vec<u8>),
}

/// Everything one extraction pass produced for a source.
#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    pub documents: Vec<ExtractedDocument>,
    pub failures: Vec<DocumentFailure>,
}

/// Resolve and extract every document under a source.
///
/// Restartable: each call re-walks the source from scratch. Returns `Err`
/// only when the source root itself is unreachable; per-document problems
/// land in the outcome's `failures`.
pub async fn extract_source(
    source: &KnowledgeSource,
    ctx: &ExtractContext,
) -> IndexResult<ExtractionOutcome> {
    let resolved = match source.kind {
        SourceKind::LocalFile | SourceKind::LocalFolder => {
            source_fs::resolve(&source.locator, source.kind, &source.filters)?
        }
        SourceKind::Repository => source_git::resolve(source, &ctx.cache_root)?,
        SourceKind::DriveFolder => source_drive::resolve(source, ctx).await?,
        SourceKind::WebPage => source_web::resolve(source, &ctx.http).await?,
    };

    let mut outcome = ExtractionOutcome::default();
    for item in resolved {
        match item {
            Ok(raw) => match extract_document(raw) {
                Ok(Some(doc)) => outcome.documents.push(doc),
                Ok(None) => {}
                Err(IndexError::Extraction { path, cause }) => {
                    outcome.failures.push(DocumentFailure {
                        path,
                        error: cause,
                    });
                }
                Err(other) => return Err(other),
            },
            Err(IndexError::Extraction { path, cause }) => {
                outcome.failures.push(DocumentFailure { path, error: cause });
            }
            Err(other) => return Err(other),
        }
    }

    debug!(
        source = %source.id,
        documents = outcome.documents.len(),
        failures = outcome.failures.len(),
        "extraction complete"
    );
    Ok(outcome)
}

/// Turn one resolved document into extracted text, or `None` when the
/// payload is an unsupported binary format (skipped, not fatal).
fn extract_document(raw: RawDocument) -> IndexResult<Option<ExtractedDocument>> {
    let kind = ContentKind::from_path(Path::new(&raw.path));

    let text = match raw.payload {
        RawPayload::Text(text) => text,
        RawPayload::Bytes(bytes) => {
            let ext = Path::new(&raw.path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_ascii_lowercase();
            let extracted = match ext.as_str() {
                "pdf" => Some(extract_pdf(&bytes)),
                "docx" => Some(extract_docx(&bytes)),
                "pptx" => Some(extract_pptx(&bytes)),
                "xlsx" => Some(extract_xlsx(&bytes)),
                _ => match String::from_utf8(bytes) {
                    Ok(text) if !text.contains('\0') => Some(Ok(text)),
                    _ => None,
                },
            };
            match extracted {
                Some(Ok(text)) => text,
                Some(Err(cause)) => {
                    return Err(IndexError::Extraction {
                        path: raw.path,
                        cause,
                    });
                }
                None => {
                    debug!(path = %raw.path, "skipping unsupported binary format");
                    return Ok(None);
                }
            }
        }
    };

    if text.trim().is_empty() {
        debug!(path = %raw.path, "skipping empty document");
        return Ok(None);
    }

    Ok(Some(ExtractedDocument::new(
        raw.path,
        text,
        kind,
        raw.modified_at,
    )))
}

// ============ Format walkers (PDF, OOXML) ============

fn extract_pdf(bytes: &[u8]) -> Result<String, String> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| format!("pdf extraction failed: {}", e))
}

fn open_archive(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, String> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| format!("not a valid OOXML container: {}", e))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, String> {
    let entry = archive.by_name(name).map_err(|e| e.to_string())?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(format!("ZIP entry {} exceeds size limit", name));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, String> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")
        .map_err(|e| format!("word/document.xml: {}", e))?;
    collect_text_elements(&xml)
}

fn extract_pptx(bytes: &[u8]) -> Result<String, String> {
    let mut archive = open_archive(bytes)?;
    let mut slides: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slides.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut out = String::new();
    for name in slides {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let text = collect_text_elements(&xml)?;
        if !out.is_empty() && !text.is_empty() {
            out.push('\n');
        }
        out.push_str(&text);
    }
    Ok(out)
}

/// Collect the character content of every `<t>`/`<a:t>`/`<w:t>` element.
fn collect_text_elements(xml: &[u8]) -> Result<String, String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, String> {
    let mut archive = open_archive(bytes)?;
    let shared = read_shared_strings(&mut archive)?;

    let mut sheets: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    sheets.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut out = String::new();
    for name in sheets.into_iter().take(XLSX_MAX_SHEETS) {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let cells = extract_sheet_cells(&xml, &shared)?;
        if !out.is_empty() && !cells.is_empty() {
            out.push('\n');
        }
        out.push_str(&cells);
    }
    Ok(out)
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, String> {
    let xml = match read_zip_entry_bounded(archive, "xl/sharedStrings.xml") {
        Ok(xml) => xml,
        // Workbooks without shared strings still have inline numeric cells.
        Err(_) => return Ok(Vec::new()),
    };

    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => in_si = true,
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                strings.push(te.unescape().unwrap_or_default().into_owned());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"si" => in_si = false,
                b"t" => in_t = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn extract_sheet_cells(xml: &[u8], shared: &[String]) -> Result<String, String> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut cell_is_shared = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_is_shared = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" => in_v = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_v => {
                let value = te.unescape().unwrap_or_default();
                let value = value.trim();
                if !value.is_empty() {
                    if cell_is_shared {
                        if let Ok(i) = value.parse::<usize>() {
                            if let Some(s) = shared.get(i) {
                                cells.push(s.clone());
                            }
                        }
                    } else {
                        cells.push(value.to_string());
                    }
                }
                in_v = false;
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_v = false,
                b"c" => cell_is_shared = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}
