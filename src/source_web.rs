//! Web-page resolution.
//!
//! Fetches the locator URL and extracts its visible text. When the
//! source's filters ask for it, also expands the page set: BFS over
//! same-host links bounded by `max_pages`, or the `<loc>` entries of a
//! sitemap. Each page becomes one document keyed by its normalized URL;
//! a failed page fetch is a per-document error, a failed seed fetch makes
//! the source unreachable.

use std::collections::{HashSet, VecDeque};

use tracing::debug;
use url::Url;

use crate::error::{IndexError, IndexResult};
use crate::extract::{RawDocument, RawPayload};
use crate::models::KnowledgeSource;

const USER_AGENT: &str = concat!("knowledge-loom/", env!("CARGO_PKG_VERSION"));

pub(crate) async fn resolve(
    source: &KnowledgeSource,
    client: &reqwest::Client,
) -> IndexResult<Vec<IndexResult<RawDocument>>> {
    let seed = Url::parse(&source.locator).map_err(|e| IndexError::ScanUnreachable {
        source_id: source.locator.clone(),
        cause: format!("invalid URL: {}", e),
    })?;

    let mut items: Vec<IndexResult<RawDocument>> = Vec::new();

    if source.filters.sitemap {
        let urls = sitemap_urls(client, &seed, source.filters.max_pages)
            .await
            .map_err(|cause| IndexError::ScanUnreachable {
                source_id: source.locator.clone(),
                cause,
            })?;
        for url in urls {
            match fetch_page(client, &url).await {
                Ok(html) => items.push(Ok(page_document(&url, &html))),
                Err(cause) => items.push(Err(IndexError::Extraction { path: url, cause })),
            }
        }
    } else if source.filters.crawl {
        items = crawl(client, &seed, source.filters.max_pages).await?;
    } else {
        let url = normalize_url(&seed);
        let html = fetch_page(client, &url)
            .await
            .map_err(|cause| IndexError::ScanUnreachable {
                source_id: source.locator.clone(),
                cause,
            })?;
        items.push(Ok(page_document(&url, &html)));
    }

    debug!(seed = %source.locator, pages = items.len(), "web source resolved");
    Ok(items)
}

fn page_document(url: &str, html: &str) -> RawDocument {
    RawDocument {
        path: url.to_string(),
        payload: RawPayload::Text(html_to_text(html)),
        modified_at: 0,
    }
}

/// BFS over same-host links starting at the seed. The seed page failing
/// makes the source unreachable; later pages fail individually.
async fn crawl(
    client: &reqwest::Client,
    seed: &Url,
    max_pages: usize,
) -> IndexResult<Vec<IndexResult<RawDocument>>> {
    let host = seed
        .host_str()
        .ok_or_else(|| IndexError::ScanUnreachable {
            source_id: seed.to_string(),
            cause: "URL has no host".to_string(),
        })?
        .to_string();

    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    let mut items: Vec<IndexResult<RawDocument>> = Vec::new();
    let mut fetched = 0usize;

    let start = normalize_url(seed);
    visited.insert(start.clone());
    queue.push_back(start);

    while let Some(url) = queue.pop_front() {
        if fetched >= max_pages {
            break;
        }

        let html = match fetch_page(client, &url).await {
            Ok(html) => html,
            Err(cause) => {
                if fetched == 0 {
                    return Err(IndexError::ScanUnreachable { source_id: url, cause });
                }
                items.push(Err(IndexError::Extraction { path: url, cause }));
                continue;
            }
        };
        fetched += 1;

        for link in extract_links(&html, &url, &host) {
            if !visited.contains(&link) && visited.len() < max_pages * 2 {
                visited.insert(link.clone());
                queue.push_back(link);
            }
        }

        items.push(Ok(page_document(&url, &html)));
    }

    Ok(items)
}

/// Pull `<loc>` entries from a sitemap, bounded by `max_pages`.
async fn sitemap_urls(
    client: &reqwest::Client,
    sitemap: &Url,
    max_pages: usize,
) -> Result<Vec<String>, String> {
    let xml = fetch_page(client, sitemap.as_str()).await?;

    let mut urls = Vec::new();
    let mut reader = quick_xml::Reader::from_str(&xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_loc = false;
    loop {
        if urls.len() >= max_pages {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"loc" {
                    in_loc = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_loc => {
                let loc = te.unescape().unwrap_or_default().trim().to_string();
                if !loc.is_empty() {
                    urls.push(loc);
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"loc" {
                    in_loc = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(format!("sitemap parse error: {}", e)),
            _ => {}
        }
        buf.clear();
    }

    if urls.is_empty() {
        return Err("sitemap contains no URLs".to_string());
    }
    Ok(urls)
}

async fn fetch_page(client: &reqwest::Client, url: &str) -> Result<String, String> {
    let response = client
        .get(url)
        .header("User-Agent", USER_AGENT)
        .send()
        .await
        .map_err(|e| format!("fetch {}: {}", url, e))?;

    if !response.status().is_success() {
        return Err(format!("HTTP {} for {}", response.status(), url));
    }

    response.text().await.map_err(|e| format!("read body: {}", e))
}

/// Extract visible text from block-level elements, one line per element.
pub(crate) fn html_to_text(html: &str) -> String {
    let document = scraper::Html::parse_document(html);
    let selector = scraper::Selector::parse(
        "title, h1, h2, h3, h4, h5, h6, p, li, pre, blockquote, td, th, dt, dd, figcaption",
    )
    .expect("valid selector");

    let mut lines: Vec<String> = Vec::new();
    for element in document.select(&selector) {
        let text = element
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if !text.is_empty() {
            lines.push(text);
        }
    }
    lines.join("\n")
}

/// Extract same-host links from HTML.
fn extract_links(html: &str, base_url: &str, allowed_host: &str) -> Vec<String> {
    let document = scraper::Html::parse_document(html);
    let selector = scraper::Selector::parse("a[href]").expect("valid selector");

    let base = Url::parse(base_url).ok();

    document
        .select(&selector)
        .filter_map(|el| {
            let href = el.value().attr("href")?;
            resolve_link(href, base.as_ref(), allowed_host)
        })
        .collect()
}

/// Resolve a link against its base, keeping same-host http(s) URLs only.
fn resolve_link(href: &str, base: Option<&Url>, allowed_host: &str) -> Option<String> {
    if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
        return None;
    }

    let resolved = if let Ok(abs) = Url::parse(href) {
        abs
    } else {
        base?.join(href).ok()?
    };

    if resolved.host_str() != Some(allowed_host) {
        return None;
    }
    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }

    Some(normalize_url(&resolved))
}

/// Strip the fragment so anchor variants collapse to one page.
fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    normalized.to_string()
}
