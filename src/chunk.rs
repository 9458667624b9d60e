//! Content-type-aware text chunking.
//!
//! The default policy slides a window of `max_size` characters over the
//! text with `overlap` characters shared between consecutive windows,
//! snapping each cut to the nearest sentence or line boundary within a
//! small lookback window. Code is split along function/blank-line
//! boundaries, tabular data per record group. All policies report byte
//! offsets into the original text so `&text[start..end]` reproduces the
//! chunk exactly.

use crate::models::ContentKind;

/// How far back from a hard cut we search for a sentence/line boundary.
const SNAP_LOOKBACK: usize = 80;

/// One chunk of a document's text with its byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: usize,
    pub text: String,
    /// Byte offset of the first character, inclusive.
    pub start: usize,
    /// Byte offset past the last character, exclusive.
    pub end: usize,
}

/// Split `text` into chunks according to its content kind.
///
/// `max_size` and `overlap` are measured in characters, not bytes, so
/// multi-byte text never splits inside a code point. Empty text yields no
/// chunks; text shorter than `max_size` yields exactly one. Callers must
/// guarantee `overlap < max_size` (enforced by config validation).
pub fn chunk_text(
    text: &str,
    kind: ContentKind,
    max_size: usize,
    overlap: usize,
) -> Vec<ChunkSpan> {
    debug_assert!(overlap < max_size, "overlap must be < max_size");

    if text.is_empty() {
        return Vec::new();
    }

    match kind {
        ContentKind::Code => chunk_code(text, max_size, overlap),
        ContentKind::Tabular => chunk_tabular(text, max_size),
        ContentKind::Prose | ContentKind::Other => chunk_window(text, 0, max_size, overlap),
    }
}

/// Default policy: overlapping sliding window with boundary snapping.
///
/// `base` shifts reported offsets, letting other policies reuse this for
/// sub-slices of the original document.
fn chunk_window(text: &str, base: usize, max_size: usize, overlap: usize) -> Vec<ChunkSpan> {
    // Byte index of every character, plus the end sentinel.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let n = bounds.len() - 1; // character count

    if n <= max_size {
        return vec![ChunkSpan {
            index: 0,
            text: text.to_string(),
            start: base,
            end: base + text.len(),
        }];
    }

    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize; // in characters

    loop {
        let hard_end = (start + max_size).min(n);
        let end = if hard_end < n {
            snap_boundary(&chars, start, hard_end, overlap)
        } else {
            hard_end
        };

        chunks.push(ChunkSpan {
            index: chunks.len(),
            text: text[bounds[start]..bounds[end]].to_string(),
            start: base + bounds[start],
            end: base + bounds[end],
        });

        if end >= n {
            break;
        }
        // Exact overlap at every interior boundary keeps coverage lossless.
        start = end - overlap;
    }

    chunks
}

/// Snap a cut at `hard_end` back to the nearest boundary, if one exists
/// within the lookback window and still leaves the window room to advance.
fn snap_boundary(chars: &[char], start: usize, hard_end: usize, overlap: usize) -> usize {
    let floor = (start + overlap + 1).max(hard_end.saturating_sub(SNAP_LOOKBACK));

    let mut p = hard_end;
    while p > floor {
        let prev = chars[p - 1];
        if prev == '\n' {
            return p;
        }
        if matches!(prev, '.' | '!' | '?') && p < chars.len() && chars[p].is_whitespace() {
            return p;
        }
        p -= 1;
    }
    hard_end
}

/// Code policy: group blank-line-delimited segments, starting a new group
/// at function/type definition lines. Oversized segments fall back to the
/// default window policy.
fn chunk_code(text: &str, max_size: usize, overlap: usize) -> Vec<ChunkSpan> {
    let segments = code_segments(text);
    if segments.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<ChunkSpan> = Vec::new();
    let mut group_start: Option<usize> = None;
    let mut group_end = 0usize;
    let mut group_chars = 0usize;

    let flush = |chunks: &mut Vec<ChunkSpan>, start: usize, end: usize| {
        chunks.push(ChunkSpan {
            index: chunks.len(),
            text: text[start..end].to_string(),
            start,
            end,
        });
    };

    for (seg_start, seg_end) in segments {
        let seg_chars = text[seg_start..seg_end].chars().count();

        if seg_chars > max_size {
            // Flush any open group, then window the oversized segment.
            if let Some(start) = group_start.take() {
                flush(&mut chunks, start, group_end);
            }
            for span in chunk_window(&text[seg_start..seg_end], seg_start, max_size, overlap) {
                chunks.push(ChunkSpan {
                    index: chunks.len(),
                    ..span
                });
            }
            group_chars = 0;
            continue;
        }

        match group_start {
            Some(start) if group_chars + seg_chars > max_size => {
                flush(&mut chunks, start, group_end);
                group_start = Some(seg_start);
                group_end = seg_end;
                group_chars = seg_chars;
            }
            Some(_) => {
                // Gap between segments (blank lines) counts toward size.
                group_chars += text[group_end..seg_end].chars().count();
                group_end = seg_end;
            }
            None => {
                group_start = Some(seg_start);
                group_end = seg_end;
                group_chars = seg_chars;
            }
        }
    }

    if let Some(start) = group_start {
        flush(&mut chunks, start, group_end);
    }

    chunks
}

/// Split code into `(start, end)` byte ranges at blank lines and
/// definition starts.
fn code_segments(text: &str) -> Vec<(usize, usize)> {
    let mut segments = Vec::new();
    let mut seg_start: Option<usize> = None;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        let line_start = offset;
        offset += line.len();

        if trimmed.is_empty() {
            if let Some(start) = seg_start.take() {
                segments.push((start, line_start));
            }
            continue;
        }

        if is_definition_line(trimmed) {
            if let Some(start) = seg_start.take() {
                segments.push((start, line_start));
            }
            seg_start = Some(line_start);
        } else if seg_start.is_none() {
            seg_start = Some(line_start);
        }
    }

    if let Some(start) = seg_start {
        segments.push((start, text.len()));
    }

    segments
}

fn is_definition_line(line: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "fn ", "pub fn ", "async fn ", "pub async fn ", "impl ", "struct ", "pub struct ",
        "enum ", "pub enum ", "trait ", "pub trait ", "def ", "class ", "function ",
        "func ", "public ", "private ",
    ];
    PREFIXES.iter().any(|p| line.starts_with(p))
}

/// Tabular policy: whole lines grouped into record windows, no overlap.
fn chunk_tabular(text: &str, max_size: usize) -> Vec<ChunkSpan> {
    let mut chunks: Vec<ChunkSpan> = Vec::new();
    let mut group_start: Option<usize> = None;
    let mut group_chars = 0usize;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let line_chars = line.chars().count();

        match group_start {
            Some(start) if group_chars + line_chars > max_size => {
                chunks.push(ChunkSpan {
                    index: chunks.len(),
                    text: text[start..line_start].to_string(),
                    start,
                    end: line_start,
                });
                group_start = Some(line_start);
                group_chars = line_chars;
            }
            Some(_) => {
                group_chars += line_chars;
            }
            None => {
                group_start = Some(line_start);
                group_chars = line_chars;
            }
        }
    }

    if let Some(start) = group_start {
        chunks.push(ChunkSpan {
            index: chunks.len(),
            text: text[start..].to_string(),
            start,
            end: text.len(),
        });
    }

    chunks
}
