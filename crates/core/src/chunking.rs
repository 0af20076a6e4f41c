use crate::error::IngestError;
use crate::models::{Chunk, DocType, Document, IngestionOptions, POINT_ID_STRIDE};
use regex::Regex;

const PAGE_BREAK_PATTERN: &str = r"<PAGE_BREAK:\s*(\d+)\s*>";

pub fn page_break_marker(page: u32) -> String {
    format!("<PAGE_BREAK: {page}>")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_step: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig::from(&IngestionOptions::default())
    }
}

impl From<&IngestionOptions> for ChunkingConfig {
    fn from(value: &IngestionOptions) -> Self {
        Self {
            chunk_size: value.chunk_size,
            chunk_step: value.chunk_step,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be positive".to_string(),
            ));
        }
        if self.chunk_step == 0 || self.chunk_step > self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_step {} must be in 1..={}",
                self.chunk_step, self.chunk_size
            )));
        }
        Ok(())
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// Overlapping windows of `chunk_size` characters advanced by `chunk_step`.
///
/// The scan stops at the first window that reaches the end of the text, so a text of
/// `n > 0` characters yields `ceil(max(0, n - size) / step) + 1` windows. Windows are
/// trimmed and dropped when nothing but whitespace remains.
pub fn sliding_window(text: &str, config: ChunkingConfig) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut windows = Vec::new();
    if config.chunk_size == 0 || config.chunk_step == 0 {
        return windows;
    }

    let mut start = 0;
    while start < chars.len() {
        let end = start.saturating_add(config.chunk_size).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            windows.push(trimmed.to_string());
        }
        if end == chars.len() {
            break;
        }
        start = start.saturating_add(config.chunk_step);
    }

    windows
}

/// A page of a marker-delimited text. Text preceding the first marker has no page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSegment<'a> {
    pub page: Option<u32>,
    pub text: &'a str,
}

pub fn split_pages(raw_text: &str) -> Result<Vec<PageSegment<'_>>, IngestError> {
    let marker = Regex::new(PAGE_BREAK_PATTERN)?;
    let mut segments = Vec::new();
    let mut cursor = 0;
    let mut current_page = None;

    for capture in marker.captures_iter(raw_text) {
        let Some(whole) = capture.get(0) else {
            continue;
        };
        segments.push(PageSegment {
            page: current_page,
            text: &raw_text[cursor..whole.start()],
        });
        current_page = capture.get(1).and_then(|number| number.as_str().parse().ok());
        cursor = whole.end();
    }
    segments.push(PageSegment {
        page: current_page,
        text: &raw_text[cursor..],
    });

    Ok(segments
        .into_iter()
        .filter(|segment| !segment.text.trim().is_empty())
        .collect())
}

/// Windows over the whole text, ignoring page structure.
pub fn chunk_flat(doc_id: u64, text: &str, config: ChunkingConfig) -> Vec<Chunk> {
    sliding_window(text, config)
        .into_iter()
        .enumerate()
        .map(|(index, body)| Chunk {
            doc_id,
            chunk_id: index as u64,
            page: None,
            body,
            embedding: Vec::new(),
        })
        .collect()
}

/// Windows per page so that no chunk spans a page break. Ids keep counting across pages.
pub fn chunk_paged(doc_id: u64, text: &str, config: ChunkingConfig) -> Result<Vec<Chunk>, IngestError> {
    let mut chunks = Vec::new();
    for segment in split_pages(text)? {
        for body in sliding_window(segment.text, config) {
            chunks.push(Chunk {
                doc_id,
                chunk_id: chunks.len() as u64,
                page: segment.page,
                body,
                embedding: Vec::new(),
            });
        }
    }
    Ok(chunks)
}

/// The entire text as chunk 0.
pub fn chunk_whole(doc_id: u64, text: &str) -> Vec<Chunk> {
    let body = text.trim();
    if body.is_empty() {
        return Vec::new();
    }
    vec![Chunk {
        doc_id,
        chunk_id: 0,
        page: None,
        body: body.to_string(),
        embedding: Vec::new(),
    }]
}

/// Chunks a document with the strategy for its type and enforces the per-document id budget.
pub fn chunk_document(document: &Document, config: ChunkingConfig) -> Result<Vec<Chunk>, IngestError> {
    config.validate()?;
    let chunks = match document.doc_type {
        DocType::Pdf => chunk_paged(document.doc_id, &document.raw_text, config)?,
        DocType::Word | DocType::Mbox => chunk_flat(document.doc_id, &document.raw_text, config),
        DocType::ForumThread => chunk_whole(document.doc_id, &document.raw_text),
    };

    if chunks.len() as u64 > POINT_ID_STRIDE {
        return Err(IngestError::ChunkOverflow {
            title: document.title.clone(),
            chunks: chunks.len(),
            limit: POINT_ID_STRIDE,
        });
    }

    Ok(chunks)
}
