use crate::error::SearchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Point ids are `doc_id * POINT_ID_STRIDE + chunk_id`, so a document owns at most
/// `POINT_ID_STRIDE` chunk ids (0..=999).
pub const POINT_ID_STRIDE: u64 = 1_000;

pub fn point_id(doc_id: u64, chunk_id: u64) -> u64 {
    doc_id * POINT_ID_STRIDE + chunk_id
}

pub fn split_point_id(id: u64) -> (u64, u64) {
    (id / POINT_ID_STRIDE, id % POINT_ID_STRIDE)
}

/// First document id that cannot collide with any chunk already stored under `max_id`.
pub fn next_doc_id_start(max_id: u64) -> u64 {
    max_id / POINT_ID_STRIDE + 1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Word,
    Pdf,
    Mbox,
    ForumThread,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Word => "word",
            DocType::Pdf => "pdf",
            DocType::Mbox => "mbox",
            DocType::ForumThread => "forum_thread",
        }
    }
}

/// Normalized output of a text extractor, before ids are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedDocument {
    pub doc_type: DocType,
    pub title: String,
    pub source: String,
    pub raw_text: String,
    /// Category tag written to the payload `filter` field.
    pub category: Option<String>,
    pub checksum: String,
}

#[derive(Debug, Clone)]
pub struct Document {
    pub doc_id: u64,
    pub doc_type: DocType,
    pub title: String,
    pub source: String,
    pub raw_text: String,
    pub category: Option<String>,
    pub checksum: String,
    pub chunks: Vec<Chunk>,
}

impl Document {
    pub fn from_extracted(doc_id: u64, extracted: ExtractedDocument) -> Self {
        Self {
            doc_id,
            doc_type: extracted.doc_type,
            title: extracted.title,
            source: extracted.source,
            raw_text: extracted.raw_text,
            category: extracted.category,
            checksum: extracted.checksum,
            chunks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub doc_id: u64,
    pub chunk_id: u64,
    /// Zero-based page index for page-aware chunks.
    pub page: Option<u32>,
    pub body: String,
    /// Empty until the embedding step has run.
    pub embedding: Vec<f32>,
}

impl Chunk {
    pub fn point_id(&self) -> u64 {
        point_id(self.doc_id, self.chunk_id)
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PointPayload {
    pub doc_title: String,
    pub doc_source: String,
    pub raw_text: String,
    pub summary: Option<String>,
    pub filter: Option<String>,
    pub page: Option<u32>,
    pub doc_type: Option<DocType>,
    pub doc_id: Option<u64>,
    pub chunk_id: Option<u64>,
    pub checksum: Option<String>,
    pub ingested_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoint {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

impl StoredPoint {
    /// Rejects points that would be stored with missing fields or a mismatched vector.
    pub fn validate(&self, vector_size: usize) -> Result<(), SearchError> {
        let reason = if self.vector.len() != vector_size {
            Some(format!(
                "vector dimension {} != collection dimension {}",
                self.vector.len(),
                vector_size
            ))
        } else if self.vector.iter().any(|value| !value.is_finite()) {
            Some("vector contains non-finite values".to_string())
        } else if self.payload.doc_title.trim().is_empty() {
            Some("doc_title is empty".to_string())
        } else if self.payload.doc_source.trim().is_empty() {
            Some("doc_source is empty".to_string())
        } else if self.payload.raw_text.trim().is_empty() {
            Some("raw_text is empty".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => Err(SearchError::InvalidPayload {
                id: self.id,
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// A similarity-search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: u64,
    pub score: f64,
    pub payload: PointPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    pub top_k: usize,
    /// Points whose `filter` tag is listed here are never returned.
    pub exclude_categories: Vec<String>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            top_k,
            exclude_categories: Vec::new(),
        }
    }

    pub fn excluding<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_categories = categories.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_size: usize,
    pub chunk_step: usize,
    pub batch_size: usize,
    pub max_chunk_length: usize,
    pub max_title_length: usize,
    pub summarize: bool,
    pub mark_images: bool,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_step: 500,
            batch_size: 200,
            max_chunk_length: 1_000,
            max_title_length: 100,
            summarize: true,
            mark_images: true,
        }
    }
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_follow_stride() {
        assert_eq!(point_id(7, 3), 7_003);
        assert_eq!(split_point_id(7_003), (7, 3));
    }

    #[test]
    fn next_doc_id_skips_whole_stride() {
        assert_eq!(next_doc_id_start(0), 1);
        assert_eq!(next_doc_id_start(1_000), 2);
        assert_eq!(next_doc_id_start(4_999), 5);
    }

    #[test]
    fn payload_omits_absent_optionals() {
        let payload = PointPayload {
            doc_title: "a.pdf".to_string(),
            doc_source: "a.pdf".to_string(),
            raw_text: "body".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&payload).expect("payload serializes");
        assert!(value.get("summary").is_none());
        assert!(value.get("filter").is_none());

        let parsed: PointPayload = serde_json::from_value(serde_json::json!({
            "doc_title": "t",
            "doc_source": "s",
            "raw_text": "r",
            "doc_type": "forum_thread"
        }))
        .expect("payload parses");
        assert_eq!(parsed.doc_type, Some(DocType::ForumThread));
        assert_eq!(parsed.summary, None);
    }

    #[test]
    fn validation_rejects_dimension_mismatch_and_empty_fields() {
        let mut point = StoredPoint {
            id: 1_000,
            vector: vec![0.5; 4],
            payload: PointPayload {
                doc_title: "t".to_string(),
                doc_source: "s".to_string(),
                raw_text: "r".to_string(),
                ..Default::default()
            },
        };
        assert!(point.validate(4).is_ok());
        assert!(point.validate(8).is_err());

        point.payload.raw_text = "  ".to_string();
        assert!(matches!(
            point.validate(4),
            Err(SearchError::InvalidPayload { id: 1_000, .. })
        ));
    }

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_chars("가나다라", 2), "가나");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
