//! Reference lists shown under an answer.
//!
//! A reference is the `(title, source, page)` triple of a ranked chunk. Non-URL sources can be
//! replaced through a title keyed override map before deduplication, so two chunks that resolve
//! to the same triple render as one line.

use crate::extractor::is_url;
use crate::models::truncate_chars;
use crate::ScoredPoint;
use std::collections::{HashMap, HashSet};

pub const MAX_PLAIN_SOURCE_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub title: String,
    pub source: String,
    /// Zero-based page index, as stored.
    pub page: Option<u32>,
}

/// Deduplicated references in first-seen order.
pub fn collect_references(points: &[ScoredPoint], overrides: &HashMap<String, String>) -> Vec<Reference> {
    let mut seen = HashSet::new();
    let mut references = Vec::new();

    for point in points {
        let payload = &point.payload;
        let source = if is_url(&payload.doc_source) {
            payload.doc_source.clone()
        } else {
            overrides
                .get(&payload.doc_title)
                .cloned()
                .unwrap_or_else(|| payload.doc_source.clone())
        };

        let reference = Reference {
            title: payload.doc_title.clone(),
            source,
            page: payload.page,
        };
        if seen.insert(reference.clone()) {
            references.push(reference);
        }
    }

    references
}

pub fn render_reference(reference: &Reference) -> String {
    let mut line = format!("- **{}**", reference.title);
    if let Some(page) = reference.page {
        line.push_str(&format!(" (p.{})", page + 1));
    }

    if is_url(&reference.source) {
        line.push_str(&format!(" / [open link]({})", reference.source));
    } else if reference.source.chars().count() > MAX_PLAIN_SOURCE_CHARS {
        line.push_str(&format!(
            " / {}...",
            truncate_chars(&reference.source, MAX_PLAIN_SOURCE_CHARS)
        ));
    } else {
        line.push_str(&format!(" / {}", reference.source));
    }
    line
}

pub fn render_references(references: &[Reference]) -> Vec<String> {
    references.iter().map(render_reference).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PointPayload;

    fn hit(id: u64, title: &str, source: &str, page: Option<u32>) -> ScoredPoint {
        ScoredPoint {
            id,
            score: 0.5,
            payload: PointPayload {
                doc_title: title.to_string(),
                doc_source: source.to_string(),
                raw_text: "body".to_string(),
                page,
                ..Default::default()
            },
        }
    }

    #[test]
    fn identical_triples_produce_one_line() {
        let hits = vec![
            hit(1_000, "handbook.pdf", "handbook.pdf", Some(2)),
            hit(1_001, "handbook.pdf", "handbook.pdf", Some(2)),
            hit(1_002, "handbook.pdf", "handbook.pdf", Some(3)),
            hit(2_000, "notice", "https://example.edu/n/1", None),
            hit(1_003, "handbook.pdf", "handbook.pdf", Some(2)),
        ];

        let lines = render_references(&collect_references(&hits, &HashMap::new()));
        assert_eq!(
            lines,
            vec![
                "- **handbook.pdf** (p.3) / handbook.pdf",
                "- **handbook.pdf** (p.4) / handbook.pdf",
                "- **notice** / [open link](https://example.edu/n/1)",
            ]
        );
    }

    #[test]
    fn overrides_replace_plain_sources_before_dedup() {
        let overrides = HashMap::from([(
            "rules.docx".to_string(),
            "https://example.edu/rules".to_string(),
        )]);
        let hits = vec![
            hit(1, "rules.docx", "rules.docx", None),
            hit(2, "rules.docx", "https://example.edu/rules", None),
            hit(3, "other.docx", "https://example.edu/other", None),
        ];

        let references = collect_references(&hits, &overrides);
        assert_eq!(references.len(), 2);
        assert_eq!(references[0].source, "https://example.edu/rules");
    }

    #[test]
    fn long_plain_sources_are_truncated() {
        let reference = Reference {
            title: "archive".to_string(),
            source: "s".repeat(200),
            page: None,
        };
        let line = render_reference(&reference);
        assert!(line.ends_with("..."));
        assert_eq!(line, format!("- **archive** / {}...", "s".repeat(120)));
    }
}
