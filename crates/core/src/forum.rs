use crate::error::IngestError;
use crate::extractor::{file_name, sha256_hex};
use crate::models::{DocType, ExtractedDocument};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use tracing::warn;

pub const FORUM_CATEGORY: &str = "forum";
const TOP_LEVEL_PARENT: &str = "0";

#[derive(Debug, Clone, Deserialize)]
pub struct ForumThread {
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub comments: Vec<ForumComment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForumComment {
    #[serde(deserialize_with = "id_as_string")]
    pub comment_id: String,
    #[serde(deserialize_with = "id_as_string")]
    pub parent_id: String,
    pub text: String,
}

fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    })
}

impl ForumThread {
    /// Title, content, then comments as `N. text` with replies as `N-M. text`.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        let mut number = 1;
        for comment in self.comments.iter().filter(|c| c.parent_id == TOP_LEVEL_PARENT) {
            lines.push(format!("{number}. {}", comment.text));
            let replies = self
                .comments
                .iter()
                .filter(|reply| reply.parent_id == comment.comment_id);
            for (index, reply) in replies.enumerate() {
                lines.push(format!("{number}-{}. {}", index + 1, reply.text));
            }
            number += 1;
        }

        format!("{}\n{}\n{}", self.title, self.content, lines.join("\n"))
    }
}

/// Reads a JSON-lines forum dump. Lines that fail to parse are logged and skipped.
pub fn extract_forum_threads(path: &Path) -> Result<Vec<ExtractedDocument>, IngestError> {
    let name = file_name(path)?;
    let content = std::fs::read_to_string(path)?;

    let mut documents = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let thread: ForumThread = match serde_json::from_str(line) {
            Ok(thread) => thread,
            Err(error) => {
                warn!(file = %name, line = line_no + 1, %error, "skipping malformed forum thread");
                continue;
            }
        };

        let source = if thread.url.trim().is_empty() {
            name.clone()
        } else {
            thread.url.trim().to_string()
        };
        documents.push(ExtractedDocument {
            doc_type: DocType::ForumThread,
            title: thread.title.clone(),
            source,
            raw_text: thread.render(),
            category: Some(FORUM_CATEGORY.to_string()),
            checksum: sha256_hex(line.as_bytes()),
        });
    }

    if documents.is_empty() {
        return Err(IngestError::ForumParse(format!(
            "no readable threads in {}",
            path.display()
        )));
    }

    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const THREAD: &str = r#"{"title":"Shuttle bus","url":"https://forum.example.edu/t/1","content":"When does it run?","comments":[{"comment_id":"11","parent_id":"0","text":"Every 20 min"},{"comment_id":"12","parent_id":"11","text":"Not on weekends"},{"comment_id":13,"parent_id":0,"text":"Check the app"}]}"#;

    #[test]
    fn thread_renders_nested_comment_numbers() {
        let thread: ForumThread = serde_json::from_str(THREAD).expect("thread parses");
        assert_eq!(
            thread.render(),
            "Shuttle bus\nWhen does it run?\n1. Every 20 min\n1-1. Not on weekends\n2. Check the app"
        );
    }

    #[test]
    fn malformed_lines_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("free.jsonl");
        std::fs::write(&path, format!("{THREAD}\nnot json\n\n"))?;

        let documents = extract_forum_threads(&path)?;
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].source, "https://forum.example.edu/t/1");
        assert_eq!(documents[0].category.as_deref(), Some(FORUM_CATEGORY));
        assert_eq!(documents[0].doc_type, DocType::ForumThread);
        Ok(())
    }

    #[test]
    fn file_without_threads_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("empty.jsonl");
        std::fs::write(&path, "garbage\n")?;
        assert!(matches!(
            extract_forum_threads(&path),
            Err(IngestError::ForumParse(_))
        ));
        Ok(())
    }
}
