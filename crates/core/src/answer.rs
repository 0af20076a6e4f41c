use crate::citations::Reference;
use crate::llm::{Generator, TextStream};
use crate::retrieval::RetrievalOutcome;
use crate::{ScoredPoint, SearchError};
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt::Write as _;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Generated text, streamed, plus the references to show once it has been drained.
pub struct Answer {
    pub text: TextStream,
    pub references: Vec<Reference>,
}

impl Answer {
    /// Drains the stream into one string.
    pub async fn collect_text(&mut self) -> Result<String, SearchError> {
        let mut full = String::new();
        while let Some(fragment) = self.text.next().await {
            full.push_str(&fragment?);
        }
        Ok(full)
    }
}

pub fn compose_prompt(history: &[ChatTurn], context: &[ScoredPoint], query: &str) -> String {
    let mut history_text = String::new();
    for turn in history {
        let speaker = match turn.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        let _ = writeln!(history_text, "{speaker}: {}", turn.content);
    }

    let context_text = context
        .iter()
        .map(|point| point.payload.raw_text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Previous conversation:\n{history_text}\n\
Reference passages:\n{context_text}\n\n\
Question: {query}\n\n\
Answer using the conversation and the passages above.\nAnswer:\n"
    )
}

/// Starts generation over the ranked context. Generation errors are returned as-is and
/// never retried.
pub async fn answer<G>(
    generator: &G,
    history: &[ChatTurn],
    outcome: &RetrievalOutcome,
    overrides: &HashMap<String, String>,
) -> Result<Answer, SearchError>
where
    G: Generator + ?Sized,
{
    let prompt = compose_prompt(history, &outcome.ranked, &outcome.query);
    info!(
        query = %outcome.query,
        context_chunks = outcome.ranked.len(),
        status = ?outcome.status,
        "generating answer"
    );

    let text = generator.generate(&prompt).await?;
    Ok(Answer {
        text,
        references: outcome.references(overrides),
    })
}
