use crate::error::SearchError;
use async_trait::async_trait;
use futures::future::try_join_all;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::time::Duration;

pub type TextStream = BoxStream<'static, Result<String, SearchError>>;

/// What the relevance judge sees for one candidate: enough to decide, small enough to batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestEntry {
    pub title: String,
    pub summary: String,
}

pub type CandidateDigest = BTreeMap<u64, DigestEntry>;

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String, SearchError>;
}

#[async_trait]
pub trait RelevanceJudge: Send + Sync {
    /// Returns the ids judged relevant to `query`, most relevant first.
    async fn judge(&self, query: &str, digest: &CandidateDigest) -> Result<Vec<u64>, SearchError>;
}

/// Rewrites a user question into a self-contained search query.
#[async_trait]
pub trait QueryRefiner: Send + Sync {
    async fn refine(&self, query: &str) -> Result<String, SearchError>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<TextStream, SearchError>;
}

/// Summarizes every text concurrently; output order matches input order.
pub async fn summarize_batch<S>(summarizer: &S, texts: &[String]) -> Result<Vec<String>, SearchError>
where
    S: Summarizer + ?Sized,
{
    try_join_all(texts.iter().map(|text| summarizer.summarize(text))).await
}

const SUMMARY_INSTRUCTIONS: &str = "Summarize the passage in at most three sentences, in the passage's own language. \
Respond with JSON {\"output\": string}.";

const JUDGE_INSTRUCTIONS: &str = "You receive a question and candidate passages keyed by numeric id, each with a \
title and a summary. Return the ids of the passages that help answer the question, most relevant first. \
Omit irrelevant passages. Respond with JSON {\"output\": [id, ...]}.";

const REFINEMENT_INSTRUCTIONS: &str = "Rewrite the user's question as a single clear search query in the \
question's own language. Keep names, dates and numbers. Respond with JSON {\"output\": string}.";

const GENERATION_INSTRUCTIONS: &str = "Answer the user's question using the conversation and the reference passages. \
If the references do not contain the answer, say so.";

/// OpenAI-compatible chat-completions client serving summaries, relevance judgments and
/// streamed generation.
pub struct ChatClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    judge_model: String,
}

impl ChatClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        judge_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SearchError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            judge_model: judge_model.into(),
        })
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let request = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .json(body);
        match &self.api_key {
            Some(api_key) => request.bearer_auth(api_key),
            None => request,
        }
    }

    async fn complete_structured(
        &self,
        model: &str,
        instructions: &str,
        input: &str,
        schema_name: &str,
        output_schema: Value,
    ) -> Result<Value, SearchError> {
        let body = json!({
            "model": model,
            "messages": [
                { "role": "system", "content": instructions },
                { "role": "user", "content": input },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": schema_name,
                    "strict": true,
                    "schema": {
                        "type": "object",
                        "properties": { "output": output_schema },
                        "required": ["output"],
                        "additionalProperties": false,
                    },
                },
            },
        });

        let response = self.request(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let details = response.text().await.unwrap_or_default();
            return Err(SearchError::BackendResponse {
                backend: "llm".to_string(),
                details: format!("{status}: {details}"),
            });
        }

        let parsed: Value = response.json().await?;
        structured_output(&parsed)
    }
}

fn structured_output(response: &Value) -> Result<Value, SearchError> {
    let content = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| SearchError::BackendResponse {
            backend: "llm".to_string(),
            details: "response has no message content".to_string(),
        })?;
    let parsed: Value = serde_json::from_str(content)?;
    parsed
        .get("output")
        .cloned()
        .ok_or_else(|| SearchError::BackendResponse {
            backend: "llm".to_string(),
            details: "structured output is missing `output`".to_string(),
        })
}

fn parse_judged_ids(output: &Value) -> Result<Vec<u64>, SearchError> {
    let items = output
        .as_array()
        .ok_or_else(|| SearchError::Judgment("output is not a list of ids".to_string()))?;
    Ok(items.iter().filter_map(Value::as_u64).collect())
}

#[async_trait]
impl Summarizer for ChatClient {
    async fn summarize(&self, text: &str) -> Result<String, SearchError> {
        let output = self
            .complete_structured(
                &self.model,
                SUMMARY_INSTRUCTIONS,
                text,
                "summary",
                json!({ "type": "string" }),
            )
            .await
            .map_err(|error| SearchError::Summarization(error.to_string()))?;
        output
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SearchError::Summarization("output is not a string".to_string()))
    }
}

#[async_trait]
impl QueryRefiner for ChatClient {
    async fn refine(&self, query: &str) -> Result<String, SearchError> {
        let output = self
            .complete_structured(
                &self.model,
                REFINEMENT_INSTRUCTIONS,
                query,
                "refined_query",
                json!({ "type": "string" }),
            )
            .await
            .map_err(|error| SearchError::Refinement(error.to_string()))?;
        output
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SearchError::Refinement("output is not a string".to_string()))
    }
}

#[async_trait]
impl RelevanceJudge for ChatClient {
    async fn judge(&self, query: &str, digest: &CandidateDigest) -> Result<Vec<u64>, SearchError> {
        let input = serde_json::to_string(&json!({ "question": query, "candidates": digest }))?;
        let output = self
            .complete_structured(
                &self.judge_model,
                JUDGE_INSTRUCTIONS,
                &input,
                "ranked_ids",
                json!({ "type": "array", "items": { "type": "integer" } }),
            )
            .await
            .map_err(|error| SearchError::Judgment(error.to_string()))?;
        parse_judged_ids(&output)
    }
}

#[async_trait]
impl Generator for ChatClient {
    async fn generate(&self, prompt: &str) -> Result<TextStream, SearchError> {
        let body = json!({
            "model": self.model,
            "stream": true,
            "messages": [
                { "role": "system", "content": GENERATION_INSTRUCTIONS },
                { "role": "user", "content": prompt },
            ],
        });

        let response = self
            .request(&body)
            .send()
            .await
            .map_err(|error| SearchError::Generation(error.to_string()))?;
        if !response.status().is_success() {
            return Err(SearchError::Generation(format!(
                "llm returned {}",
                response.status()
            )));
        }

        Ok(sse_deltas(response.bytes_stream()))
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> Result<SseEvent, SearchError> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(SseEvent::Ignore);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let parsed: Value = serde_json::from_str(data)
        .map_err(|error| SearchError::Generation(format!("malformed stream event: {error}")))?;
    Ok(parsed
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|content| !content.is_empty())
        .map(|content| SseEvent::Delta(content.to_string()))
        .unwrap_or(SseEvent::Ignore))
}

struct SseState<S> {
    inner: Pin<Box<S>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, SearchError>>,
    done: bool,
}

impl<S> SseState<S> {
    fn drain_lines(&mut self, flush: bool) {
        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=position).collect();
            self.push_line(&String::from_utf8_lossy(&line));
            if self.done {
                return;
            }
        }
        if flush && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.push_line(&String::from_utf8_lossy(&rest));
        }
    }

    fn push_line(&mut self, line: &str) {
        match parse_sse_line(line) {
            Ok(SseEvent::Delta(text)) => self.pending.push_back(Ok(text)),
            Ok(SseEvent::Done) => self.done = true,
            Ok(SseEvent::Ignore) => {}
            Err(error) => {
                self.pending.push_back(Err(error));
                self.done = true;
            }
        }
    }
}

/// Turns a server-sent-events byte stream into content deltas, ending at `[DONE]`.
fn sse_deltas<S, B>(bytes: S) -> TextStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = SseState {
        inner: Box::pin(bytes),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(chunk.as_ref());
                    state.drain_lines(false);
                }
                Some(Err(error)) => {
                    state.done = true;
                    return Some((Err(SearchError::Generation(error.to_string())), state));
                }
                None => {
                    state.drain_lines(true);
                    state.done = true;
                }
            }
        }
    })
    .boxed()
}
