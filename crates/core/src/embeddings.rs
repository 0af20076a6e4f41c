use crate::error::SearchError;
use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;
pub const OPENAI_EMBEDDING_DIMENSIONS: usize = 3_072;
pub const OPENAI_EMBEDDING_MODEL: &str = "text-embedding-3-large";

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError>;
}

#[async_trait]
impl<E> Embedder for Box<E>
where
    E: Embedder + ?Sized,
{
    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        (**self).embed(text).await
    }
}

/// Embeds every text with its own concurrent request and returns vectors in input order.
///
/// A single failed request fails the whole batch; no partial result is returned.
pub async fn embed_batch<E>(embedder: &E, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError>
where
    E: Embedder + ?Sized,
{
    let vectors = try_join_all(texts.iter().map(|text| embedder.embed(text))).await?;

    if let Some(bad) = vectors
        .iter()
        .find(|vector| vector.len() != embedder.dimensions())
    {
        return Err(SearchError::Embedding(format!(
            "embedding dimension {} != {}",
            bad.len(),
            embedder.dimensions()
        )));
    }

    Ok(vectors)
}

/// Deterministic, offline embedder hashing character trigrams into buckets.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        Ok(self.vector(text))
    }
}

/// Client for an OpenAI-compatible `POST {endpoint}/embeddings` API.
///
/// Rate limits (429) and server errors are retried with exponential backoff
/// (1s, 2s, 4s, ... capped at 32s); other client errors fail immediately.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, SearchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            dimensions,
            max_retries: 3,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        let body = json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dimensions,
        });

        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, delay_secs = delay.as_secs(), "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(format!("{}/embeddings", self.endpoint))
                .json(&body);
            if let Some(api_key) = &self.api_key {
                request = request.bearer_auth(api_key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: Value = response.json().await?;
                        return parse_embedding_response(&parsed, self.dimensions);
                    }

                    let details = response.text().await.unwrap_or_default();
                    let error = SearchError::BackendResponse {
                        backend: "embeddings".to_string(),
                        details: format!("{status}: {details}"),
                    };
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        last_error = Some(error);
                        continue;
                    }
                    return Err(error);
                }
                Err(error) => last_error = Some(SearchError::Http(error)),
            }
        }

        Err(last_error
            .unwrap_or_else(|| SearchError::Embedding("embedding failed after retries".to_string())))
    }
}

fn parse_embedding_response(parsed: &Value, dimensions: usize) -> Result<Vec<f32>, SearchError> {
    let values = parsed
        .pointer("/data/0/embedding")
        .and_then(Value::as_array)
        .ok_or_else(|| SearchError::Embedding("response has no data[0].embedding".to_string()))?;

    let vector = values
        .iter()
        .map(|value| value.as_f64().map(|number| number as f32))
        .collect::<Option<Vec<f32>>>()
        .ok_or_else(|| SearchError::Embedding("embedding contains non-numeric values".to_string()))?;

    if vector.len() != dimensions {
        return Err(SearchError::Embedding(format!(
            "embedding dimension {} != {}",
            vector.len(),
            dimensions
        )));
    }

    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.vector("Dormitory check-in opens on March 2.");
        let second = embedder.vector("Dormitory check-in opens on March 2.");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.vector("abc");
        assert_eq!(vector.len(), 32);
    }

    struct SlowFirstEmbedder;

    #[async_trait]
    impl Embedder for SlowFirstEmbedder {
        fn dimensions(&self) -> usize {
            1
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
            let value: f32 = text.parse().map_err(|_| SearchError::Embedding(text.to_string()))?;
            tokio::time::sleep(Duration::from_millis((10.0 - value) as u64)).await;
            Ok(vec![value])
        }
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let texts: Vec<String> = (0..8).map(|n| n.to_string()).collect();
        let vectors = embed_batch(&SlowFirstEmbedder, &texts)
            .await
            .expect("batch should succeed");
        let values: Vec<f32> = vectors.into_iter().map(|vector| vector[0]).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[tokio::test]
    async fn one_failure_fails_the_batch() {
        let texts = vec!["1".to_string(), "oops".to_string(), "2".to_string()];
        let result = embed_batch(&SlowFirstEmbedder, &texts).await;
        assert!(matches!(result, Err(SearchError::Embedding(_))));
    }

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn dimensions(&self) -> usize {
            2
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1.0])
        }
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        let embedder = CountingEmbedder {
            calls: AtomicUsize::new(0),
        };
        let result = embed_batch(&embedder, &["a".to_string(), "b".to_string()]).await;
        assert!(result.is_err());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn response_parsing_checks_dimensions() {
        let parsed = json!({ "data": [{ "embedding": [0.1, 0.2] }] });
        assert_eq!(
            parse_embedding_response(&parsed, 2).expect("parses"),
            vec![0.1f32, 0.2f32]
        );
        assert!(parse_embedding_response(&parsed, 3).is_err());
        assert!(parse_embedding_response(&json!({}), 2).is_err());
    }
}
