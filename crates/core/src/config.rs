use crate::embeddings::{
    DEFAULT_EMBEDDING_DIMENSIONS, OPENAI_EMBEDDING_DIMENSIONS, OPENAI_EMBEDDING_MODEL,
};
use crate::store::RetryPolicy;
use crate::{ChunkingConfig, IngestError, IngestionOptions};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    #[serde(default)]
    pub ingest: IngestSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default)]
    pub citations: CitationSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Falls back to the embedding dimensionality when unset.
    #[serde(default)]
    pub vector_size: Option<usize>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            api_key: None,
            collection: default_collection(),
            vector_size: None,
        }
    }
}

fn default_store_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_collection() -> String {
    "docrank".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Openai,
    /// Offline character-trigram hashing.
    Ngram,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingSettings {
    #[serde(default = "default_provider")]
    pub provider: EmbeddingProvider,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_api_url")]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            dims: None,
            url: default_api_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl EmbeddingSettings {
    pub fn dimensions(&self) -> usize {
        self.dims.unwrap_or(match self.provider {
            EmbeddingProvider::Openai => OPENAI_EMBEDDING_DIMENSIONS,
            EmbeddingProvider::Ngram => DEFAULT_EMBEDDING_DIMENSIONS,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_provider() -> EmbeddingProvider {
    EmbeddingProvider::Openai
}
fn default_embedding_model() -> String {
    OPENAI_EMBEDDING_MODEL.to_string()
}
fn default_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmSettings {
    #[serde(default = "default_api_url")]
    pub url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_judge_model")]
    pub judge_model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            model: default_llm_model(),
            judge_model: default_judge_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl LlmSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_judge_model() -> String {
    "gpt-4o".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_step")]
    pub chunk_step: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_step: default_chunk_step(),
        }
    }
}

fn default_chunk_size() -> usize {
    1_000
}
fn default_chunk_step() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_chunk_length")]
    pub max_chunk_length: usize,
    #[serde(default = "default_max_title_length")]
    pub max_title_length: usize,
    #[serde(default = "default_true")]
    pub summarize: bool,
    #[serde(default = "default_true")]
    pub mark_images: bool,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_chunk_length: default_max_chunk_length(),
            max_title_length: default_max_title_length(),
            summarize: true,
            mark_images: true,
        }
    }
}

fn default_batch_size() -> usize {
    200
}
fn default_max_chunk_length() -> usize {
    1_000
}
fn default_max_title_length() -> usize {
    100
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_sub_batch_size")]
    pub sub_batch_size: usize,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            sub_batch_size: default_sub_batch_size(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    8_000
}
fn default_sub_batch_size() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalSettings {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub excluded_categories: Vec<String>,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            excluded_categories: Vec::new(),
        }
    }
}

fn default_top_k() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CitationSettings {
    /// Document title to citation source, applied to references whose source is not a URL.
    #[serde(default)]
    pub source_overrides: HashMap<String, String>,
}

impl Settings {
    /// Reads settings from `path`, or returns the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, IngestError> {
        let settings = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|error| {
                    IngestError::Config(format!("failed to read {}: {error}", path.display()))
                })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, IngestError> {
        toml::from_str(content).map_err(|error| IngestError::Config(error.to_string()))
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        self.chunking_config()
            .validate()
            .map_err(|error| IngestError::Config(error.to_string()))?;

        if self.ingest.batch_size == 0 {
            return Err(IngestError::Config("ingest.batch_size must be > 0".to_string()));
        }
        if self.ingest.max_chunk_length == 0 || self.ingest.max_title_length == 0 {
            return Err(IngestError::Config(
                "ingest.max_chunk_length and ingest.max_title_length must be > 0".to_string(),
            ));
        }
        if self.retry.sub_batch_size == 0 {
            return Err(IngestError::Config("retry.sub_batch_size must be > 0".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(IngestError::Config("retry.max_attempts must be > 0".to_string()));
        }
        if self.retrieval.top_k == 0 {
            return Err(IngestError::Config("retrieval.top_k must be > 0".to_string()));
        }
        if self.vector_size() != self.embedding.dimensions() {
            return Err(IngestError::Config(format!(
                "store.vector_size {} does not match embedding dimensions {}",
                self.vector_size(),
                self.embedding.dimensions()
            )));
        }
        Ok(())
    }

    pub fn vector_size(&self) -> usize {
        self.store
            .vector_size
            .unwrap_or_else(|| self.embedding.dimensions())
    }

    pub fn chunking_config(&self) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size: self.chunking.chunk_size,
            chunk_step: self.chunking.chunk_step,
        }
    }

    pub fn ingestion_options(&self) -> IngestionOptions {
        IngestionOptions {
            chunk_size: self.chunking.chunk_size,
            chunk_step: self.chunking.chunk_step,
            batch_size: self.ingest.batch_size,
            max_chunk_length: self.ingest.max_chunk_length,
            max_title_length: self.ingest.max_title_length,
            summarize: self.ingest.summarize,
            mark_images: self.ingest.mark_images,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            sub_batch_size: self.retry.sub_batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_production_constants() -> Result<(), IngestError> {
        let settings = Settings::load(None)?;
        assert_eq!(settings.vector_size(), 3_072);
        assert_eq!(settings.ingestion_options().batch_size, 200);
        assert_eq!(settings.chunking_config(), ChunkingConfig::default());
        assert_eq!(settings.retry_policy(), RetryPolicy::default());
        assert_eq!(settings.retrieval.top_k, 20);
        Ok(())
    }

    #[test]
    fn partial_file_keeps_other_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("docrank.toml");
        fs::write(
            &path,
            r#"
[store]
collection = "campus-prod"

[embedding]
provider = "ngram"

[chunking]
chunk_size = 800
chunk_step = 400

[retrieval]
excluded_categories = ["forum"]

[citations.source_overrides]
"rules.docx" = "https://example.edu/rules"
"#,
        )?;

        let settings = Settings::load(Some(&path))?;
        assert_eq!(settings.store.collection, "campus-prod");
        assert_eq!(settings.store.url, "http://localhost:6333");
        assert_eq!(settings.vector_size(), DEFAULT_EMBEDDING_DIMENSIONS);
        assert_eq!(settings.ingestion_options().chunk_step, 400);
        assert_eq!(settings.ingestion_options().max_chunk_length, 1_000);
        assert_eq!(settings.retrieval.excluded_categories, vec!["forum"]);
        assert_eq!(
            settings.citations.source_overrides.get("rules.docx").map(String::as_str),
            Some("https://example.edu/rules")
        );
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() {
        let step_too_large = Settings::from_toml_str("[chunking]\nchunk_size = 100\nchunk_step = 200\n")
            .and_then(|settings| settings.validate());
        assert!(matches!(step_too_large, Err(IngestError::Config(_))));

        let zero_batch = Settings::from_toml_str("[ingest]\nbatch_size = 0\n")
            .and_then(|settings| settings.validate());
        assert!(zero_batch.is_err());

        let mismatched = Settings::from_toml_str("[store]\nvector_size = 64\n")
            .and_then(|settings| settings.validate());
        assert!(mismatched.is_err());

        let unknown_provider = Settings::from_toml_str("[embedding]\nprovider = \"bert\"\n");
        assert!(unknown_provider.is_err());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = Settings::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(matches!(result, Err(IngestError::Config(_))));
    }
}
