use crate::chunking::{chunk_document, ChunkingConfig};
use crate::embeddings::{embed_batch, Embedder};
use crate::extractor::{detect_doc_type, extract_file};
use crate::llm::{summarize_batch, Summarizer};
use crate::models::{truncate_chars, Chunk, Document, PointPayload, StoredPoint};
use crate::store::{allocate_doc_id_start, upsert_with_policy, FailedPoint, RetryPolicy};
use crate::traits::VectorStore;
use crate::{IngestError, IngestionOptions};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Supported files under `folder`, recursively, in sorted order.
pub fn discover_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        if detect_doc_type(entry.path()).is_some() {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct IngestionReport {
    pub run_id: Uuid,
    pub documents: usize,
    pub chunks_written: usize,
    pub skipped_files: Vec<SkippedFile>,
    /// Points that never reached the store, with enough detail to re-ingest them by hand.
    pub failed_points: Vec<FailedPoint>,
    pub next_doc_id_start: u64,
}

/// One ingestion pass: extract, chunk, embed, summarize and upsert in sequential batches.
pub struct Ingestor<'a> {
    store: &'a dyn VectorStore,
    embedder: &'a dyn Embedder,
    summarizer: Option<&'a dyn Summarizer>,
    options: IngestionOptions,
    retry: RetryPolicy,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        store: &'a dyn VectorStore,
        embedder: &'a dyn Embedder,
        options: IngestionOptions,
    ) -> Self {
        Self {
            store,
            embedder,
            summarizer: None,
            options,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_summarizer(mut self, summarizer: &'a dyn Summarizer) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn run(&self, folder: &Path, recreate: bool) -> Result<IngestionReport, IngestError> {
        let config = ChunkingConfig::from(&self.options);
        config.validate()?;
        if self.options.batch_size == 0 {
            return Err(IngestError::InvalidArgument(
                "batch_size must be > 0".to_string(),
            ));
        }

        let files = discover_files(folder);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no supported files found in {}",
                folder.display()
            )));
        }

        let run_id = Uuid::new_v4();
        info!(%run_id, folder = %folder.display(), files = files.len(), recreate, "ingestion started");

        if recreate {
            self.store.recreate_collection().await?;
        } else {
            self.store.ensure_collection().await?;
        }

        let doc_id_start = allocate_doc_id_start(self.store).await?;
        info!(%run_id, doc_id_start, "allocated document ids");

        let mut skipped_files = Vec::new();
        let documents = self.load_documents(&files, doc_id_start, config, &mut skipped_files);
        for skipped in &skipped_files {
            warn!(%run_id, path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
        }

        let pairs: Vec<(&Document, &Chunk)> = documents
            .iter()
            .flat_map(|document| document.chunks.iter().map(move |chunk| (document, chunk)))
            .collect();

        let ingested_at = Utc::now();
        let mut chunks_written = 0;
        let mut failed_points = Vec::new();

        for (batch_index, batch) in pairs.chunks(self.options.batch_size).enumerate() {
            match self.process_batch(batch, ingested_at).await {
                Ok(points) => {
                    let outcome = upsert_with_policy(self.store, &points, &self.retry).await;
                    chunks_written += outcome.written();
                    failed_points.extend_from_slice(outcome.failed());
                    info!(
                        %run_id,
                        batch = batch_index,
                        written = outcome.written(),
                        failed = outcome.failed().len(),
                        "batch stored"
                    );
                }
                Err(error) => {
                    let cause = error.to_string();
                    warn!(%run_id, batch = batch_index, error = %cause, "batch abandoned after retries");
                    failed_points.extend(batch.iter().map(|(document, chunk)| FailedPoint {
                        id: chunk.point_id(),
                        source: document.source.clone(),
                        cause: cause.clone(),
                    }));
                }
            }
        }

        info!(
            %run_id,
            documents = documents.len(),
            chunks_written,
            failed = failed_points.len(),
            skipped = skipped_files.len(),
            "ingestion finished"
        );

        Ok(IngestionReport {
            run_id,
            documents: documents.len(),
            chunks_written,
            skipped_files,
            failed_points,
            next_doc_id_start: doc_id_start,
        })
    }

    /// Extracts and chunks every file. Ids are handed out densely to documents that chunk
    /// successfully, in file order.
    fn load_documents(
        &self,
        files: &[PathBuf],
        doc_id_start: u64,
        config: ChunkingConfig,
        skipped: &mut Vec<SkippedFile>,
    ) -> Vec<Document> {
        let mut documents = Vec::new();
        let mut next_doc_id = doc_id_start;

        for path in files {
            let extracted = match extract_file(path, &self.options) {
                Ok(extracted) => extracted,
                Err(error) => {
                    skipped.push(SkippedFile {
                        path: path.clone(),
                        reason: error.to_string(),
                    });
                    continue;
                }
            };

            for item in extracted {
                let mut document = Document::from_extracted(next_doc_id, item);
                match chunk_document(&document, config) {
                    Ok(chunks) if chunks.is_empty() => skipped.push(SkippedFile {
                        path: path.clone(),
                        reason: format!("{} has no text", document.title),
                    }),
                    Ok(chunks) => {
                        document.chunks = chunks;
                        next_doc_id += 1;
                        documents.push(document);
                    }
                    Err(error) => skipped.push(SkippedFile {
                        path: path.clone(),
                        reason: error.to_string(),
                    }),
                }
            }
        }

        documents
    }

    async fn process_batch(
        &self,
        batch: &[(&Document, &Chunk)],
        ingested_at: DateTime<Utc>,
    ) -> Result<Vec<StoredPoint>, IngestError> {
        let texts: Vec<String> = batch.iter().map(|(_, chunk)| chunk.body.clone()).collect();
        let texts = &texts;
        let embedder = self.embedder;

        let embed = self
            .retry
            .retry("embed", move || embed_batch(embedder, texts));
        let summarize = async {
            match self.summarizer.filter(|_| self.options.summarize) {
                Some(summarizer) => self
                    .retry
                    .retry("summarize", move || summarize_batch(summarizer, texts))
                    .await
                    .map(Some),
                None => Ok(None),
            }
        };
        let (vectors, summaries) = tokio::try_join!(embed, summarize)?;

        Ok(batch
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(index, ((document, chunk), vector))| StoredPoint {
                id: chunk.point_id(),
                vector,
                payload: PointPayload {
                    doc_title: truncate_chars(&document.title, self.options.max_title_length),
                    doc_source: document.source.clone(),
                    raw_text: truncate_chars(&chunk.body, self.options.max_chunk_length),
                    summary: summaries
                        .as_ref()
                        .and_then(|summaries| summaries.get(index).cloned()),
                    filter: document.category.clone(),
                    page: chunk.page,
                    doc_type: Some(document.doc_type),
                    doc_id: Some(chunk.doc_id),
                    chunk_id: Some(chunk.chunk_id),
                    checksum: Some(document.checksum.clone()),
                    ingested_at: Some(ingested_at),
                },
            })
            .collect())
    }
}
