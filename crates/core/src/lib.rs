pub mod answer;
pub mod chunking;
pub mod citations;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod forum;
pub mod ingest;
pub mod llm;
pub mod mailbox;
pub mod models;
pub mod retrieval;
pub mod store;
pub mod stores;
pub mod traits;

pub use answer::{answer, compose_prompt, Answer, ChatTurn, Role};
pub use chunking::{chunk_document, normalize_whitespace, sliding_window, ChunkingConfig};
pub use citations::{collect_references, render_references, Reference};
pub use config::{EmbeddingProvider, Settings};
pub use embeddings::{
    embed_batch, CharacterNgramEmbedder, Embedder, OpenAiEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{IngestError, SearchError};
pub use extractor::{extract_file, LopdfExtractor, PageText, PdfExtractor};
pub use ingest::{discover_files, IngestionReport, Ingestor, SkippedFile};
pub use llm::{ChatClient, Generator, QueryRefiner, RelevanceJudge, Summarizer, TextStream};
pub use models::{
    next_doc_id_start, point_id, split_point_id, Chunk, DocType, Document, ExtractedDocument, IngestionOptions,
    PointPayload, ScoredPoint, SearchQuery, StoredPoint, POINT_ID_STRIDE,
};
pub use retrieval::{RankingStatus, RetrievalOutcome, RetrievalPipeline};
pub use store::{
    allocate_doc_id_start, max_point_id, upsert_with_policy, FailedPoint, RetryPolicy,
    UpsertOutcome,
};
pub use stores::{InMemoryStore, QdrantStore};
pub use traits::{ScrollPage, VectorStore};
