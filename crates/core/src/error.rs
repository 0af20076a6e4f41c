use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("docx parse error: {0}")]
    DocxParse(String),

    #[error("mailbox parse error: {0}")]
    MailboxParse(String),

    #[error("forum thread parse error: {0}")]
    ForumParse(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("unsupported file type: {0}")]
    UnsupportedFile(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("document {title} produced {chunks} chunks; at most {limit} fit the point id scheme")]
    ChunkOverflow {
        title: String,
        chunks: usize,
        limit: u64,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Search(#[from] SearchError),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("store not available yet: {0}")]
    NotReady(String),

    #[error("invalid point {id}: {reason}")]
    InvalidPayload { id: u64, reason: String },

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("summarization failed: {0}")]
    Summarization(String),

    #[error("query refinement failed: {0}")]
    Refinement(String),

    #[error("relevance judgment failed: {0}")]
    Judgment(String),

    #[error("generation failed: {0}")]
    Generation(String),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
