use crate::{ScoredPoint, SearchError, SearchQuery, StoredPoint};
use async_trait::async_trait;

/// One page of a cursor-based id scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScrollPage {
    pub ids: Vec<u64>,
    /// Offset to pass to the next call; `None` once the collection is exhausted.
    pub next_offset: Option<u64>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    fn vector_size(&self) -> usize;

    /// Drops the collection if present and creates it empty with cosine distance.
    async fn recreate_collection(&self) -> Result<(), SearchError>;

    /// Creates the collection when it does not exist yet.
    async fn ensure_collection(&self) -> Result<(), SearchError>;

    async fn scroll_ids(&self, offset: Option<u64>, limit: usize) -> Result<ScrollPage, SearchError>;

    /// Writes all points or none of them.
    async fn upsert(&self, points: &[StoredPoint]) -> Result<(), SearchError>;

    async fn search(
        &self,
        query_vector: &[f32],
        query: &SearchQuery,
    ) -> Result<Vec<ScoredPoint>, SearchError>;
}
