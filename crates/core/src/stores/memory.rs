//! In-memory [`VectorStore`] for tests and offline runs.
//!
//! Points live in a `BTreeMap` behind a `RwLock`; search is brute-force cosine similarity.

use crate::traits::{ScrollPage, VectorStore};
use crate::{ScoredPoint, SearchError, SearchQuery, StoredPoint};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

pub struct InMemoryStore {
    vector_size: usize,
    points: RwLock<BTreeMap<u64, StoredPoint>>,
}

impl InMemoryStore {
    pub fn new(vector_size: usize) -> Self {
        Self {
            vector_size,
            points: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.points
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: u64) -> Option<StoredPoint> {
        self.points
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let norm_a: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a < f64::EPSILON || norm_b < f64::EPSILON {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    fn vector_size(&self) -> usize {
        self.vector_size
    }

    async fn recreate_collection(&self) -> Result<(), SearchError> {
        self.points
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    async fn ensure_collection(&self) -> Result<(), SearchError> {
        Ok(())
    }

    async fn scroll_ids(&self, offset: Option<u64>, limit: usize) -> Result<ScrollPage, SearchError> {
        let points = self.points.read().unwrap_or_else(PoisonError::into_inner);
        let mut remaining = points.range(offset.unwrap_or(0)..).map(|(id, _)| *id);
        let ids: Vec<u64> = remaining.by_ref().take(limit.max(1)).collect();
        Ok(ScrollPage {
            ids,
            next_offset: remaining.next(),
        })
    }

    async fn upsert(&self, points: &[StoredPoint]) -> Result<(), SearchError> {
        for point in points {
            point.validate(self.vector_size)?;
        }
        let mut stored = self.points.write().unwrap_or_else(PoisonError::into_inner);
        for point in points {
            stored.insert(point.id, point.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        query_vector: &[f32],
        query: &SearchQuery,
    ) -> Result<Vec<ScoredPoint>, SearchError> {
        if query_vector.len() != self.vector_size {
            return Err(SearchError::Request(format!(
                "query vector dim {} is not {}",
                query_vector.len(),
                self.vector_size
            )));
        }

        let points = self.points.read().unwrap_or_else(PoisonError::into_inner);
        let mut hits: Vec<ScoredPoint> = points
            .values()
            .filter(|point| {
                point
                    .payload
                    .filter
                    .as_ref()
                    .map_or(true, |tag| !query.exclude_categories.contains(tag))
            })
            .map(|point| ScoredPoint {
                id: point.id,
                score: cosine_similarity(query_vector, &point.vector),
                payload: point.payload.clone(),
            })
            .collect();

        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then(left.id.cmp(&right.id))
        });
        hits.truncate(query.top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{CharacterNgramEmbedder, Embedder};
    use crate::PointPayload;

    fn payload(title: &str, filter: Option<&str>) -> PointPayload {
        PointPayload {
            doc_title: title.to_string(),
            doc_source: format!("{title}.pdf"),
            raw_text: title.to_string(),
            filter: filter.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn exact_vector_is_its_own_nearest_neighbour() -> Result<(), SearchError> {
        let embedder = CharacterNgramEmbedder::default();
        let store = InMemoryStore::new(embedder.dimensions());
        let bodies = [
            "Tuition payments are due in the first week of the semester.",
            "The shuttle bus leaves the main gate every twenty minutes.",
            "Dormitory check-in requires a student ID card.",
        ];
        let mut points = Vec::new();
        for (index, body) in bodies.iter().enumerate() {
            points.push(StoredPoint {
                id: 1_000 + index as u64,
                vector: embedder.embed(body).await?,
                payload: payload(body, None),
            });
        }
        store.upsert(&points).await?;

        for point in &points {
            let hits = store.search(&point.vector, &SearchQuery::new("", 1)).await?;
            assert_eq!(hits[0].id, point.id);
            assert!((hits[0].score - 1.0).abs() < 1e-6);
        }
        Ok(())
    }

    #[tokio::test]
    async fn excluded_categories_never_surface() -> Result<(), SearchError> {
        let store = InMemoryStore::new(2);
        store
            .upsert(&[
                StoredPoint {
                    id: 1,
                    vector: vec![1.0, 0.0],
                    payload: payload("forum", Some("forum")),
                },
                StoredPoint {
                    id: 2,
                    vector: vec![0.0, 1.0],
                    payload: payload("handbook", None),
                },
            ])
            .await?;

        let query = SearchQuery::new("q", 5).excluding(["forum"]);
        let hits = store.search(&[1.0, 0.0], &query).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 2);
        Ok(())
    }

    #[tokio::test]
    async fn scroll_returns_next_offset_until_exhausted() -> Result<(), SearchError> {
        let store = InMemoryStore::new(1);
        let points: Vec<StoredPoint> = (1..=5)
            .map(|id| StoredPoint {
                id,
                vector: vec![1.0],
                payload: payload("t", None),
            })
            .collect();
        store.upsert(&points).await?;

        let first = store.scroll_ids(None, 2).await?;
        assert_eq!(first.ids, vec![1, 2]);
        assert_eq!(first.next_offset, Some(3));
        let last = store.scroll_ids(Some(5), 2).await?;
        assert_eq!(last.ids, vec![5]);
        assert_eq!(last.next_offset, None);
        Ok(())
    }
}
