use crate::models::{next_doc_id_start, StoredPoint};
use crate::traits::VectorStore;
use crate::SearchError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

pub const SCROLL_PAGE_SIZE: usize = 1_000;

/// Retry and degradation rules applied uniformly to network calls that may be repeated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Points per resubmission once a bulk upsert has failed.
    pub sub_batch_size: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            sub_batch_size: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling and capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub async fn retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, SearchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SearchError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < attempts => {
                    let delay = self.backoff(attempt);
                    debug!(operation, attempt, ?delay, %error, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPoint {
    pub id: u64,
    pub source: String,
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Success { written: usize },
    Partial { written: usize, failed: Vec<FailedPoint> },
    Failure { cause: String, failed: Vec<FailedPoint> },
}

impl UpsertOutcome {
    pub fn written(&self) -> usize {
        match self {
            UpsertOutcome::Success { written } | UpsertOutcome::Partial { written, .. } => *written,
            UpsertOutcome::Failure { .. } => 0,
        }
    }

    pub fn failed(&self) -> &[FailedPoint] {
        match self {
            UpsertOutcome::Success { .. } => &[],
            UpsertOutcome::Partial { failed, .. } | UpsertOutcome::Failure { failed, .. } => failed,
        }
    }
}

/// One bulk write; on failure the batch is resubmitted in `sub_batch_size` groups, each
/// retried with backoff. Groups that still fail are logged point by point and reported.
pub async fn upsert_with_policy<S>(
    store: &S,
    points: &[StoredPoint],
    policy: &RetryPolicy,
) -> UpsertOutcome
where
    S: VectorStore + ?Sized,
{
    if points.is_empty() {
        return UpsertOutcome::Success { written: 0 };
    }

    match store.upsert(points).await {
        Ok(()) => {
            return UpsertOutcome::Success {
                written: points.len(),
            }
        }
        Err(error) => warn!(
            points = points.len(),
            sub_batch_size = policy.sub_batch_size,
            %error,
            "bulk upsert failed; resubmitting in sub-batches"
        ),
    }

    let mut written = 0;
    let mut failed = Vec::new();
    let mut last_cause = String::new();

    for group in points.chunks(policy.sub_batch_size.max(1)) {
        match policy.retry("upsert", || store.upsert(group)).await {
            Ok(()) => written += group.len(),
            Err(error) => {
                let cause = error.to_string();
                for point in group {
                    warn!(
                        point_id = point.id,
                        source = %point.payload.doc_source,
                        error = %cause,
                        "point not stored; re-ingest manually"
                    );
                    failed.push(FailedPoint {
                        id: point.id,
                        source: point.payload.doc_source.clone(),
                        cause: cause.clone(),
                    });
                }
                last_cause = cause;
            }
        }
    }

    if failed.is_empty() {
        UpsertOutcome::Success { written }
    } else if written == 0 {
        UpsertOutcome::Failure {
            cause: last_cause,
            failed,
        }
    } else {
        UpsertOutcome::Partial { written, failed }
    }
}

/// Largest point id in the collection, 0 when it is empty.
pub async fn max_point_id<S>(store: &S, page_size: usize) -> Result<u64, SearchError>
where
    S: VectorStore + ?Sized,
{
    let mut max_id = 0;
    let mut offset = None;

    loop {
        let page = store.scroll_ids(offset, page_size.max(1)).await?;
        if let Some(page_max) = page.ids.iter().copied().max() {
            max_id = max_id.max(page_max);
        }

        match page.next_offset {
            None => break,
            Some(next) if Some(next) == offset => {
                return Err(SearchError::BackendResponse {
                    backend: "scroll".to_string(),
                    details: format!("cursor did not advance past {next}"),
                })
            }
            Some(next) => offset = Some(next),
        }
    }

    Ok(max_id)
}

/// Next safe document id given everything already stored.
pub async fn allocate_doc_id_start<S>(store: &S) -> Result<u64, SearchError>
where
    S: VectorStore + ?Sized,
{
    Ok(next_doc_id_start(max_point_id(store, SCROLL_PAGE_SIZE).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PointPayload, ScoredPoint, SearchQuery};
    use crate::stores::InMemoryStore;
    use crate::traits::ScrollPage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            sub_batch_size: 5,
        }
    }

    fn point(id: u64, dims: usize) -> StoredPoint {
        StoredPoint {
            id,
            vector: vec![1.0; dims],
            payload: PointPayload {
                doc_title: format!("doc-{id}"),
                doc_source: format!("source-{id}.pdf"),
                raw_text: "body".to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn malformed_point_only_blocks_its_sub_batch() {
        let store = InMemoryStore::new(4);
        let mut points: Vec<StoredPoint> = (0..200).map(|i| point(1_000 + i, 4)).collect();
        points[151] = point(1_151, 3);

        let outcome = upsert_with_policy(&store, &points, &quick_policy()).await;

        let failed_ids: Vec<u64> = outcome.failed().iter().map(|failed| failed.id).collect();
        assert_eq!(failed_ids, vec![1_150, 1_151, 1_152, 1_153, 1_154]);
        assert_eq!(outcome.written(), 195);
        assert!(matches!(outcome, UpsertOutcome::Partial { .. }));
        assert_eq!(store.len(), 195);
        assert_eq!(outcome.failed()[1].source, "source-1151.pdf");
    }

    #[tokio::test]
    async fn clean_batch_is_written_in_one_call() {
        let store = InMemoryStore::new(4);
        let points: Vec<StoredPoint> = (0..12).map(|i| point(i, 4)).collect();
        let outcome = upsert_with_policy(&store, &points, &quick_policy()).await;
        assert_eq!(outcome, UpsertOutcome::Success { written: 12 });
    }

    #[tokio::test]
    async fn all_bad_points_is_a_failure() {
        let store = InMemoryStore::new(4);
        let points: Vec<StoredPoint> = (0..3).map(|i| point(i, 2)).collect();
        let outcome = upsert_with_policy(&store, &points, &quick_policy()).await;
        assert!(matches!(outcome, UpsertOutcome::Failure { ref failed, .. } if failed.len() == 3));
    }

    /// Rejects the first `failures` upsert calls, then behaves.
    struct FlakyStore {
        inner: InMemoryStore,
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VectorStore for FlakyStore {
        fn vector_size(&self) -> usize {
            self.inner.vector_size()
        }

        async fn recreate_collection(&self) -> Result<(), SearchError> {
            self.inner.recreate_collection().await
        }

        async fn ensure_collection(&self) -> Result<(), SearchError> {
            Ok(())
        }

        async fn scroll_ids(&self, offset: Option<u64>, limit: usize) -> Result<ScrollPage, SearchError> {
            self.inner.scroll_ids(offset, limit).await
        }

        async fn upsert(&self, points: &[StoredPoint]) -> Result<(), SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SearchError::NotReady("flaky".to_string()));
            }
            self.inner.upsert(points).await
        }

        async fn search(
            &self,
            query_vector: &[f32],
            query: &SearchQuery,
        ) -> Result<Vec<ScoredPoint>, SearchError> {
            self.inner.search(query_vector, query).await
        }
    }

    #[tokio::test]
    async fn transient_sub_batch_failure_is_retried() {
        let store = FlakyStore {
            inner: InMemoryStore::new(4),
            failures: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
        };
        let points: Vec<StoredPoint> = (0..7).map(|i| point(i, 4)).collect();

        let outcome = upsert_with_policy(&store, &points, &quick_policy()).await;

        assert_eq!(outcome, UpsertOutcome::Success { written: 7 });
        // bulk, first group twice, second group once
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn max_id_scan_pages_through_collection() {
        let store = InMemoryStore::new(4);
        assert_eq!(max_point_id(&store, 3).await.expect("scan"), 0);
        assert_eq!(allocate_doc_id_start(&store).await.expect("alloc"), 1);

        let points: Vec<StoredPoint> = [1_000, 1_001, 2_004, 3_999, 2_000, 5]
            .into_iter()
            .map(|id| point(id, 4))
            .collect();
        store.upsert(&points).await.expect("upsert");

        let first = max_point_id(&store, 2).await.expect("scan");
        let second = max_point_id(&store, 2).await.expect("scan");
        assert_eq!(first, 3_999);
        assert_eq!(first, second);
        assert_eq!(allocate_doc_id_start(&store).await.expect("alloc"), 4);
    }
}
